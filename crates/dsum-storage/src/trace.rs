//! Selection trace output.
//!
//! Layout under the run directory:
//!
//! ```text
//! trace/
//!   best/frame_NNN.jpg
//!   selected/frame_NNN.jpg ...
//!   meta.json
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use dsum_models::{Frame, FrameStore, Score, SelectionResult};

use crate::error::StorageResult;
use crate::fs_utils::{copy_file, write_atomic};

/// Which trace artifacts to write.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub enabled: bool,
    pub copy_selected_frames: bool,
    pub copy_best_frame: bool,
    /// Cap on frame copies per run (best and selected together)
    pub max_copies: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            copy_selected_frames: true,
            copy_best_frame: true,
            max_copies: 50,
        }
    }
}

/// What a trace write produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceReport {
    pub best_copied: bool,
    pub selected_copied: usize,
    pub meta_written: bool,
}

impl TraceReport {
    pub fn copies(&self) -> usize {
        self.selected_copied + usize::from(self.best_copied)
    }
}

#[derive(Debug, Serialize)]
struct TraceMeta<'a> {
    budget: usize,
    probes: &'a [usize],
    scored_indices: Vec<usize>,
    ranked_shortlist: &'a [usize],
    best_idx: Option<usize>,
    cutoff_triggered: bool,
    calls_issued: usize,
    failed_calls: usize,
    scored: BTreeMap<usize, TraceScore<'a>>,
}

#[derive(Debug, Serialize)]
struct TraceScore<'a> {
    person_score: f64,
    face_score: f64,
    frame_score: f64,
    pose: &'a str,
    summary: &'a str,
}

impl<'a> From<&'a Score> for TraceScore<'a> {
    fn from(s: &'a Score) -> Self {
        Self {
            person_score: s.person_score,
            face_score: s.face_score,
            frame_score: s.frame_score,
            pose: &s.pose,
            summary: &s.summary,
        }
    }
}

/// Write the trace for one run. A disabled config writes nothing.
pub async fn write_trace(
    local_run_dir: &Path,
    frames: &FrameStore,
    selection: &SelectionResult,
    cfg: &TraceConfig,
) -> StorageResult<TraceReport> {
    let mut report = TraceReport::default();
    if !cfg.enabled {
        return Ok(report);
    }

    let trace_dir = local_run_dir.join("trace");
    let mut budget = cfg.max_copies;

    if cfg.copy_best_frame && budget > 0 {
        if let Some(frame) = selection.best_frame_index.and_then(|i| frames.get(i)) {
            if copy_frame(frame, &trace_dir.join("best")).await? {
                report.best_copied = true;
                budget -= 1;
            }
        }
    }

    if cfg.copy_selected_frames {
        for idx in selection.scored_indices() {
            if budget == 0 {
                break;
            }
            if let Some(frame) = frames.get(idx) {
                if copy_frame(frame, &trace_dir.join("selected")).await? {
                    report.selected_copied += 1;
                    budget -= 1;
                }
            }
        }
    }

    let meta = TraceMeta {
        budget: selection.budget,
        probes: &selection.probes,
        scored_indices: selection.scored_indices(),
        ranked_shortlist: &selection.ranked_shortlist,
        best_idx: selection.best_frame_index,
        cutoff_triggered: selection.cutoff_triggered,
        calls_issued: selection.calls_issued,
        failed_calls: selection.failed_calls,
        scored: selection
            .scores
            .iter()
            .map(|s| (s.frame_index, TraceScore::from(s)))
            .collect(),
    };
    write_atomic(trace_dir.join("meta.json"), &serde_json::to_vec_pretty(&meta)?).await?;
    report.meta_written = true;

    debug!(
        dir = %trace_dir.display(),
        copies = report.copies(),
        "Trace written"
    );
    Ok(report)
}

/// Copy a frame into `dir`; a frame whose file never landed is skipped.
async fn copy_frame(frame: &Frame, dir: &Path) -> StorageResult<bool> {
    if !tokio::fs::try_exists(&frame.path).await.unwrap_or(false) {
        return Ok(false);
    }
    copy_file(&frame.path, dir.join(Frame::file_name(frame.index))).await?;
    Ok(true)
}
