//! `summary.json` written into each published run directory.
//!
//! The human-readable summary block comes first; structured metadata for
//! tooling follows.

use std::path::Path;

use serde::Serialize;

use dsum_models::{Bundle, BundleArtifacts, BundleScores, CaptureTiming, Frame, FrameStore, Score};

use crate::error::StorageResult;
use crate::fs_utils::write_atomic;

#[derive(Debug, Serialize)]
pub struct SummaryBlock<'a> {
    pub run_id: &'a str,
    pub bundle_key: &'a str,
    pub created_at_epoch: f64,
    pub created_at_utc: &'a str,
    pub best_idx: usize,
    pub text: &'a str,
    pub scores: &'a BundleScores,
    pub timing: &'a CaptureTiming,
    pub generated_image_url: &'a str,
}

#[derive(Debug, Serialize)]
pub struct Candidate<'a> {
    pub idx: usize,
    pub image_filename: String,
    pub image_path: String,
    pub person_score: f64,
    pub face_score: f64,
    pub frame_score: f64,
    pub pose: &'a str,
    pub summary: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SelectionTrace<'a> {
    pub budget: usize,
    pub probes: &'a [usize],
    pub scored_indices: Vec<usize>,
    pub ranked_indices_best_to_worst: &'a [usize],
    pub cutoff_triggered: bool,
    pub calls_issued: usize,
    pub failed_calls: usize,
}

/// Serialized form of `summary.json`.
#[derive(Debug, Serialize)]
pub struct BundleDocument<'a> {
    pub summary: SummaryBlock<'a>,
    pub best: &'a BundleScores,
    pub candidates: Vec<Candidate<'a>>,
    pub run_id: &'a str,
    pub bundle_key: &'a str,
    pub camera_entity_id: &'a str,
    pub trigger_entity_id: &'a str,
    pub captured_count: usize,
    pub bundle_artifacts: &'a BundleArtifacts,
    pub selection_trace: SelectionTrace<'a>,
    pub consumed: bool,
}

impl<'a> BundleDocument<'a> {
    pub fn new(bundle: &'a Bundle, frames: &'a FrameStore) -> Self {
        let selection = &bundle.selection;
        let candidates = selection
            .scores
            .iter()
            .map(|score| candidate(score, frames))
            .collect();

        Self {
            summary: SummaryBlock {
                run_id: bundle.run_id.as_str(),
                bundle_key: bundle.bundle_key.as_str(),
                created_at_epoch: bundle.created_at_epoch,
                created_at_utc: &bundle.created_at_utc,
                best_idx: bundle.best_frame_index,
                text: &bundle.summary,
                scores: &bundle.best,
                timing: &bundle.timing,
                generated_image_url: &bundle.generated_image_url,
            },
            best: &bundle.best,
            candidates,
            run_id: bundle.run_id.as_str(),
            bundle_key: bundle.bundle_key.as_str(),
            camera_entity_id: &bundle.camera_entity_id,
            trigger_entity_id: &bundle.trigger_entity_id,
            captured_count: bundle.captured_count,
            bundle_artifacts: &bundle.artifacts,
            selection_trace: SelectionTrace {
                budget: selection.budget,
                probes: &selection.probes,
                scored_indices: selection.scored_indices(),
                ranked_indices_best_to_worst: &selection.ranked_shortlist,
                cutoff_triggered: selection.cutoff_triggered,
                calls_issued: selection.calls_issued,
                failed_calls: selection.failed_calls,
            },
            consumed: bundle.consumed,
        }
    }
}

fn candidate<'a>(score: &'a Score, frames: &FrameStore) -> Candidate<'a> {
    Candidate {
        idx: score.frame_index,
        image_filename: Frame::file_name(score.frame_index),
        image_path: frames
            .path_of(score.frame_index)
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        person_score: score.person_score,
        face_score: score.face_score,
        frame_score: score.frame_score,
        pose: &score.pose,
        summary: &score.summary,
    }
}

/// Write `summary.json` into `local_run_dir`.
pub async fn write_bundle_json(local_run_dir: &Path, bundle: &Bundle, frames: &FrameStore) -> StorageResult<()> {
    let doc = BundleDocument::new(bundle, frames);
    let bytes = serde_json::to_vec_pretty(&doc)?;
    write_atomic(local_run_dir.join("summary.json"), &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsum_models::{utc_iso, BundleKey, FrameAssessment, RunId, ScoreSource, SelectionResult};
    use tempfile::TempDir;

    fn bundle() -> Bundle {
        let assessment = FrameAssessment {
            person_score: 7.0,
            face_score: 2.0,
            frame_score: 6.0,
            pose: "standing".to_string(),
            summary: "Courier at the door".to_string(),
            ..Default::default()
        };
        let score = Score::from_assessment(2, &assessment, 100.0, ScoreSource::Fresh);
        Bundle {
            bundle_key: BundleKey::from("porch"),
            run_id: RunId::from_string("r1"),
            created_at_epoch: 100.0,
            created_at_utc: utc_iso(100.0),
            summary: score.summary.clone(),
            generated_image_url: "/api/camera_proxy/camera.summary".to_string(),
            captured_count: 4,
            best_frame_index: 2,
            best: BundleScores::from(&score),
            timing: CaptureTiming::default(),
            artifacts: BundleArtifacts::default(),
            trigger_entity_id: "binary_sensor.porch_motion".to_string(),
            camera_entity_id: "camera.porch".to_string(),
            selection: SelectionResult {
                best_frame_index: Some(2),
                ranked_shortlist: vec![2],
                scores_computed: 1,
                budget: 4,
                probes: vec![2],
                scores: vec![score],
                ..Default::default()
            },
            consumed: false,
            consumed_at_utc: None,
        }
    }

    #[tokio::test]
    async fn test_summary_json_layout() {
        let dir = TempDir::new().unwrap();
        let mut frames = FrameStore::new();
        for i in 0..4 {
            frames.append(dir.path().join(Frame::file_name(i)), i as f64);
        }

        write_bundle_json(dir.path(), &bundle(), &frames).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("summary.json")).unwrap();
        assert!(raw.trim_start().starts_with("{\n  \"summary\""));
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["summary"]["text"], "Courier at the door");
        assert_eq!(doc["summary"]["best_idx"], 2);
        assert_eq!(doc["candidates"][0]["image_filename"], "frame_002.jpg");
        assert_eq!(doc["selection_trace"]["budget"], 4);
    }
}
