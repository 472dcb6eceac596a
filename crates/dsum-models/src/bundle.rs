//! Published result bundle.

use chrono::{DateTime, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::run::{BundleKey, Run, RunId};
use crate::score::Score;
use crate::selection::SelectionResult;

/// Scores of the best frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BundleScores {
    pub person_score: f64,
    pub face_score: f64,
    pub frame_score: f64,
    #[serde(default)]
    pub pose: String,
}

impl From<&Score> for BundleScores {
    fn from(score: &Score) -> Self {
        Self {
            person_score: score.person_score,
            face_score: score.face_score,
            frame_score: score.frame_score,
            pose: score.pose.clone(),
        }
    }
}

/// Capture timing of the run that produced a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CaptureTiming {
    pub capture_started_epoch: f64,
    pub capture_ended_epoch: f64,
    pub capture_duration_s: f64,
    /// Portion of the capture with the trigger active
    #[serde(default)]
    pub motion_detected_s: f64,
    /// Capture time past the end of motion (off-grace and polling)
    #[serde(default)]
    pub buffer_overhang_s: f64,
    pub capture_timed_out: bool,
    pub captured_frames: usize,
    pub scored_frames: usize,
}

impl CaptureTiming {
    pub fn from_run(run: &Run, captured_frames: usize, scored_frames: usize) -> Self {
        let ended = run.ended_ts.unwrap_or(run.started_ts);
        let duration = (ended - run.started_ts).max(0.0);
        let motion = run.motion_on_s.clamp(0.0, duration);
        Self {
            capture_started_epoch: run.started_ts,
            capture_ended_epoch: ended,
            capture_duration_s: round3(duration),
            motion_detected_s: round3(motion),
            buffer_overhang_s: round3(duration - motion),
            capture_timed_out: run.timed_out,
            captured_frames,
            scored_frames,
        }
    }
}

/// Where a bundle's files live (platform paths).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BundleArtifacts {
    pub run_dir: String,
    pub best_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_generated_path: Option<String>,
}

/// Final artifact of a successful run. Superseded, never deleted, by the
/// next successful run for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Bundle {
    pub bundle_key: BundleKey,
    pub run_id: RunId,
    pub created_at_epoch: f64,
    pub created_at_utc: String,
    pub summary: String,
    /// Empty when no illustration was generated
    #[serde(default)]
    pub generated_image_url: String,
    pub captured_count: usize,
    pub best_frame_index: usize,
    #[serde(default)]
    pub best: BundleScores,
    #[serde(default)]
    pub timing: CaptureTiming,
    #[serde(default)]
    pub artifacts: BundleArtifacts,
    pub trigger_entity_id: String,
    pub camera_entity_id: String,
    /// Selection trace for tooling
    #[serde(default)]
    pub selection: SelectionResult,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at_utc: Option<String>,
}

impl Bundle {
    /// Ranking score used when picking the best bundle in a window.
    pub fn score(&self) -> f64 {
        self.best.person_score
    }
}

/// RFC 3339 UTC rendering of epoch seconds.
pub fn utc_iso(epoch: f64) -> String {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .map(|dt: DateTime<Utc>| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_iso() {
        assert_eq!(utc_iso(0.0), "1970-01-01T00:00:00Z");
        assert_eq!(utc_iso(86_400.5), "1970-01-02T00:00:00Z");
    }

    #[test]
    fn test_timing_from_run() {
        let mut run = Run::new(BundleKey::from("porch"), "binary_sensor.porch", "camera.porch", 10.0);
        run.ended_ts = Some(25.12345);
        run.timed_out = true;
        run.motion_on_s = 10.0;
        let timing = CaptureTiming::from_run(&run, 5, 3);
        assert_eq!(timing.capture_duration_s, 15.123);
        assert_eq!(timing.motion_detected_s, 10.0);
        assert_eq!(timing.buffer_overhang_s, 5.123);
        assert!(timing.capture_timed_out);
        assert_eq!(timing.captured_frames, 5);
    }
}
