//! Shared data models for the detection summary pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Runs, bundle keys and capture state
//! - Captured frames and the per-run frame store
//! - Frame scores and selection results
//! - Per-zone cooldown entries
//! - Published bundles and lifecycle notifications

pub mod bundle;
pub mod cooldown;
pub mod event;
pub mod frame;
pub mod run;
pub mod score;
pub mod selection;

// Re-export common types
pub use bundle::{utc_iso, Bundle, BundleArtifacts, BundleScores, CaptureTiming};
pub use cooldown::CooldownEntry;
pub use event::{RunEvent, RunEventType};
pub use frame::{Frame, FrameStore};
pub use run::{BundleKey, Run, RunId, RunState};
pub use score::{pose_rank, FrameAssessment, Score, ScoreSource};
pub use selection::SelectionResult;

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
