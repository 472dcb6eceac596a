//! Run identity and lifecycle.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one capture-to-publish cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in task names and log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical zone identifier. Runs and cooldown state are tracked per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BundleKey(pub String);

impl BundleKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BundleKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BundleKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Capture state of a run.
///
/// `Done` and `TimedOut` are terminal; both hand the run to selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting for the trigger
    #[default]
    Idle,
    /// Trigger active, taking snapshots
    Capturing,
    /// Trigger cleared, off-grace timer running
    Draining,
    /// Off-grace elapsed without re-trigger
    Done,
    /// Hard capture limit reached
    TimedOut,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Capturing => "capturing",
            RunState::Draining => "draining",
            RunState::Done => "done",
            RunState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::TimedOut)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capture-to-publish cycle for a bundle key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub run_id: RunId,
    pub bundle_key: BundleKey,
    pub trigger_entity_id: String,
    pub camera_entity_id: String,
    /// Epoch seconds
    pub started_ts: f64,
    /// Epoch seconds, set once capture reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_ts: Option<f64>,
    #[serde(default)]
    pub timed_out: bool,
    /// Seconds the trigger was active during capture
    #[serde(default)]
    pub motion_on_s: f64,
    #[serde(default)]
    pub state: RunState,
}

impl Run {
    /// Create a new idle run.
    pub fn new(
        bundle_key: BundleKey,
        trigger_entity_id: impl Into<String>,
        camera_entity_id: impl Into<String>,
        started_ts: f64,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            bundle_key,
            trigger_entity_id: trigger_entity_id.into(),
            camera_entity_id: camera_entity_id.into(),
            started_ts,
            ended_ts: None,
            timed_out: false,
            motion_on_s: 0.0,
            state: RunState::Idle,
        }
    }

    /// Seconds between start and end of capture (0 while still capturing).
    pub fn capture_duration_s(&self) -> f64 {
        self.ended_ts
            .map(|end| (end - self.started_ts).max(0.0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_short() {
        let id = RunId::from_string("0123456789abcdef");
        assert_eq!(id.short(), "01234567");

        let tiny = RunId::from_string("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(!RunState::Capturing.is_terminal());
        assert!(!RunState::Draining.is_terminal());
        assert!(!RunState::Idle.is_terminal());
    }

    #[test]
    fn test_capture_duration() {
        let mut run = Run::new(BundleKey::from("garage"), "binary_sensor.motion", "camera.garage", 100.0);
        assert_eq!(run.capture_duration_s(), 0.0);
        run.ended_ts = Some(142.5);
        assert_eq!(run.capture_duration_s(), 42.5);
    }
}
