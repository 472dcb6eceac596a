//! Per-zone cooldown state.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cooldown state for one bundle key.
///
/// `current_backoff_s` starts at `base_cooldown_s`, doubles after a run with
/// no usable result (capped at `max_backoff_s`) and resets on a successful
/// publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CooldownEntry {
    /// Epoch seconds; `None` until the first run ends
    pub last_run_ended_ts: Option<f64>,
    pub base_cooldown_s: f64,
    pub current_backoff_s: f64,
    pub max_backoff_s: f64,
}

impl CooldownEntry {
    pub fn new(base_cooldown_s: f64, max_backoff_s: f64) -> Self {
        let base = base_cooldown_s.max(0.0);
        Self {
            last_run_ended_ts: None,
            base_cooldown_s: base,
            current_backoff_s: base,
            max_backoff_s: max_backoff_s.max(base),
        }
    }

    /// Whether a trigger at `now` may start a run.
    pub fn admits(&self, now: f64) -> bool {
        match self.last_run_ended_ts {
            None => true,
            Some(ended) => now - ended >= self.current_backoff_s,
        }
    }

    /// Seconds until the window reopens (0 when already open).
    pub fn remaining_s(&self, now: f64) -> f64 {
        match self.last_run_ended_ts {
            None => 0.0,
            Some(ended) => (self.current_backoff_s - (now - ended)).max(0.0),
        }
    }

    /// Successful publish: back to the base cooldown.
    pub fn reset(&mut self, ended_ts: f64) {
        self.last_run_ended_ts = Some(ended_ts);
        self.current_backoff_s = self.base_cooldown_s;
    }

    /// Unproductive run: double the backoff up to the cap.
    pub fn back_off(&mut self, ended_ts: f64) {
        self.last_run_ended_ts = Some(ended_ts);
        let doubled = if self.current_backoff_s > 0.0 {
            self.current_backoff_s * 2.0
        } else {
            self.base_cooldown_s
        };
        self.current_backoff_s = doubled.min(self.max_backoff_s);
    }
}
