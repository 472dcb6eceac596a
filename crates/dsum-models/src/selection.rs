//! Selection engine output.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::score::Score;

/// Result of narrowing a run's frames down to a best frame and shortlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectionResult {
    /// Highest-ranked frame above the no-people threshold, if any
    pub best_frame_index: Option<usize>,
    /// Frame indices, best first, capped for illustration generation
    pub ranked_shortlist: Vec<usize>,
    /// Number of scores available after selection
    pub scores_computed: usize,
    /// Whether any search branch was abandoned by the no-people cutoff
    pub cutoff_triggered: bool,
    /// External calls issued (successful or not)
    pub calls_issued: usize,
    /// External calls that failed or timed out
    pub failed_calls: usize,
    /// Scoring budget in effect for the run
    pub budget: usize,
    /// Frame indices in the order they were requested
    pub probes: Vec<usize>,
    /// Every successful score, ordered by frame index
    pub scores: Vec<Score>,
}

impl SelectionResult {
    /// Selection over an empty frame store.
    pub fn empty(budget: usize) -> Self {
        Self {
            budget,
            ..Default::default()
        }
    }

    /// A usable result has a best frame to publish.
    pub fn is_usable(&self) -> bool {
        self.best_frame_index.is_some()
    }

    /// True when calls were made and none of them succeeded.
    pub fn all_calls_failed(&self) -> bool {
        self.calls_issued > 0 && self.failed_calls == self.calls_issued
    }

    pub fn score_for(&self, frame_index: usize) -> Option<&Score> {
        self.scores.iter().find(|s| s.frame_index == frame_index)
    }

    pub fn best_score(&self) -> Option<&Score> {
        self.best_frame_index.and_then(|idx| self.score_for(idx))
    }

    /// Scored frame indices in ascending order.
    pub fn scored_indices(&self) -> Vec<usize> {
        self.scores.iter().map(|s| s.frame_index).collect()
    }
}
