//! Worker error types and run outcomes.

use std::fmt;

use thiserror::Error;

use dsum_models::Bundle;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Notification failed: {0}")]
    NotifyFailed(String),

    #[error("Client error: {0}")]
    Client(#[from] dsum_clients::ClientError),

    #[error("Storage error: {0}")]
    Storage(#[from] dsum_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn notify_failed(msg: impl Into<String>) -> Self {
        Self::NotifyFailed(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Client(e) => e.is_retryable(),
            WorkerError::Storage(_) | WorkerError::Io(_) | WorkerError::NotifyFailed(_) => true,
            WorkerError::ConfigError(_) => false,
        }
    }
}

/// Why a run ended without a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoResultReason {
    /// No frames were captured
    EmptyCapture,
    /// Every scoring call failed
    AllScoringFailed,
    /// No scored frame cleared the no-people threshold
    NothingAboveThreshold,
}

impl NoResultReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoResultReason::EmptyCapture => "empty_capture",
            NoResultReason::AllScoringFailed => "all_scoring_failed",
            NoResultReason::NothingAboveThreshold => "nothing_above_threshold",
        }
    }
}

impl fmt::Display for NoResultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended. None of these is fatal to the process.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A bundle was written and `run_published` emitted
    Published(Box<Bundle>),
    /// Nothing worth publishing; cooldown backs off
    NoUsableResult { reason: NoResultReason },
    /// A best frame was chosen but the illustration failed; cooldown backs off
    GenerationFailed { error: String },
}

impl RunOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, RunOutcome::Published(_))
    }

    /// Label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Published(_) => "published",
            RunOutcome::NoUsableResult { .. } => "no_usable_result",
            RunOutcome::GenerationFailed { .. } => "generation_failed",
        }
    }

    pub fn bundle(&self) -> Option<&Bundle> {
        match self {
            RunOutcome::Published(bundle) => Some(bundle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        let outcome = RunOutcome::NoUsableResult {
            reason: NoResultReason::EmptyCapture,
        };
        assert_eq!(outcome.as_str(), "no_usable_result");
        assert!(!outcome.is_published());
        assert!(outcome.bundle().is_none());
        assert_eq!(NoResultReason::AllScoringFailed.to_string(), "all_scoring_failed");
    }

    #[test]
    fn test_retryable() {
        assert!(!WorkerError::config_error("bad").is_retryable());
        assert!(WorkerError::notify_failed("bus down").is_retryable());
    }
}
