//! Structured run logging.
//!
//! Every line emitted for a run carries its run ID, bundle key and the
//! pipeline stage, so a single run can be followed across capture,
//! selection and publishing.

use tracing::{error, info, warn, Span};

use dsum_models::{BundleKey, RunId};

/// Logger bound to one run and one pipeline stage.
#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
    bundle_key: String,
    operation: String,
}

impl RunLogger {
    /// Create a logger for `run_id` in `bundle_key`.
    ///
    /// # Arguments
    /// * `operation` - Pipeline stage (e.g. "capture", "selection", "publish")
    pub fn new(run_id: &RunId, bundle_key: &BundleKey, operation: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            bundle_key: bundle_key.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Same run, different stage.
    pub fn for_operation(&self, operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..self.clone()
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            bundle_key = %self.bundle_key,
            operation = %self.operation,
            "Run started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            bundle_key = %self.bundle_key,
            operation = %self.operation,
            "Run progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            run_id = %self.run_id,
            bundle_key = %self.bundle_key,
            operation = %self.operation,
            "Run warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            run_id = %self.run_id,
            bundle_key = %self.bundle_key,
            operation = %self.operation,
            "Run error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            bundle_key = %self.bundle_key,
            operation = %self.operation,
            "Run completed: {}", message
        );
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn bundle_key(&self) -> &str {
        &self.bundle_key
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Span wrapping a whole run task.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "run",
            run_id = %self.run_id,
            bundle_key = %self.bundle_key,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_logger_creation() {
        let run_id = RunId::from_string("run-123");
        let logger = RunLogger::new(&run_id, &BundleKey::from("porch"), "capture");

        assert_eq!(logger.run_id(), "run-123");
        assert_eq!(logger.bundle_key(), "porch");
        assert_eq!(logger.operation(), "capture");
    }

    #[test]
    fn test_for_operation_keeps_run() {
        let logger = RunLogger::new(&RunId::from_string("r1"), &BundleKey::from("garage"), "capture");
        let publish = logger.for_operation("publish");

        assert_eq!(publish.run_id(), "r1");
        assert_eq!(publish.bundle_key(), "garage");
        assert_eq!(publish.operation(), "publish");
    }
}
