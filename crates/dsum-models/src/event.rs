//! Lifecycle notifications consumed by downstream apps.
//!
//! Event names and payload fields match what the home-automation side
//! listens for (`detection_summary/run_started` and friends).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::run::{BundleKey, RunId};

/// Notification types, in the order a run emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    RunCaptureDone,
    RunPublished,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventType::RunStarted => "run_started",
            RunEventType::RunCaptureDone => "run_capture_done",
            RunEventType::RunPublished => "run_published",
        }
    }

    /// Name on the platform event bus.
    pub fn bus_name(&self) -> String {
        format!("detection_summary/{}", self.as_str())
    }
}

/// Notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        bundle_key: BundleKey,
        run_id: RunId,
        started_ts: f64,
        trigger_entity_id: String,
        camera_entity_id: String,
    },

    RunCaptureDone {
        bundle_key: BundleKey,
        run_id: RunId,
        captured_count: usize,
        ended_ts: f64,
        timed_out: bool,
    },

    RunPublished {
        bundle_key: BundleKey,
        run_id: RunId,
        created_at_epoch: f64,
        summary: String,
        generated_image_url: String,
    },
}

impl RunEvent {
    pub fn event_type(&self) -> RunEventType {
        match self {
            RunEvent::RunStarted { .. } => RunEventType::RunStarted,
            RunEvent::RunCaptureDone { .. } => RunEventType::RunCaptureDone,
            RunEvent::RunPublished { .. } => RunEventType::RunPublished,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunCaptureDone { run_id, .. }
            | RunEvent::RunPublished { run_id, .. } => run_id,
        }
    }

    pub fn bundle_key(&self) -> &BundleKey {
        match self {
            RunEvent::RunStarted { bundle_key, .. }
            | RunEvent::RunCaptureDone { bundle_key, .. }
            | RunEvent::RunPublished { bundle_key, .. } => bundle_key,
        }
    }

    /// Payload fields without the `type` tag, as fired on the event bus.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
        }
        value
    }
}
