//! Detection summary worker.
//!
//! This crate provides:
//! - Trigger polling and per-run frame capture
//! - Budgeted frame selection with request coalescing
//! - Per-key cooldown with exponential backoff
//! - Bundle publishing and run lifecycle events
//! - Graceful shutdown

pub mod capture;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod motion;
pub mod notifier;
pub mod publisher;
pub mod retry;
pub mod selection;
pub mod zone;

pub use capture::{CaptureController, CaptureSettings};
pub use config::{WorkerConfig, ZoneConfig, ZonesFile};
pub use cooldown::{Admission, CooldownScheduler, Rejection, RunPermit};
pub use error::{NoResultReason, RunOutcome, WorkerError, WorkerResult};
pub use logging::RunLogger;
pub use motion::{MotionPoller, TriggerSource};
pub use notifier::{BroadcastSink, EventSink, HomeAssistantSink, Notifier};
pub use publisher::{BundlePublisher, PublishSettings};
pub use selection::{RankPolicyName, SelectionEngine, SelectionSettings};
pub use zone::{ZoneIdentity, ZoneRunner, ZoneServices};
