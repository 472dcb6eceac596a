//! Trigger entity polling.
//!
//! Turns the trigger entity's state into a `watch` channel of "triggered"
//! flags. Capture and the zone runner only ever see that channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use dsum_clients::{ClientResult, HomeAssistantClient};

use crate::retry::FailureTracker;

/// Anything that can report an entity's current state.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    async fn trigger_state(&self, entity_id: &str) -> ClientResult<String>;
}

#[async_trait]
impl TriggerSource for HomeAssistantClient {
    async fn trigger_state(&self, entity_id: &str) -> ClientResult<String> {
        Ok(self.get_state(entity_id).await?.state)
    }
}

/// Whether `state` means the trigger is active.
pub fn is_triggered(state: &str, trigger_to: &str) -> bool {
    state.trim().eq_ignore_ascii_case(trigger_to.trim())
}

/// Polls one trigger entity and publishes its triggered flag.
pub struct MotionPoller {
    source: Arc<dyn TriggerSource>,
    entity_id: String,
    trigger_to: String,
    interval: Duration,
}

impl MotionPoller {
    pub fn new(
        source: Arc<dyn TriggerSource>,
        entity_id: impl Into<String>,
        trigger_to: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            entity_id: entity_id.into(),
            trigger_to: trigger_to.into(),
            interval: interval.max(Duration::from_millis(50)),
        }
    }

    /// Start polling until `shutdown` flips to true.
    ///
    /// A failed poll keeps the last known value.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failures = FailureTracker::new(3);
            info!(entity = %self.entity_id, trigger_to = %self.trigger_to, "Polling trigger entity");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.source.trigger_state(&self.entity_id).await {
                            Ok(state) => {
                                failures.record_success();
                                let on = is_triggered(&state, &self.trigger_to);
                                let changed = tx.send_if_modified(|current| {
                                    let changed = *current != on;
                                    *current = on;
                                    changed
                                });
                                if changed {
                                    debug!(entity = %self.entity_id, state = %state, on, "Trigger changed");
                                }
                            }
                            Err(e) => {
                                if failures.record_failure() {
                                    warn!(entity = %self.entity_id, "Trigger poll failed: {}", e);
                                }
                            }
                        }
                    }
                }
            }
            debug!(entity = %self.entity_id, "Trigger polling stopped");
        });

        (rx, handle)
    }
}
