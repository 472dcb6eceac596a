//! Run lifecycle notifications.
//!
//! Events go to every configured sink. A sink failure is logged and never
//! affects the run that emitted the event.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use dsum_clients::HomeAssistantClient;
use dsum_models::RunEvent;

use crate::error::{WorkerError, WorkerResult};

/// Destination for run events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &RunEvent) -> WorkerResult<()>;

    fn name(&self) -> &'static str;
}

/// In-process fan-out of run events.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<RunEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: &RunEvent) -> WorkerResult<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

/// Fires events on the Home Assistant event bus
/// (`detection_summary/run_started` and friends).
pub struct HomeAssistantSink {
    client: Arc<HomeAssistantClient>,
}

impl HomeAssistantSink {
    pub fn new(client: Arc<HomeAssistantClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for HomeAssistantSink {
    async fn emit(&self, event: &RunEvent) -> WorkerResult<()> {
        let event_type = event.event_type().bus_name();
        self.client
            .fire_event(&event_type, &event.payload())
            .await
            .map_err(|e| WorkerError::notify_failed(format!("{}: {}", event_type, e)))
    }

    fn name(&self) -> &'static str {
        "home_assistant"
    }
}

/// Sends each event to every sink in order.
#[derive(Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn emit(&self, event: RunEvent) {
        for sink in &self.sinks {
            match sink.emit(&event).await {
                Ok(()) => debug!(
                    sink = sink.name(),
                    run_id = %event.run_id(),
                    event = event.event_type().as_str(),
                    "Event emitted"
                ),
                Err(e) => warn!(
                    sink = sink.name(),
                    run_id = %event.run_id(),
                    event = event.event_type().as_str(),
                    "Failed to emit event: {}", e
                ),
            }
        }
    }
}
