//! Zone runner: one bundle key from trigger to published bundle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use dsum_clients::{CameraPlatform, FrameScorer, IllustrationGenerator};
use dsum_models::{epoch_now, BundleKey, Run, RunEvent};
use dsum_storage::BundleStore;

use crate::capture::CaptureController;
use crate::config::ZoneConfig;
use crate::cooldown::{Admission, CooldownScheduler};
use crate::error::{RunOutcome, WorkerResult};
use crate::logging::RunLogger;
use crate::metrics;
use crate::notifier::Notifier;
use crate::publisher::BundlePublisher;
use crate::selection::SelectionEngine;

/// How long shutdown waits for in-flight runs.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity and cooldown settings of a zone.
#[derive(Debug, Clone)]
pub struct ZoneIdentity {
    pub bundle_key: BundleKey,
    pub trigger_entity_id: String,
    pub camera_entity_id: String,
    pub cooldown_s: f64,
    pub cooldown_backoff_max_s: f64,
}

impl From<&ZoneConfig> for ZoneIdentity {
    fn from(zone: &ZoneConfig) -> Self {
        Self {
            bundle_key: zone.key(),
            trigger_entity_id: zone.trigger_entity_id.clone(),
            camera_entity_id: zone.camera_entity_id.clone(),
            cooldown_s: zone.cooldown_s.max(0.0),
            cooldown_backoff_max_s: zone.cooldown_backoff_max_s.max(0.0),
        }
    }
}

/// External services a zone runner is built on.
#[derive(Clone)]
pub struct ZoneServices {
    pub camera: Arc<dyn CameraPlatform>,
    pub scorer: Arc<dyn FrameScorer>,
    /// `None` disables illustration generation
    pub generator: Option<Arc<dyn IllustrationGenerator>>,
    pub store: Arc<BundleStore>,
    pub notifier: Arc<Notifier>,
    pub scheduler: CooldownScheduler,
}

pub struct ZoneRunner {
    identity: ZoneIdentity,
    scheduler: CooldownScheduler,
    capture: CaptureController,
    engine: SelectionEngine,
    publisher: BundlePublisher,
    notifier: Arc<Notifier>,
}

impl ZoneRunner {
    pub fn new(
        identity: ZoneIdentity,
        scheduler: CooldownScheduler,
        capture: CaptureController,
        engine: SelectionEngine,
        publisher: BundlePublisher,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            identity,
            scheduler,
            capture,
            engine,
            publisher,
            notifier,
        }
    }

    /// Wire a runner for `zone` on top of `services`.
    pub fn from_config(zone: &ZoneConfig, services: ZoneServices, retention_hours: f64) -> WorkerResult<Self> {
        let layout = zone.layout();
        let policy = zone.rank_policy_name()?.policy();

        let capture = CaptureController::new(Arc::clone(&services.camera), layout.clone(), zone.capture_settings());
        let engine = SelectionEngine::new(services.scorer, policy, zone.selection_settings());
        let publisher = BundlePublisher::new(
            layout,
            services.camera,
            services.generator,
            services.store,
            Arc::clone(&services.notifier),
            zone.publish_settings(retention_hours),
        );

        Ok(Self::new(
            ZoneIdentity::from(zone),
            services.scheduler,
            capture,
            engine,
            publisher,
            services.notifier,
        ))
    }

    pub fn bundle_key(&self) -> &BundleKey {
        &self.identity.bundle_key
    }

    /// Handle one trigger rising edge.
    ///
    /// Returns `None` when the trigger was rejected by the cooldown gate.
    pub async fn handle_trigger(&self, mut motion: watch::Receiver<bool>) -> Option<RunOutcome> {
        let key = &self.identity.bundle_key;
        let started_ts = epoch_now();

        let permit = match self.scheduler.try_admit(
            key,
            self.identity.cooldown_s,
            self.identity.cooldown_backoff_max_s,
            started_ts,
        ) {
            Admission::Admitted(permit) => permit,
            Admission::Rejected(rejection) => {
                metrics::record_run_rejected(key.as_str(), rejection.as_str());
                debug!(bundle_key = %key, reason = rejection.as_str(), "Trigger ignored: {}", rejection);
                return None;
            }
        };

        let mut run = Run::new(
            key.clone(),
            self.identity.trigger_entity_id.clone(),
            self.identity.camera_entity_id.clone(),
            started_ts,
        );
        let logger = RunLogger::new(&run.run_id, key, "run");
        let span = logger.create_span();

        async move {
            let clock = Instant::now();
            logger.log_start(&format!(
                "trigger {} fired, capturing {}",
                run.trigger_entity_id, run.camera_entity_id
            ));
            metrics::record_run_started(key.as_str());
            self.notifier
                .emit(RunEvent::RunStarted {
                    bundle_key: key.clone(),
                    run_id: run.run_id.clone(),
                    started_ts: run.started_ts,
                    trigger_entity_id: run.trigger_entity_id.clone(),
                    camera_entity_id: run.camera_entity_id.clone(),
                })
                .await;

            let frames = self
                .capture
                .capture(&mut run, &mut motion, &logger.for_operation("capture"))
                .await;
            self.notifier
                .emit(RunEvent::RunCaptureDone {
                    bundle_key: key.clone(),
                    run_id: run.run_id.clone(),
                    captured_count: frames.len(),
                    ended_ts: run.ended_ts.unwrap_or(run.started_ts),
                    timed_out: run.timed_out,
                })
                .await;

            let selection = self
                .engine
                .select(&run.run_id, &frames, &logger.for_operation("selection"))
                .await;

            let outcome = self
                .publisher
                .publish(&run, &frames, selection, permit, &logger.for_operation("publish"))
                .await;

            metrics::record_run_completed(key.as_str(), outcome.as_str(), clock.elapsed().as_secs_f64());
            Some(outcome)
        }
        .instrument(span)
        .await
    }

    /// Start a run on every rising edge of `motion` until `shutdown`.
    ///
    /// Runs still in flight at shutdown get a bounded time to finish.
    pub async fn run(self: Arc<Self>, mut motion: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut previous = *motion.borrow_and_update();
        let mut tasks = JoinSet::new();
        info!(
            bundle_key = %self.identity.bundle_key,
            trigger = %self.identity.trigger_entity_id,
            camera = %self.identity.camera_entity_id,
            "Zone runner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                changed = motion.changed() => {
                    if changed.is_err() {
                        warn!(bundle_key = %self.identity.bundle_key, "Trigger channel closed, stopping zone");
                        break;
                    }
                    let on = *motion.borrow_and_update();
                    if on && !previous {
                        let runner = Arc::clone(&self);
                        let motion = motion.clone();
                        tasks.spawn(async move {
                            runner.handle_trigger(motion).await;
                        });
                    }
                    previous = on;
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        if !tasks.is_empty() {
            info!(
                bundle_key = %self.identity.bundle_key,
                "Waiting for {} in-flight runs",
                tasks.len()
            );
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(bundle_key = %self.identity.bundle_key, "Abandoning runs still in flight");
                tasks.abort_all();
            }
        }
        info!(bundle_key = %self.identity.bundle_key, "Zone runner stopped");
    }
}
