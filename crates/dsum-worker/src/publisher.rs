//! Bundle publisher.
//!
//! Turns a finished run and its selection into a published bundle: copies
//! the best frame, writes the trace, generates and mirrors the
//! illustration, records the bundle and emits `run_published`. Whatever
//! happens, the run's cooldown permit is completed here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dsum_clients::{CameraPlatform, GeneratedImage, IllustrationGenerator};
use dsum_models::{
    epoch_now, utc_iso, Bundle, BundleArtifacts, BundleScores, CaptureTiming, FrameStore, Run, RunEvent,
    SelectionResult,
};
use dsum_storage::{copy_file, mirror_file, write_bundle_json, write_trace, BundleStore, StorageLayout, TraceConfig};

use crate::cooldown::RunPermit;
use crate::error::{NoResultReason, RunOutcome};
use crate::logging::RunLogger;
use crate::notifier::Notifier;
use crate::retry::{retry_async, RetryConfig, RetryResult};

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub write_bundle_json: bool,
    pub trace: TraceConfig,
    /// File-backed camera pointed at the stable illustration
    pub generated_image_camera_entity_id: Option<String>,
    pub image_gen_retries: u32,
    pub retry_base_delay: Duration,
    /// Store retention applied after each publish
    pub retention_hours: f64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            write_bundle_json: true,
            trace: TraceConfig::default(),
            generated_image_camera_entity_id: None,
            image_gen_retries: 1,
            retry_base_delay: Duration::from_secs(2),
            retention_hours: 24.0,
        }
    }
}

pub struct BundlePublisher {
    layout: StorageLayout,
    camera: Arc<dyn CameraPlatform>,
    /// `None` when illustration generation is disabled for the zone
    generator: Option<Arc<dyn IllustrationGenerator>>,
    store: Arc<BundleStore>,
    notifier: Arc<Notifier>,
    settings: PublishSettings,
}

impl BundlePublisher {
    pub fn new(
        layout: StorageLayout,
        camera: Arc<dyn CameraPlatform>,
        generator: Option<Arc<dyn IllustrationGenerator>>,
        store: Arc<BundleStore>,
        notifier: Arc<Notifier>,
        settings: PublishSettings,
    ) -> Self {
        Self {
            layout,
            camera,
            generator,
            store,
            notifier,
            settings,
        }
    }

    /// Publish `run`, complete its permit and report the outcome.
    pub async fn publish(
        &self,
        run: &Run,
        frames: &FrameStore,
        selection: SelectionResult,
        permit: RunPermit,
        logger: &RunLogger,
    ) -> RunOutcome {
        let outcome = self.build(run, frames, selection, logger).await;

        if let RunOutcome::Published(bundle) = &outcome {
            self.notifier
                .emit(RunEvent::RunPublished {
                    bundle_key: bundle.bundle_key.clone(),
                    run_id: bundle.run_id.clone(),
                    created_at_epoch: bundle.created_at_epoch,
                    summary: bundle.summary.clone(),
                    generated_image_url: bundle.generated_image_url.clone(),
                })
                .await;
        }

        let backoff = permit.complete(&outcome, epoch_now());
        match &outcome {
            RunOutcome::Published(bundle) => logger.log_completion(&format!(
                "published frame {} ({}), next run allowed in {:.0}s",
                bundle.best_frame_index, bundle.generated_image_url, backoff
            )),
            RunOutcome::NoUsableResult { reason } => {
                logger.log_warning(&format!("no usable result ({}), backing off to {:.0}s", reason, backoff))
            }
            RunOutcome::GenerationFailed { error } => logger.log_error(&format!(
                "illustration failed: {}, backing off to {:.0}s",
                error, backoff
            )),
        }
        outcome
    }

    async fn build(&self, run: &Run, frames: &FrameStore, selection: SelectionResult, logger: &RunLogger) -> RunOutcome {
        let best = selection
            .best_frame_index
            .and_then(|idx| frames.get(idx).map(|f| (idx, f.path.clone())));
        let Some((best_idx, best_frame_path)) = best else {
            return RunOutcome::NoUsableResult {
                reason: no_result_reason(frames, &selection),
            };
        };

        let run_id = &run.run_id;
        let local_run_dir = self.layout.local_run_dir(run_id);

        let best_local = self.layout.to_local(&self.layout.best_path(run_id));
        if let Err(e) = copy_file(&best_frame_path, &best_local).await {
            logger.log_warning(&format!("could not copy best frame: {}", e));
        }

        match write_trace(&local_run_dir, frames, &selection, &self.settings.trace).await {
            Ok(report) if report.meta_written => {
                logger.log_progress(&format!("trace written ({} frame copies)", report.copies()))
            }
            Ok(_) => {}
            Err(e) => logger.log_warning(&format!("could not write trace: {}", e)),
        }

        let mut generated_path = None;
        let mut stable_generated_path = None;
        let mut generated_image_url = String::new();
        let mut generated_summary = None;

        if let Some(generator) = &self.generator {
            let output = self.layout.to_local(&self.layout.generated_path(run_id));
            let image = match self.generate(generator.as_ref(), &best_frame_path, &output).await {
                Ok(image) => image,
                Err(error) => return RunOutcome::GenerationFailed { error },
            };
            logger.log_progress(&format!(
                "illustration generated by {} ({}) in {:.1}s",
                generator.name(),
                image.model,
                image.elapsed_s
            ));
            generated_path = Some(self.layout.generated_path(run_id));
            generated_summary = image.summary.clone();

            let stable_platform = self.layout.stable_generated_path();
            match mirror_file(&image.output_path, self.layout.to_local(&stable_platform)).await {
                Ok(()) => {
                    generated_image_url = self.point_camera(&stable_platform, logger).await;
                    stable_generated_path = Some(stable_platform);
                }
                Err(e) => {
                    logger.log_warning(&format!("could not mirror illustration: {}", e));
                    generated_image_url = self.layout.generated_path(run_id);
                }
            }
        }

        let best_score = selection.best_score();
        let summary = best_score
            .map(|s| s.summary.trim().to_string())
            .filter(|s| !s.is_empty())
            .or(generated_summary)
            .unwrap_or_default();
        let best_scores = best_score.map(BundleScores::from).unwrap_or_default();

        let created_at_epoch = epoch_now();
        let bundle = Bundle {
            bundle_key: run.bundle_key.clone(),
            run_id: run_id.clone(),
            created_at_epoch,
            created_at_utc: utc_iso(created_at_epoch),
            summary,
            generated_image_url,
            captured_count: frames.len(),
            best_frame_index: best_idx,
            best: best_scores,
            timing: CaptureTiming::from_run(run, frames.len(), selection.scores_computed),
            artifacts: BundleArtifacts {
                run_dir: self.layout.run_dir(run_id),
                best_path: self.layout.best_path(run_id),
                generated_path,
                stable_generated_path,
            },
            trigger_entity_id: run.trigger_entity_id.clone(),
            camera_entity_id: run.camera_entity_id.clone(),
            selection,
            consumed: false,
            consumed_at_utc: None,
        };

        if self.settings.write_bundle_json {
            if let Err(e) = write_bundle_json(&local_run_dir, &bundle, frames).await {
                logger.log_warning(&format!("could not write summary.json: {}", e));
            }
        }
        if let Err(e) = self.store.publish(bundle.clone()).await {
            logger.log_warning(&format!("bundle store not persisted: {}", e));
        }
        match self.store.cleanup(self.settings.retention_hours).await {
            Ok(0) => {}
            Ok(removed) => logger.log_progress(&format!("dropped {} expired bundles", removed)),
            Err(e) => logger.log_warning(&format!("bundle store cleanup failed: {}", e)),
        }

        RunOutcome::Published(Box::new(bundle))
    }

    async fn generate(
        &self,
        generator: &dyn IllustrationGenerator,
        input: &Path,
        output: &Path,
    ) -> Result<GeneratedImage, String> {
        let retry = RetryConfig::new(format!("illustration:{}", generator.name()))
            .with_max_retries(self.settings.image_gen_retries)
            .with_base_delay(self.settings.retry_base_delay);

        match retry_async(&retry, || generator.generate(input, output)).await {
            RetryResult::Success(image) => Ok(image),
            RetryResult::Failed { error, attempts } => Err(format!("{} (after {} attempts)", error, attempts)),
        }
    }

    /// Point the summary camera at `stable_platform` and return the URL
    /// downstream apps should use.
    async fn point_camera(&self, stable_platform: &str, logger: &RunLogger) -> String {
        let Some(entity) = self.settings.generated_image_camera_entity_id.as_deref() else {
            return stable_platform.to_string();
        };
        match self.camera.point_camera(entity, stable_platform).await {
            Ok(()) => format!("/api/camera_proxy/{}", entity),
            Err(e) => {
                logger.log_warning(&format!("could not update {}: {}", entity, e));
                stable_platform.to_string()
            }
        }
    }
}

fn no_result_reason(frames: &FrameStore, selection: &SelectionResult) -> NoResultReason {
    if frames.is_empty() {
        NoResultReason::EmptyCapture
    } else if selection.all_calls_failed() {
        NoResultReason::AllScoringFailed
    } else {
        NoResultReason::NothingAboveThreshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsum_clients::{ClientError, ClientResult};
    use dsum_models::{BundleKey, FrameAssessment, RunEventType, Score, ScoreSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::cooldown::{Admission, CooldownScheduler};
    use crate::notifier::BroadcastSink;

    #[derive(Default)]
    struct RecordingCamera {
        pointed: Mutex<Vec<(String, String)>>,
        fail_point: bool,
    }

    #[async_trait]
    impl CameraPlatform for RecordingCamera {
        async fn snapshot(&self, _camera: &str, _destination: &str) -> ClientResult<()> {
            Ok(())
        }

        async fn point_camera(&self, camera: &str, file_path: &str) -> ClientResult<()> {
            if self.fail_point {
                return Err(ClientError::ServiceUnavailable("ha down".to_string()));
            }
            self.pointed
                .lock()
                .unwrap()
                .push((camera.to_string(), file_path.to_string()));
            Ok(())
        }
    }

    /// Copies the input image to the output path.
    struct CopyGenerator {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IllustrationGenerator for CopyGenerator {
        async fn generate(&self, input: &Path, output: &Path) -> ClientResult<GeneratedImage> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                return Err(ClientError::ServiceUnavailable("busy".to_string()));
            }
            std::fs::create_dir_all(output.parent().unwrap()).unwrap();
            std::fs::copy(input, output).unwrap();
            Ok(GeneratedImage {
                output_path: output.to_path_buf(),
                model: "copy".to_string(),
                elapsed_s: 0.1,
                summary: Some("generated summary".to_string()),
                revised_prompt: None,
            })
        }

        fn name(&self) -> &'static str {
            "copy"
        }
    }

    struct Fixture {
        _dir: TempDir,
        layout: StorageLayout,
        run: Run,
        frames: FrameStore,
        store: Arc<BundleStore>,
        broadcast: Arc<BroadcastSink>,
        scheduler: CooldownScheduler,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new("/media/snapshots/porch", dir.path());
        let mut run = Run::new(BundleKey::from("porch"), "binary_sensor.porch", "camera.porch", 1000.0);
        run.ended_ts = Some(1030.0);

        let mut frames = FrameStore::new();
        for i in 0..3 {
            let path = layout.local_frame_path(&run.run_id, i);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("frame {}", i)).unwrap();
            frames.append(path, 1000.0 + i as f64);
        }

        Fixture {
            _dir: dir,
            layout,
            run,
            frames,
            store: Arc::new(BundleStore::in_memory(10)),
            broadcast: Arc::new(BroadcastSink::new(16)),
            scheduler: CooldownScheduler::new(),
        }
    }

    fn selection(best: Option<usize>, summary: &str) -> SelectionResult {
        let scores: Vec<Score> = best
            .into_iter()
            .map(|idx| {
                let a = FrameAssessment {
                    person_score: 6.0,
                    face_score: 2.0,
                    frame_score: 5.0,
                    summary: summary.to_string(),
                    ..Default::default()
                };
                Score::from_assessment(idx, &a, 0.0, ScoreSource::Fresh)
            })
            .collect();
        SelectionResult {
            best_frame_index: best,
            ranked_shortlist: best.into_iter().collect(),
            scores_computed: scores.len(),
            calls_issued: 3,
            budget: 3,
            scores,
            ..Default::default()
        }
    }

    fn publisher(
        fx: &Fixture,
        camera: Arc<RecordingCamera>,
        generator: Option<Arc<dyn IllustrationGenerator>>,
        settings: PublishSettings,
    ) -> BundlePublisher {
        let notifier = Notifier::default().with_sink(fx.broadcast.clone());
        BundlePublisher::new(fx.layout.clone(), camera, generator, fx.store.clone(), Arc::new(notifier), settings)
    }

    fn permit(fx: &Fixture) -> RunPermit {
        match fx.scheduler.try_admit(&fx.run.bundle_key, 60.0, 1800.0, 0.0) {
            Admission::Admitted(p) => p,
            Admission::Rejected(r) => panic!("rejected: {}", r),
        }
    }

    fn settings() -> PublishSettings {
        PublishSettings {
            generated_image_camera_entity_id: Some("camera.detection_summary".to_string()),
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_full_bundle() {
        let fx = fixture();
        let camera = Arc::new(RecordingCamera::default());
        let generator = Arc::new(CopyGenerator {
            failures_before_success: 1,
            calls: AtomicUsize::new(0),
        });
        let publisher = publisher(&fx, camera.clone(), Some(generator.clone()), settings());
        let mut events = fx.broadcast.subscribe();
        let logger = RunLogger::new(&fx.run.run_id, &fx.run.bundle_key, "publish");

        let outcome = publisher
            .publish(&fx.run, &fx.frames, selection(Some(1), "Courier with a parcel"), permit(&fx), &logger)
            .await;

        let bundle = outcome.bundle().expect("published");
        assert_eq!(bundle.best_frame_index, 1);
        assert_eq!(bundle.summary, "Courier with a parcel");
        assert_eq!(bundle.generated_image_url, "/api/camera_proxy/camera.detection_summary");
        assert_eq!(bundle.captured_count, 3);
        assert_eq!(bundle.timing.capture_duration_s, 30.0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        let run_dir = fx.layout.local_run_dir(&fx.run.run_id);
        assert_eq!(std::fs::read(run_dir.join("best.jpg")).unwrap(), b"frame 1");
        assert!(run_dir.join("summary.json").exists());
        let stable = fx.layout.to_local(&fx.layout.stable_generated_path());
        assert_eq!(std::fs::read(stable).unwrap(), b"frame 1");
        assert_eq!(
            camera.pointed.lock().unwrap().clone(),
            vec![(
                "camera.detection_summary".to_string(),
                "/media/snapshots/porch/detection_summary_generated.png".to_string()
            )]
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), RunEventType::RunPublished);
        assert_eq!(fx.store.len(&fx.run.bundle_key).await, 1);
        let entry = fx.scheduler.entry(&fx.run.bundle_key).unwrap();
        assert_eq!(entry.current_backoff_s, 60.0);
        assert!(!fx.scheduler.is_in_flight(&fx.run.bundle_key));
    }

    #[tokio::test]
    async fn test_no_best_frame_publishes_nothing() {
        let fx = fixture();
        let publisher = publisher(&fx, Arc::new(RecordingCamera::default()), None, settings());
        let mut events = fx.broadcast.subscribe();
        let logger = RunLogger::new(&fx.run.run_id, &fx.run.bundle_key, "publish");

        let outcome = publisher
            .publish(&fx.run, &fx.frames, selection(None, ""), permit(&fx), &logger)
            .await;

        assert_eq!(
            outcome,
            RunOutcome::NoUsableResult {
                reason: NoResultReason::NothingAboveThreshold
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(fx.store.len(&fx.run.bundle_key).await, 0);
        assert_eq!(fx.scheduler.entry(&fx.run.bundle_key).unwrap().current_backoff_s, 120.0);
    }

    #[tokio::test]
    async fn test_generation_failure_backs_off() {
        let fx = fixture();
        let generator = Arc::new(CopyGenerator {
            failures_before_success: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let publisher = publisher(&fx, Arc::new(RecordingCamera::default()), Some(generator.clone()), settings());
        let mut events = fx.broadcast.subscribe();
        let logger = RunLogger::new(&fx.run.run_id, &fx.run.bundle_key, "publish");

        let outcome = publisher
            .publish(&fx.run, &fx.frames, selection(Some(0), "x"), permit(&fx), &logger)
            .await;

        assert!(matches!(outcome, RunOutcome::GenerationFailed { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
        assert!(events.try_recv().is_err());
        assert_eq!(fx.store.len(&fx.run.bundle_key).await, 0);
        assert_eq!(fx.scheduler.entry(&fx.run.bundle_key).unwrap().current_backoff_s, 120.0);
    }

    #[tokio::test]
    async fn test_camera_update_failure_falls_back_to_path() {
        let fx = fixture();
        let camera = Arc::new(RecordingCamera {
            fail_point: true,
            ..Default::default()
        });
        let generator = Arc::new(CopyGenerator {
            failures_before_success: 0,
            calls: AtomicUsize::new(0),
        });
        let publisher = publisher(&fx, camera, Some(generator), settings());
        let logger = RunLogger::new(&fx.run.run_id, &fx.run.bundle_key, "publish");

        let outcome = publisher
            .publish(&fx.run, &fx.frames, selection(Some(2), ""), permit(&fx), &logger)
            .await;

        let bundle = outcome.bundle().unwrap();
        assert_eq!(bundle.generated_image_url, "/media/snapshots/porch/detection_summary_generated.png");
        // Empty scorer summary falls back to the generator's.
        assert_eq!(bundle.summary, "generated summary");
    }

    #[tokio::test]
    async fn test_generation_disabled_still_publishes() {
        let fx = fixture();
        let publisher = publisher(&fx, Arc::new(RecordingCamera::default()), None, settings());
        let logger = RunLogger::new(&fx.run.run_id, &fx.run.bundle_key, "publish");

        let outcome = publisher
            .publish(&fx.run, &fx.frames, selection(Some(0), "Cat on the mat"), permit(&fx), &logger)
            .await;

        let bundle = outcome.bundle().unwrap();
        assert_eq!(bundle.generated_image_url, "");
        assert_eq!(bundle.artifacts.generated_path, None);
        assert_eq!(bundle.artifacts.stable_generated_path, None);
        assert_eq!(bundle.summary, "Cat on the mat");
    }

    #[test]
    fn test_no_result_reasons() {
        let empty = FrameStore::new();
        assert_eq!(
            no_result_reason(&empty, &SelectionResult::empty(0)),
            NoResultReason::EmptyCapture
        );

        let mut frames = FrameStore::new();
        frames.append("/tmp/a.jpg", 0.0);
        let failed = SelectionResult {
            calls_issued: 1,
            failed_calls: 1,
            ..Default::default()
        };
        assert_eq!(no_result_reason(&frames, &failed), NoResultReason::AllScoringFailed);
    }
}
