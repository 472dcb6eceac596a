//! Capture controller.
//!
//! [`CaptureMachine`] is the transition table, driven by discrete inputs
//! stamped with seconds since the run started. [`CaptureController`] feeds
//! it from the trigger channel, a snapshot ticker and two timers, and
//! takes a snapshot whenever the machine asks for one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use dsum_clients::CameraPlatform;
use dsum_models::{FrameStore, Run, RunState};
use dsum_storage::StorageLayout;

use crate::logging::RunLogger;
use crate::metrics;
use crate::retry::FailureTracker;

/// Consecutive snapshot failures logged before suppression.
const MAX_LOGGED_SNAPSHOT_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub snapshot_interval: Duration,
    /// Zero ends the run as soon as the trigger clears
    pub off_grace: Duration,
    /// Zero disables the hard limit
    pub capture_max: Duration,
    pub log_snapshot_events: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(3),
            off_grace: Duration::from_secs(15),
            capture_max: Duration::from_secs(300),
            log_snapshot_events: true,
        }
    }
}

/// Input to the capture machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureInput {
    TriggerOn,
    TriggerOff,
    /// Snapshot interval elapsed
    Tick,
    /// Off-grace timer elapsed
    GraceElapsed,
}

/// What the caller should do after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStep {
    Snapshot,
    GraceStarted,
    /// Reached `Done` or `TimedOut`
    Finished,
    Ignored,
}

/// Capture state machine for one run.
#[derive(Debug, Clone)]
pub struct CaptureMachine {
    state: RunState,
    off_grace_s: f64,
    capture_max_s: f64,
    grace_started_at: Option<f64>,
    motion_since: Option<f64>,
    motion_on_s: f64,
    ended_at: Option<f64>,
    timed_out: bool,
}

impl CaptureMachine {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            state: RunState::Idle,
            off_grace_s: settings.off_grace.as_secs_f64(),
            capture_max_s: settings.capture_max.as_secs_f64(),
            grace_started_at: None,
            motion_since: None,
            motion_on_s: 0.0,
            ended_at: None,
            timed_out: false,
        }
    }

    /// Apply `input` observed at `now` seconds since the run started.
    ///
    /// The hard limit is checked before anything else and preempts the
    /// off-grace timer.
    pub fn handle(&mut self, input: CaptureInput, now: f64) -> CaptureStep {
        if self.state.is_terminal() {
            return CaptureStep::Ignored;
        }
        if self.state != RunState::Idle && self.capture_max_s > 0.0 && now >= self.capture_max_s {
            self.finish(now, true);
            return CaptureStep::Finished;
        }

        match (self.state, input) {
            (RunState::Idle, CaptureInput::TriggerOn) => {
                self.state = RunState::Capturing;
                self.motion_since = Some(now);
                CaptureStep::Snapshot
            }
            (RunState::Capturing, CaptureInput::Tick) => CaptureStep::Snapshot,
            (RunState::Capturing, CaptureInput::TriggerOff) => {
                self.close_motion(now);
                if self.off_grace_s <= 0.0 {
                    self.finish(now, false);
                    return CaptureStep::Finished;
                }
                self.state = RunState::Draining;
                self.grace_started_at = Some(now);
                CaptureStep::GraceStarted
            }
            (RunState::Draining, CaptureInput::TriggerOn) => {
                self.state = RunState::Capturing;
                self.grace_started_at = None;
                self.motion_since = Some(now);
                CaptureStep::Snapshot
            }
            (RunState::Draining, CaptureInput::GraceElapsed) => {
                self.finish(now, false);
                CaptureStep::Finished
            }
            (RunState::Draining, CaptureInput::Tick) => match self.grace_started_at {
                Some(started) if now - started >= self.off_grace_s => {
                    self.finish(now, false);
                    CaptureStep::Finished
                }
                _ => CaptureStep::Ignored,
            },
            _ => CaptureStep::Ignored,
        }
    }

    fn close_motion(&mut self, now: f64) {
        if let Some(since) = self.motion_since.take() {
            self.motion_on_s += (now - since).max(0.0);
        }
    }

    fn finish(&mut self, now: f64, timed_out: bool) {
        self.close_motion(now);
        self.grace_started_at = None;
        self.ended_at = Some(now);
        self.timed_out = timed_out;
        self.state = if timed_out {
            RunState::TimedOut
        } else {
            RunState::Done
        };
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn ended_at(&self) -> Option<f64> {
        self.ended_at
    }

    /// Seconds with the trigger on, so far.
    pub fn motion_on_s(&self) -> f64 {
        self.motion_on_s
    }

    /// When the running off-grace timer fires, if one is running.
    pub fn grace_deadline(&self) -> Option<f64> {
        match self.state {
            RunState::Draining => self.grace_started_at.map(|s| s + self.off_grace_s),
            _ => None,
        }
    }
}

/// Drives one run's capture phase against the camera platform.
pub struct CaptureController {
    camera: Arc<dyn CameraPlatform>,
    layout: StorageLayout,
    settings: CaptureSettings,
}

impl CaptureController {
    pub fn new(camera: Arc<dyn CameraPlatform>, layout: StorageLayout, settings: CaptureSettings) -> Self {
        Self {
            camera,
            layout,
            settings,
        }
    }

    /// Capture frames for `run` until it reaches a terminal state.
    ///
    /// The run is assumed to start on a trigger rising edge. On return
    /// `run` carries its end time, terminal state and time-out flag.
    pub async fn capture(&self, run: &mut Run, motion: &mut watch::Receiver<bool>, logger: &RunLogger) -> FrameStore {
        let captured_dir = self.layout.to_local(&self.layout.captured_dir(&run.run_id));
        if let Err(e) = tokio::fs::create_dir_all(&captured_dir).await {
            logger.log_warning(&format!("could not create {}: {}", captured_dir.display(), e));
        }

        let start = Instant::now();
        let mut machine = CaptureMachine::new(&self.settings);
        let mut frames = FrameStore::new();
        let mut failures = FailureTracker::new(MAX_LOGGED_SNAPSHOT_FAILURES);

        let interval = self.settings.snapshot_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(start + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let hard_deadline = (!self.settings.capture_max.is_zero()).then(|| start + self.settings.capture_max);
        let capture_max_s = self.settings.capture_max.as_secs_f64();
        let mut motion_open = true;

        let mut step = machine.handle(CaptureInput::TriggerOn, 0.0);
        if !*motion.borrow_and_update() {
            self.apply(step, run, &mut frames, &mut failures, 0.0, logger).await;
            step = machine.handle(CaptureInput::TriggerOff, elapsed(start));
        }
        self.apply(step, run, &mut frames, &mut failures, elapsed(start), logger).await;
        run.state = machine.state();

        while !machine.is_terminal() {
            let grace_deadline = machine
                .grace_deadline()
                .map(|s| start + Duration::from_secs_f64(s.max(0.0)));
            let capturing = machine.state() == RunState::Capturing;

            let step = tokio::select! {
                _ = sleep_until(hard_deadline), if hard_deadline.is_some() => {
                    machine.handle(CaptureInput::Tick, elapsed(start).max(capture_max_s))
                }
                changed = motion.changed(), if motion_open => {
                    let input = match changed {
                        Ok(()) if *motion.borrow_and_update() => CaptureInput::TriggerOn,
                        Ok(()) => CaptureInput::TriggerOff,
                        Err(_) => {
                            motion_open = false;
                            logger.log_warning("trigger channel closed; treating trigger as off");
                            CaptureInput::TriggerOff
                        }
                    };
                    let step = machine.handle(input, elapsed(start));
                    if input == CaptureInput::TriggerOn && step == CaptureStep::Snapshot {
                        ticker.reset();
                    }
                    step
                }
                _ = ticker.tick(), if capturing => {
                    machine.handle(CaptureInput::Tick, elapsed(start))
                }
                _ = sleep_until(grace_deadline), if grace_deadline.is_some() => {
                    machine.handle(CaptureInput::GraceElapsed, elapsed(start))
                }
            };

            self.apply(step, run, &mut frames, &mut failures, elapsed(start), logger)
                .await;
            run.state = machine.state();
        }

        let ended_at = machine.ended_at().unwrap_or_else(|| elapsed(start));
        run.ended_ts = Some(run.started_ts + ended_at);
        run.timed_out = machine.timed_out();
        run.motion_on_s = machine.motion_on_s();
        run.state = machine.state();

        logger.log_progress(&format!(
            "capture {} after {:.1}s with {} frames",
            run.state,
            ended_at,
            frames.len()
        ));
        frames
    }

    async fn apply(
        &self,
        step: CaptureStep,
        run: &Run,
        frames: &mut FrameStore,
        failures: &mut FailureTracker,
        now: f64,
        logger: &RunLogger,
    ) {
        match step {
            CaptureStep::Snapshot => self.take_snapshot(run, frames, failures, now, logger).await,
            CaptureStep::GraceStarted => logger.log_progress(&format!(
                "trigger cleared, waiting {:.1}s off-grace",
                self.settings.off_grace.as_secs_f64()
            )),
            CaptureStep::Finished | CaptureStep::Ignored => {}
        }
    }

    /// A failed snapshot appends nothing; capture carries on.
    async fn take_snapshot(
        &self,
        run: &Run,
        frames: &mut FrameStore,
        failures: &mut FailureTracker,
        now: f64,
        logger: &RunLogger,
    ) {
        let index = frames.next_index();
        let platform_path = self.layout.frame_path(&run.run_id, index);

        match self.camera.snapshot(&run.camera_entity_id, &platform_path).await {
            Ok(()) => {
                failures.record_success();
                frames.append(self.layout.to_local(&platform_path), run.started_ts + now);
                metrics::record_frame_captured(run.bundle_key.as_str());
                if self.settings.log_snapshot_events {
                    logger.log_progress(&format!("snapshot {} -> {}", index, platform_path));
                }
            }
            Err(e) => {
                metrics::record_snapshot_failure(run.bundle_key.as_str());
                if failures.record_failure() {
                    logger.log_warning(&format!("snapshot {} failed: {}", index, e));
                }
            }
        }
    }
}

fn elapsed(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsum_clients::{ClientError, ClientResult};
    use dsum_models::BundleKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn settings(interval: u64, grace: u64, max: u64) -> CaptureSettings {
        CaptureSettings {
            snapshot_interval: Duration::from_secs(interval),
            off_grace: Duration::from_secs(grace),
            capture_max: Duration::from_secs(max),
            log_snapshot_events: false,
        }
    }

    #[test]
    fn test_flicker_keeps_capturing() {
        let mut machine = CaptureMachine::new(&settings(3, 15, 300));
        assert_eq!(machine.handle(CaptureInput::TriggerOn, 0.0), CaptureStep::Snapshot);
        assert_eq!(machine.handle(CaptureInput::TriggerOff, 10.0), CaptureStep::GraceStarted);
        assert_eq!(machine.grace_deadline(), Some(25.0));
        assert_eq!(machine.handle(CaptureInput::Tick, 20.0), CaptureStep::Ignored);
        assert_eq!(machine.handle(CaptureInput::TriggerOn, 20.0), CaptureStep::Snapshot);
        assert_eq!(machine.state(), RunState::Capturing);
        assert_eq!(machine.grace_deadline(), None);
        assert_eq!(machine.handle(CaptureInput::GraceElapsed, 25.0), CaptureStep::Ignored);
        assert_eq!(machine.state(), RunState::Capturing);
    }

    #[test]
    fn test_grace_elapses_to_done() {
        let mut machine = CaptureMachine::new(&settings(3, 15, 300));
        machine.handle(CaptureInput::TriggerOn, 0.0);
        machine.handle(CaptureInput::TriggerOff, 10.0);
        assert_eq!(machine.handle(CaptureInput::GraceElapsed, 25.0), CaptureStep::Finished);
        assert_eq!(machine.state(), RunState::Done);
        assert!(!machine.timed_out());
        assert_eq!(machine.ended_at(), Some(25.0));
        assert_eq!(machine.motion_on_s(), 10.0);
        assert_eq!(machine.handle(CaptureInput::TriggerOn, 26.0), CaptureStep::Ignored);
    }

    #[test]
    fn test_hard_limit_preempts_grace() {
        let mut machine = CaptureMachine::new(&settings(3, 15, 300));
        machine.handle(CaptureInput::TriggerOn, 0.0);
        assert_eq!(machine.handle(CaptureInput::Tick, 297.0), CaptureStep::Snapshot);
        machine.handle(CaptureInput::TriggerOff, 295.0);
        assert_eq!(machine.handle(CaptureInput::Tick, 300.0), CaptureStep::Finished);
        assert_eq!(machine.state(), RunState::TimedOut);
        assert!(machine.timed_out());
    }

    #[test]
    fn test_zero_grace_ends_immediately() {
        let mut machine = CaptureMachine::new(&settings(3, 0, 300));
        machine.handle(CaptureInput::TriggerOn, 0.0);
        assert_eq!(machine.handle(CaptureInput::TriggerOff, 4.0), CaptureStep::Finished);
        assert_eq!(machine.state(), RunState::Done);
    }

    #[test]
    fn test_idle_ignores_everything_but_trigger() {
        let mut machine = CaptureMachine::new(&settings(3, 15, 300));
        assert_eq!(machine.handle(CaptureInput::Tick, 400.0), CaptureStep::Ignored);
        assert_eq!(machine.handle(CaptureInput::TriggerOff, 400.0), CaptureStep::Ignored);
        assert_eq!(machine.state(), RunState::Idle);
    }

    /// Writes a small file for each snapshot into the local mount.
    struct FileCamera {
        layout: StorageLayout,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CameraPlatform for FileCamera {
        async fn snapshot(&self, _camera: &str, destination: &str) -> ClientResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::ServiceUnavailable("camera offline".to_string()));
            }
            let local = self.layout.to_local(destination);
            std::fs::create_dir_all(local.parent().unwrap()).unwrap();
            std::fs::write(local, b"jpeg").unwrap();
            Ok(())
        }

        async fn point_camera(&self, _camera: &str, _file_path: &str) -> ClientResult<()> {
            Ok(())
        }
    }

    fn setup(dir: &TempDir, fail: bool, settings: CaptureSettings) -> (Arc<FileCamera>, CaptureController, Run) {
        let layout = StorageLayout::new("/media/snapshots/porch", dir.path());
        let camera = Arc::new(FileCamera {
            layout: layout.clone(),
            calls: AtomicUsize::new(0),
            fail,
        });
        let controller = CaptureController::new(camera.clone(), layout, settings);
        let run = Run::new(BundleKey::from("porch"), "binary_sensor.porch", "camera.porch", 1000.0);
        (camera, controller, run)
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_motion_on() {
        let dir = TempDir::new().unwrap();
        let (_camera, controller, mut run) = setup(&dir, false, settings(3, 15, 30));
        let (_tx, mut rx) = watch::channel(true);
        let logger = RunLogger::new(&run.run_id, &run.bundle_key, "capture");

        let frames = controller.capture(&mut run, &mut rx, &logger).await;

        assert_eq!(run.state, RunState::TimedOut);
        assert!(run.timed_out);
        assert_eq!(run.capture_duration_s(), 30.0);
        assert_eq!(frames.len(), 10);
        let indices: Vec<usize> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert!(frames.iter().all(|f| f.path.exists()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ends_after_off_grace() {
        let dir = TempDir::new().unwrap();
        let (_camera, controller, mut run) = setup(&dir, false, settings(3, 5, 300));
        let (tx, mut rx) = watch::channel(true);
        let logger = RunLogger::new(&run.run_id, &run.bundle_key, "capture");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            tx.send(false).ok();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(tx);
        });

        let frames = controller.capture(&mut run, &mut rx, &logger).await;

        assert_eq!(run.state, RunState::Done);
        assert!(!run.timed_out);
        assert!((run.capture_duration_s() - 9.5).abs() < 1e-6);
        assert!((run.motion_on_s - 4.5).abs() < 1e-6);
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_within_grace_keeps_run_open() {
        let dir = TempDir::new().unwrap();
        let (_camera, controller, mut run) = setup(&dir, false, settings(3, 15, 300));
        let (tx, mut rx) = watch::channel(true);
        let logger = RunLogger::new(&run.run_id, &run.bundle_key, "capture");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(false).ok();
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(true).ok();
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(false).ok();
            tokio::time::sleep(Duration::from_secs(600)).await;
        });

        controller.capture(&mut run, &mut rx, &logger).await;

        assert_eq!(run.state, RunState::Done);
        // Second off at t=30, grace ends at t=45.
        assert!((run.capture_duration_s() - 45.0).abs() < 1e-6);
        assert!((run.motion_on_s - 20.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_snapshots_leave_store_empty() {
        let dir = TempDir::new().unwrap();
        let (camera, controller, mut run) = setup(&dir, true, settings(3, 0, 300));
        let (tx, mut rx) = watch::channel(true);
        let logger = RunLogger::new(&run.run_id, &run.bundle_key, "capture");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            tx.send(false).ok();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let frames = controller.capture(&mut run, &mut rx, &logger).await;

        assert!(frames.is_empty());
        assert_eq!(camera.calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.state, RunState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_already_cleared() {
        let dir = TempDir::new().unwrap();
        let (_camera, controller, mut run) = setup(&dir, false, settings(3, 0, 300));
        let (_tx, mut rx) = watch::channel(false);
        let logger = RunLogger::new(&run.run_id, &run.bundle_key, "capture");

        let frames = controller.capture(&mut run, &mut rx, &logger).await;

        assert_eq!(run.state, RunState::Done);
        assert_eq!(frames.len(), 1);
        assert_eq!(run.capture_duration_s(), 0.0);
    }
}
