//! Per-run score cache with request coalescing.
//!
//! Each `(run_id, frame_index)` maps to one shared future. The first
//! request starts the external call; later requests attach to the same
//! future, so a frame is scored at most once per run. Failed calls are
//! cached as failures and never retried.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Semaphore;

use dsum_clients::FrameScorer;
use dsum_models::{epoch_now, Frame, RunId, Score, ScoreSource};
use dsum_storage::wait_for_file;

use crate::logging::RunLogger;
use crate::metrics;

type ScoreFuture = Shared<BoxFuture<'static, Option<Score>>>;

/// Outcome of asking the cache for a frame's score.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreLookup {
    Scored(Score),
    /// The call failed or timed out
    Failed,
    /// Not scored yet and no budget left to score it
    OverBudget,
}

impl ScoreLookup {
    pub fn score(&self) -> Option<&Score> {
        match self {
            ScoreLookup::Scored(score) => Some(score),
            _ => None,
        }
    }
}

/// Limits for one run's scoring calls.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Maximum external calls for the run
    pub budget: usize,
    /// Maximum concurrent external calls
    pub parallelism: usize,
    /// Per-call timeout; zero disables it
    pub call_timeout: Duration,
    /// How long to wait for a frame file to appear before scoring it
    pub frame_wait: Duration,
    pub log_llm_events: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(RunId, usize), ScoreFuture>,
    calls_issued: usize,
    probes: Vec<usize>,
}

/// Score cache scoped to one run.
pub struct ScoreCache {
    run_id: RunId,
    scorer: Arc<dyn FrameScorer>,
    semaphore: Arc<Semaphore>,
    limits: CacheLimits,
    logger: RunLogger,
    inner: Mutex<CacheInner>,
    failures: Arc<AtomicUsize>,
}

impl ScoreCache {
    pub fn new(run_id: RunId, scorer: Arc<dyn FrameScorer>, limits: CacheLimits, logger: RunLogger) -> Self {
        Self {
            run_id,
            scorer,
            semaphore: Arc::new(Semaphore::new(limits.parallelism.max(1))),
            limits,
            logger,
            inner: Mutex::new(CacheInner::default()),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Score `frame`, reusing a pending or finished call when there is one.
    ///
    /// The budget check and the registration of a new call happen under
    /// one lock, so concurrent requests can never overspend.
    pub async fn get(&self, frame: &Frame) -> ScoreLookup {
        let key = (self.run_id.clone(), frame.index);
        let (future, fresh) = {
            let mut inner = self.lock();
            match inner.entries.get(&key) {
                Some(existing) => (existing.clone(), false),
                None if inner.calls_issued >= self.limits.budget => return ScoreLookup::OverBudget,
                None => {
                    let future = self.start_call(frame).shared();
                    inner.entries.insert(key, future.clone());
                    inner.calls_issued += 1;
                    inner.probes.push(frame.index);
                    (future, true)
                }
            }
        };

        match future.await {
            Some(score) if fresh => ScoreLookup::Scored(score),
            Some(score) => ScoreLookup::Scored(score.cached()),
            None => ScoreLookup::Failed,
        }
    }

    fn start_call(&self, frame: &Frame) -> BoxFuture<'static, Option<Score>> {
        let scorer = Arc::clone(&self.scorer);
        let semaphore = Arc::clone(&self.semaphore);
        let failures = Arc::clone(&self.failures);
        let limits = self.limits.clone();
        let logger = self.logger.clone();
        let path: PathBuf = frame.path.clone();
        let index = frame.index;

        async move {
            if !limits.frame_wait.is_zero() && !wait_for_file(&path, limits.frame_wait).await {
                failures.fetch_add(1, Ordering::SeqCst);
                metrics::record_scoring_call("missing_frame", 0.0);
                logger.log_warning(&format!("frame {} never appeared at {}", index, path.display()));
                return None;
            }

            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    return None;
                }
            };

            let started = Instant::now();
            let result = if limits.call_timeout.is_zero() {
                Ok(scorer.score(&path).await)
            } else {
                tokio::time::timeout(limits.call_timeout, scorer.score(&path)).await
            };
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(Ok(assessment)) => {
                    metrics::record_scoring_call("ok", elapsed);
                    if limits.log_llm_events {
                        logger.log_progress(&format!(
                            "frame {} scored by {} in {:.2}s: person={} face={} frame={}",
                            index,
                            scorer.name(),
                            elapsed,
                            assessment.person_score,
                            assessment.face_score,
                            assessment.frame_score
                        ));
                    }
                    Some(Score::from_assessment(index, &assessment, epoch_now(), ScoreSource::Fresh))
                }
                Ok(Err(e)) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    metrics::record_scoring_call("failed", elapsed);
                    logger.log_warning(&format!("scoring frame {} failed: {}", index, e));
                    None
                }
                Err(_) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    metrics::record_scoring_call("timeout", elapsed);
                    logger.log_warning(&format!(
                        "scoring frame {} timed out after {:?}",
                        index, limits.call_timeout
                    ));
                    None
                }
            }
        }
        .boxed()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn budget(&self) -> usize {
        self.limits.budget
    }

    pub fn remaining(&self) -> usize {
        self.limits.budget.saturating_sub(self.lock().calls_issued)
    }

    pub fn calls_issued(&self) -> usize {
        self.lock().calls_issued
    }

    pub fn failed_calls(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Frame indices in the order their calls were registered.
    pub fn probes(&self) -> Vec<usize> {
        self.lock().probes.clone()
    }
}
