//! Selection engine.
//!
//! Narrows a run's frames down to a best frame and a short ranked list
//! while spending at most `analyze_max_snapshots` external scoring calls.
//!
//! Short runs are scored outright. Longer runs are seeded with the first,
//! middle and last frames, then refined: each interval between adjacent
//! scored frames is a branch, and every round probes the midpoints of the
//! most promising branches concurrently. A branch is abandoned once it
//! produces `cutoff_streak` consecutive frames with nobody in them.

mod cache;
mod rank;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use dsum_clients::FrameScorer;
use dsum_models::{FrameStore, RunId, Score, SelectionResult};

use crate::logging::RunLogger;

pub use cache::{CacheLimits, ScoreCache, ScoreLookup};
pub use rank::{compare_optional, FacesFirst, PersonFirst, RankKey, RankPolicy, RankPolicyName};

#[derive(Debug, Clone)]
pub struct SelectionSettings {
    pub analyze_max_snapshots: usize,
    /// Frames with `person_score` at or below this count as empty
    pub no_people_threshold: f64,
    pub parallelism: usize,
    pub call_timeout: Duration,
    /// Length of `ranked_shortlist`
    pub shortlist_size: usize,
    /// Consecutive empty probes that close a branch
    pub cutoff_streak: usize,
    /// How long a scoring call waits for its frame file
    pub frame_wait: Duration,
    pub log_llm_events: bool,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            analyze_max_snapshots: 10,
            no_people_threshold: 1.0,
            parallelism: 4,
            call_timeout: Duration::from_secs(60),
            shortlist_size: 3,
            cutoff_streak: 2,
            frame_wait: Duration::from_secs(2),
            log_llm_events: true,
        }
    }
}

/// Interval `(lo, hi)` between two scored frames with unscored frames inside.
#[derive(Debug, Clone, Copy)]
struct Branch {
    lo: usize,
    hi: usize,
    /// Consecutive empty frames most recently seen in this branch
    streak: usize,
}

impl Branch {
    fn mid(&self) -> usize {
        (self.lo + self.hi) / 2
    }

    fn splittable(lo: usize, hi: usize) -> bool {
        hi >= lo + 2
    }
}

pub struct SelectionEngine {
    scorer: Arc<dyn FrameScorer>,
    policy: Arc<dyn RankPolicy>,
    settings: SelectionSettings,
}

impl SelectionEngine {
    pub fn new(scorer: Arc<dyn FrameScorer>, policy: Arc<dyn RankPolicy>, settings: SelectionSettings) -> Self {
        Self {
            scorer,
            policy,
            settings,
        }
    }

    pub fn settings(&self) -> &SelectionSettings {
        &self.settings
    }

    /// Select the best frame of `frames`.
    ///
    /// Scoring failures are absorbed; an empty store or a run where nothing
    /// clears the threshold yields a result with no best frame.
    pub async fn select(&self, run_id: &RunId, frames: &FrameStore, logger: &RunLogger) -> SelectionResult {
        let n = frames.len();
        let budget = self.settings.analyze_max_snapshots.min(n);
        if n == 0 {
            logger.log_progress("no frames captured, nothing to score");
            return SelectionResult::empty(budget);
        }

        let cache = ScoreCache::new(
            run_id.clone(),
            Arc::clone(&self.scorer),
            CacheLimits {
                budget,
                parallelism: self.settings.parallelism,
                call_timeout: self.settings.call_timeout,
                frame_wait: self.settings.frame_wait,
                log_llm_events: self.settings.log_llm_events,
            },
            logger.clone(),
        );
        let mut search = Search {
            cache: &cache,
            frames,
            policy: self.policy.as_ref(),
            settings: &self.settings,
            results: BTreeMap::new(),
            cutoff_triggered: false,
        };

        if n <= budget {
            search.probe((0..n).collect()).await;
        } else {
            search.refine(budget).await;
        }

        let result = search.finish();
        logger.log_progress(&format!(
            "selection scored {}/{} frames ({} calls, {} failed, cutoff={}), best={:?}",
            result.scores_computed,
            n,
            result.calls_issued,
            result.failed_calls,
            result.cutoff_triggered,
            result.best_frame_index
        ));
        result
    }
}

struct Search<'a> {
    cache: &'a ScoreCache,
    frames: &'a FrameStore,
    policy: &'a dyn RankPolicy,
    settings: &'a SelectionSettings,
    /// `None` marks a failed call
    results: BTreeMap<usize, Option<Score>>,
    cutoff_triggered: bool,
}

impl Search<'_> {
    /// Score `indices` concurrently; the cache bounds concurrency and spend.
    async fn probe(&mut self, indices: Vec<usize>) {
        let cache = self.cache;
        let frames = self.frames;
        let lookups = join_all(
            indices
                .iter()
                .filter_map(|&idx| frames.get(idx))
                .map(|frame| async move { (frame.index, cache.get(frame).await) }),
        )
        .await;

        for (idx, lookup) in lookups {
            match lookup {
                ScoreLookup::Scored(score) => {
                    self.results.insert(idx, Some(score));
                }
                ScoreLookup::Failed => {
                    self.results.insert(idx, None);
                }
                ScoreLookup::OverBudget => {}
            }
        }
    }

    async fn refine(&mut self, budget: usize) {
        let n = self.frames.len();
        let seeds = seed_indices(n, budget);
        self.probe(seeds.clone()).await;

        let mut branches: Vec<Branch> = Vec::new();
        for pair in seeds.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if !Branch::splittable(lo, hi) {
                continue;
            }
            // Only the hi anchor carries over, so every seed branch gets a probe.
            let streak = usize::from(self.is_empty(hi)).min(self.settings.cutoff_streak.saturating_sub(1));
            branches.push(Branch { lo, hi, streak });
        }

        loop {
            let remaining = self.cache.remaining();
            if remaining == 0 || branches.is_empty() {
                break;
            }

            branches.sort_by(|a, b| self.compare_branches(a, b));
            let take = self.settings.parallelism.max(1).min(remaining).min(branches.len());
            let round: Vec<Branch> = branches.drain(..take).collect();

            self.probe(round.iter().map(Branch::mid).collect()).await;

            for branch in round {
                let mid = branch.mid();
                match self.results.get(&mid) {
                    None => continue,
                    Some(None) => {
                        // A failed call says nothing about the scene: keep searching both sides.
                        for (lo, hi) in [(branch.lo, mid), (mid, branch.hi)] {
                            if Branch::splittable(lo, hi) {
                                branches.push(Branch { lo, hi, streak: branch.streak });
                            }
                        }
                        continue;
                    }
                    Some(Some(_)) => {}
                }
                let streak = if self.is_empty(mid) { branch.streak + 1 } else { 0 };
                if streak >= self.settings.cutoff_streak {
                    self.cutoff_triggered = true;
                    continue;
                }

                let lo_rank = self.rank_of(branch.lo, branch.hi);
                let beats_lo = self.rank_of(mid, branch.lo) == Ordering::Greater;
                let beats_hi = self.rank_of(mid, branch.hi) == Ordering::Greater;
                let halves = if beats_lo && beats_hi {
                    vec![(branch.lo, mid), (mid, branch.hi)]
                } else if lo_rank != Ordering::Less {
                    vec![(branch.lo, mid)]
                } else {
                    vec![(mid, branch.hi)]
                };

                for (lo, hi) in halves {
                    if Branch::splittable(lo, hi) {
                        branches.push(Branch { lo, hi, streak });
                    }
                }
            }
        }
    }

    fn score(&self, idx: usize) -> Option<&Score> {
        self.results.get(&idx).and_then(Option::as_ref)
    }

    /// Only a real score below the threshold is empty; failed frames are not.
    fn is_empty(&self, idx: usize) -> bool {
        self.score(idx)
            .is_some_and(|s| s.is_empty_scene(self.settings.no_people_threshold))
    }

    fn rank_of(&self, a: usize, b: usize) -> Ordering {
        compare_optional(self.policy, self.score(a), self.score(b))
    }

    /// Branches around the best anchors first, then the least empty ones,
    /// then capture order.
    fn compare_branches(&self, a: &Branch, b: &Branch) -> Ordering {
        let best_anchor = |br: &Branch| {
            if self.rank_of(br.lo, br.hi) == Ordering::Less {
                br.hi
            } else {
                br.lo
            }
        };
        self.rank_of(best_anchor(b), best_anchor(a))
            .then_with(|| a.streak.cmp(&b.streak))
            .then_with(|| a.lo.cmp(&b.lo))
    }

    fn finish(self) -> SelectionResult {
        let scores: Vec<Score> = self.results.values().flatten().cloned().collect();

        let mut eligible: Vec<&Score> = scores
            .iter()
            .filter(|s| !s.is_empty_scene(self.settings.no_people_threshold))
            .collect();
        eligible.sort_by(|a, b| self.policy.compare(a, b));
        let ranked_shortlist: Vec<usize> = eligible
            .iter()
            .take(self.settings.shortlist_size)
            .map(|s| s.frame_index)
            .collect();

        SelectionResult {
            best_frame_index: ranked_shortlist.first().copied(),
            ranked_shortlist,
            scores_computed: scores.len(),
            cutoff_triggered: self.cutoff_triggered,
            calls_issued: self.cache.calls_issued(),
            failed_calls: self.cache.failed_calls(),
            budget: self.cache.budget(),
            probes: self.cache.probes(),
            scores,
        }
    }
}

/// Seeds for a run of `n` frames: middle, first, last, in that priority,
/// truncated to `budget` and returned in capture order.
fn seed_indices(n: usize, budget: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let mut seeds: Vec<usize> = Vec::with_capacity(3);
    for idx in [n / 2, 0, n - 1] {
        if seeds.len() < budget && !seeds.contains(&idx) {
            seeds.push(idx);
        }
    }
    seeds.sort_unstable();
    seeds
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsum_clients::{ClientError, ClientResult};
    use dsum_models::{BundleKey, Frame, FrameAssessment, ScoreSource};
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Scorer returning canned `(person, face)` scores by frame index.
    /// Unlisted frames score zero.
    pub(crate) struct FakeScorer {
        scores: HashMap<usize, (f64, f64)>,
        delay: Duration,
        fail: bool,
        fail_on: HashSet<usize>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeScorer {
        pub(crate) fn new(scores: &[(usize, f64, f64)]) -> Self {
            Self {
                scores: scores.iter().map(|&(i, p, f)| (i, (p, f))).collect(),
                delay: Duration::ZERO,
                fail: false,
                fail_on: HashSet::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub(crate) fn failing_on(mut self, indices: &[usize]) -> Self {
            self.fail_on = indices.iter().copied().collect();
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }

        pub(crate) fn peak(&self) -> usize {
            self.peak.load(AtomicOrdering::SeqCst)
        }
    }

    pub(crate) fn index_from_path(path: &Path) -> usize {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("frame_"))
            .and_then(|s| s.parse().ok())
            .unwrap()
    }

    #[async_trait]
    impl FrameScorer for FakeScorer {
        async fn score(&self, image_path: &Path) -> ClientResult<FrameAssessment> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);

            let index = index_from_path(image_path);
            if self.fail || self.fail_on.contains(&index) {
                return Err(ClientError::ServiceUnavailable("scorer down".to_string()));
            }
            let (person, face) = self
                .scores
                .get(&index)
                .copied()
                .unwrap_or((0.0, 0.0));
            Ok(FrameAssessment {
                person_score: person,
                face_score: face,
                frame_score: person,
                ..Default::default()
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn frames(n: usize) -> FrameStore {
        let mut store = FrameStore::new();
        for i in 0..n {
            store.append(format!("/nonexistent/run/{}", Frame::file_name(i)), i as f64);
        }
        store
    }

    fn engine(scorer: Arc<FakeScorer>, max: usize, threshold: f64, parallelism: usize) -> SelectionEngine {
        SelectionEngine::new(
            scorer,
            Arc::new(FacesFirst),
            SelectionSettings {
                analyze_max_snapshots: max,
                no_people_threshold: threshold,
                parallelism,
                frame_wait: Duration::ZERO,
                log_llm_events: false,
                ..Default::default()
            },
        )
    }

    fn logger() -> RunLogger {
        RunLogger::new(&RunId::from_string("run"), &BundleKey::from("porch"), "selection")
    }

    #[tokio::test]
    async fn test_peak_search_with_cutoff() {
        let scorer = Arc::new(FakeScorer::new(&[
            (0, 0.1, 0.0),
            (10, 0.8, 1.0),
            (19, 0.05, 0.0),
            (5, 0.5, 0.0),
            (14, 0.1, 0.0),
            (7, 0.7, 0.0),
        ]));
        let engine = engine(scorer.clone(), 6, 0.2, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(20), &logger()).await;

        assert_eq!(result.probes, vec![0, 10, 19, 5, 14, 7]);
        assert_eq!(result.calls_issued, 6);
        assert_eq!(scorer.calls(), 6);
        assert!(result.cutoff_triggered);
        assert_eq!(result.best_frame_index, Some(10));
        assert_eq!(result.ranked_shortlist, vec![10, 7, 5]);
        assert_eq!(result.scored_indices(), vec![0, 5, 7, 10, 14, 19]);
        assert_eq!(result.budget, 6);
        assert_eq!(result.failed_calls, 0);
    }

    #[tokio::test]
    async fn test_short_run_scores_everything() {
        let scorer = Arc::new(FakeScorer::new(&[(1, 3.0, 0.0), (2, 3.0, 0.0)]));
        let engine = engine(scorer.clone(), 10, 1.0, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(4), &logger()).await;

        assert_eq!(scorer.calls(), 4);
        assert_eq!(result.scores_computed, 4);
        // Tie on every key: the earlier frame wins.
        assert_eq!(result.best_frame_index, Some(1));
        assert_eq!(result.ranked_shortlist, vec![1, 2]);
        assert!(result.scores.iter().all(|s| s.source == ScoreSource::Fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_bound() {
        let scorer = Arc::new(FakeScorer::new(&[]).with_delay(Duration::from_millis(50)));
        let engine = engine(scorer.clone(), 12, 1.0, 3);

        engine.select(&RunId::from_string("run"), &frames(12), &logger()).await;

        assert_eq!(scorer.calls(), 12);
        assert!(scorer.peak() <= 3);
        assert!(scorer.peak() >= 2);
    }

    #[tokio::test]
    async fn test_budget_never_exceeded() {
        let scores: Vec<(usize, f64, f64)> = (0..50).map(|i| (i, 5.0, (i % 7) as f64)).collect();
        let scorer = Arc::new(FakeScorer::new(&scores));
        let engine = engine(scorer.clone(), 7, 1.0, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(50), &logger()).await;

        assert!(scorer.calls() <= 7);
        assert_eq!(result.calls_issued, scorer.calls());
        assert!(result.best_frame_index.is_some());
    }

    #[tokio::test]
    async fn test_empty_store() {
        let scorer = Arc::new(FakeScorer::new(&[]));
        let engine = engine(scorer.clone(), 6, 0.2, 4);

        let result = engine.select(&RunId::from_string("run"), &FrameStore::new(), &logger()).await;

        assert_eq!(result.best_frame_index, None);
        assert!(result.ranked_shortlist.is_empty());
        assert_eq!(scorer.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_calls_failing() {
        let scorer = Arc::new(FakeScorer::new(&[]).failing());
        let engine = engine(scorer.clone(), 6, 0.2, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(20), &logger()).await;

        assert_eq!(result.best_frame_index, None);
        assert!(result.ranked_shortlist.is_empty());
        assert!(result.all_calls_failed());
        assert_eq!(result.scores_computed, 0);
        // Failures never close a branch, so the whole budget is spent.
        assert!(!result.cutoff_triggered);
        assert_eq!(result.calls_issued, 6);
        assert_eq!(scorer.calls(), 6);
    }

    /// Frames 3..=7 show a person, everything else is an empty scene.
    fn subject_in_middle_of_first_half() -> Vec<(usize, f64, f64)> {
        (0..20)
            .map(|i| (i, if (3..=7).contains(&i) { 0.9 } else { 0.05 }, 0.0))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_seeds_do_not_close_branches() {
        let scorer = Arc::new(FakeScorer::new(&subject_in_middle_of_first_half()).failing_on(&[0, 10]));
        let engine = engine(scorer.clone(), 6, 0.2, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(20), &logger()).await;

        assert_eq!(result.calls_issued, 6);
        assert_eq!(result.failed_calls, 2);
        assert_eq!(result.best_frame_index, Some(5));
        assert!(result.is_usable());
        // Only the 10..19 branch ran out of people.
        assert!(result.cutoff_triggered);
    }

    #[tokio::test]
    async fn test_empty_seeds_still_probe_between_them() {
        let scorer = Arc::new(FakeScorer::new(&subject_in_middle_of_first_half()));
        let engine = engine(scorer.clone(), 6, 0.2, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(20), &logger()).await;

        assert_eq!(&result.probes[..5], &[0, 10, 19, 5, 14]);
        assert_eq!(result.calls_issued, 6);
        assert_eq!(result.best_frame_index, Some(5));
        assert_eq!(result.ranked_shortlist, vec![5]);
    }

    #[tokio::test]
    async fn test_nothing_above_threshold() {
        let scorer = Arc::new(FakeScorer::new(&[(3, 0.5, 0.0)]));
        let engine = engine(scorer, 10, 1.0, 4);

        let result = engine.select(&RunId::from_string("run"), &frames(5), &logger()).await;

        assert_eq!(result.best_frame_index, None);
        assert_eq!(result.scores_computed, 5);
        assert!(!result.all_calls_failed());
    }

    #[test]
    fn test_seed_indices() {
        assert_eq!(seed_indices(20, 6), vec![0, 10, 19]);
        assert_eq!(seed_indices(20, 1), vec![10]);
        assert_eq!(seed_indices(20, 2), vec![0, 10]);
        assert_eq!(seed_indices(2, 5), vec![0, 1]);
        assert!(seed_indices(0, 5).is_empty());
    }
}
