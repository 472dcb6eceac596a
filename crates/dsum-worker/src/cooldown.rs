//! Cooldown scheduler.
//!
//! Holds one [`CooldownEntry`] per bundle key plus the set of keys with a
//! run in flight. Admission and completion are each a single
//! read-modify-write under one lock, so two runs for the same key can never
//! overlap and a completion can never race an admission.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use dsum_models::{BundleKey, CooldownEntry};

use crate::error::RunOutcome;
use crate::metrics;

#[derive(Debug, Default)]
struct SchedulerState {
    entries: HashMap<BundleKey, CooldownEntry>,
    in_flight: HashSet<BundleKey>,
}

/// Why a trigger was turned away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// A run for this key is still in progress
    InFlight,
    /// The cooldown window has not reopened yet
    CoolingDown { remaining_s: f64 },
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::InFlight => "in_flight",
            Rejection::CoolingDown { .. } => "cooling_down",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InFlight => f.write_str("a run is already in progress"),
            Rejection::CoolingDown { remaining_s } => write!(f, "cooling down for {:.1}s", remaining_s),
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(RunPermit),
    Rejected(Rejection),
}

/// Per-key admission gate shared by every zone runner.
#[derive(Debug, Clone, Default)]
pub struct CooldownScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl CooldownScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a trigger for `key` at `now` (epoch seconds) starts a run.
    ///
    /// The entry is created with `base_cooldown_s` on first sight. A
    /// rejected trigger is dropped, never queued.
    pub fn try_admit(&self, key: &BundleKey, base_cooldown_s: f64, max_backoff_s: f64, now: f64) -> Admission {
        let mut state = self.lock();
        if state.in_flight.contains(key) {
            return Admission::Rejected(Rejection::InFlight);
        }

        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CooldownEntry::new(base_cooldown_s, max_backoff_s));
        if !entry.admits(now) {
            return Admission::Rejected(Rejection::CoolingDown {
                remaining_s: entry.remaining_s(now),
            });
        }

        state.in_flight.insert(key.clone());
        Admission::Admitted(RunPermit {
            key: key.clone(),
            state: Arc::clone(&self.state),
            completed: false,
        })
    }

    /// Current entry for `key`, if one exists.
    pub fn entry(&self, key: &BundleKey) -> Option<CooldownEntry> {
        self.lock().entries.get(key).cloned()
    }

    pub fn is_in_flight(&self, key: &BundleKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        lock_state(&self.state)
    }
}

/// Exclusive right to run for one key.
///
/// Completing the permit records the run's end and adjusts the backoff.
/// Dropping it without completing only frees the key.
#[derive(Debug)]
pub struct RunPermit {
    key: BundleKey,
    state: Arc<Mutex<SchedulerState>>,
    completed: bool,
}

impl RunPermit {
    pub fn key(&self) -> &BundleKey {
        &self.key
    }

    /// Record the run's outcome at `ended_ts` and return the new backoff.
    ///
    /// A publish resets the backoff to the base cooldown; any other
    /// outcome doubles it up to the cap.
    pub fn complete(mut self, outcome: &RunOutcome, ended_ts: f64) -> f64 {
        let backoff = {
            let mut state = lock_state(&self.state);
            state.in_flight.remove(&self.key);
            match state.entries.get_mut(&self.key) {
                Some(entry) => {
                    if outcome.is_published() {
                        entry.reset(ended_ts);
                    } else {
                        entry.back_off(ended_ts);
                    }
                    entry.current_backoff_s
                }
                None => 0.0,
            }
        };
        self.completed = true;
        metrics::set_cooldown_backoff(self.key.as_str(), backoff);
        backoff
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if !self.completed {
            lock_state(&self.state).in_flight.remove(&self.key);
        }
    }
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
