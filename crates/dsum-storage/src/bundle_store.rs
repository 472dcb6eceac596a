//! Persistent store of published bundles.
//!
//! Bundles are kept per bundle key, newest first, capped at
//! `max_bundles_per_key`, and persisted as one JSON document replaced
//! atomically on every change. Consumers can wait for a bundle to appear;
//! waiters are woken on every publish.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use dsum_models::{epoch_now, utc_iso, Bundle, BundleKey, RunId};

use crate::error::StorageResult;
use crate::fs_utils::write_atomic;

const STATE_VERSION: u32 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// JSON state file; `None` keeps the store in memory only
    pub state_path: Option<PathBuf>,
    pub max_bundles_per_key: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            max_bundles_per_key: 50,
        }
    }
}

/// Eligibility window for [`BundleStore::best_bundle`].
#[derive(Debug, Clone, Copy)]
pub struct BundleQuery {
    pub window_start_epoch: f64,
    pub window_end_epoch: f64,
    pub include_consumed: bool,
    pub max_age_s: Option<f64>,
}

impl BundleQuery {
    pub fn window(window_start_epoch: f64, window_end_epoch: f64) -> Self {
        Self {
            window_start_epoch,
            window_end_epoch,
            include_consumed: false,
            max_age_s: None,
        }
    }

    fn admits(&self, bundle: &Bundle, now: f64) -> bool {
        let created = bundle.created_at_epoch;
        if created < self.window_start_epoch || created > self.window_end_epoch {
            return false;
        }
        if !self.include_consumed && bundle.consumed {
            return false;
        }
        match self.max_age_s {
            Some(max_age) => now - created <= max_age,
            None => true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    bundles: BTreeMap<String, Vec<Bundle>>,
}

/// Process-shared bundle store.
pub struct BundleStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    changed: Notify,
}

impl BundleStore {
    /// Open the store, loading the state file if present.
    ///
    /// A missing or unreadable state file yields an empty store; the next
    /// write replaces it.
    pub async fn open(config: StoreConfig) -> Self {
        let state = match &config.state_path {
            Some(path) => load_state(path).await,
            None => StoreState::default(),
        };
        Self {
            config,
            state: Mutex::new(state),
            changed: Notify::new(),
        }
    }

    pub fn in_memory(max_bundles_per_key: usize) -> Self {
        Self {
            config: StoreConfig {
                state_path: None,
                max_bundles_per_key,
            },
            state: Mutex::new(StoreState::default()),
            changed: Notify::new(),
        }
    }

    /// Publish a bundle under its key.
    pub async fn publish(&self, bundle: Bundle) -> StorageResult<()> {
        let key = bundle.bundle_key.as_str().to_string();
        let run_id = bundle.run_id.clone();

        let result = {
            let mut state = self.state.lock().await;
            let bundles = state.bundles.entry(key.clone()).or_default();
            bundles.retain(|b| b.run_id != bundle.run_id);
            bundles.push(bundle);
            bundles.sort_by(|a, b| b.created_at_epoch.total_cmp(&a.created_at_epoch));
            bundles.truncate(self.config.max_bundles_per_key.max(1));
            self.persist(&state).await
        };
        self.changed.notify_waiters();

        info!(bundle_key = %key, run_id = %run_id, "Bundle published to store");
        result
    }

    /// Best eligible bundle for `key`: highest best-frame score, newest on tie.
    pub async fn best_bundle(&self, key: &BundleKey, query: BundleQuery) -> Option<Bundle> {
        let now = epoch_now();
        let state = self.state.lock().await;
        state
            .bundles
            .get(key.as_str())?
            .iter()
            .filter(|b| query.admits(b, now))
            .max_by(|a, b| {
                a.score()
                    .total_cmp(&b.score())
                    .then(a.created_at_epoch.total_cmp(&b.created_at_epoch))
            })
            .cloned()
    }

    /// Wait up to `timeout` for an eligible bundle.
    pub async fn wait_for_bundle(&self, key: &BundleKey, query: BundleQuery, timeout: Duration) -> Option<Bundle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.best_bundle(key, query).await {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Bundle for a specific run.
    pub async fn bundle_by_run_id(&self, key: &BundleKey, run_id: &RunId, include_consumed: bool) -> Option<Bundle> {
        let state = self.state.lock().await;
        state
            .bundles
            .get(key.as_str())?
            .iter()
            .find(|b| &b.run_id == run_id)
            .filter(|b| include_consumed || !b.consumed)
            .cloned()
    }

    /// Wait up to `timeout` for a specific run's bundle.
    pub async fn wait_for_run_id(
        &self,
        key: &BundleKey,
        run_id: &RunId,
        timeout: Duration,
        include_consumed: bool,
    ) -> Option<Bundle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.bundle_by_run_id(key, run_id, include_consumed).await {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Mark a bundle consumed. Idempotent; returns whether the bundle exists.
    pub async fn mark_consumed(&self, key: &BundleKey, run_id: &RunId) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let Some(bundle) = state
            .bundles
            .get_mut(key.as_str())
            .and_then(|bundles| bundles.iter_mut().find(|b| &b.run_id == run_id))
        else {
            return Ok(false);
        };

        if !bundle.consumed {
            bundle.consumed = true;
            bundle.consumed_at_utc = Some(utc_iso(epoch_now()));
            self.persist(&state).await?;
            drop(state);
            self.changed.notify_waiters();
        }
        Ok(true)
    }

    /// Drop bundles older than `retention_hours`. Returns how many were removed.
    pub async fn cleanup(&self, retention_hours: f64) -> StorageResult<usize> {
        let cutoff = epoch_now() - retention_hours.max(0.0) * 3600.0;
        let mut state = self.state.lock().await;

        let mut removed = 0;
        for bundles in state.bundles.values_mut() {
            let before = bundles.len();
            bundles.retain(|b| b.created_at_epoch >= cutoff);
            removed += before - bundles.len();
        }

        if removed > 0 {
            self.persist(&state).await?;
            debug!(removed, retention_hours, "Pruned expired bundles");
        }
        Ok(removed)
    }

    /// Number of bundles held for `key`.
    pub async fn len(&self, key: &BundleKey) -> usize {
        let state = self.state.lock().await;
        state.bundles.get(key.as_str()).map_or(0, Vec::len)
    }

    async fn persist(&self, state: &StoreState) -> StorageResult<()> {
        let Some(path) = &self.config.state_path else {
            return Ok(());
        };
        let snapshot = StoreState {
            version: STATE_VERSION,
            bundles: state.bundles.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(path, &bytes).await
    }
}

async fn load_state(path: &Path) -> StoreState {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoreState::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read bundle store; starting empty");
            return StoreState::default();
        }
    };

    match serde_json::from_slice::<StoreState>(&raw) {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt bundle store; starting empty");
            StoreState::default()
        }
    }
}
