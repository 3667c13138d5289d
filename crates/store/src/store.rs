use crate::{CacheKey, CacheRecord, RecordPatch};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use swr_config::StoreConfig;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::instrument;

/// Shared table of fetch-state records.
///
/// Cloning a `CacheStore` creates a new handle to the **same** records; every
/// binding and engine working against one logical cache should share clones of
/// one store.
///
/// # Expiry
/// There are two separate expiry mechanisms:
///
/// - [`is_expired`](Self::is_expired) answers "should this key be fetched
///   again?" against a per-call TTL (falling back to the default TTL).
/// - A background sweep evicts every record older than the **default** TTL,
///   regardless of the TTLs consumers use. It starts on the first write into a
///   non-empty store and stops on its own as soon as the store is empty again,
///   so an idle store never keeps a periodic task alive.
pub struct CacheStore<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    default_ttl: Duration,
    sweep_interval: Duration,
    state: Mutex<State<T>>,
}

struct State<T> {
    records: HashMap<CacheKey, CacheRecord<T>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> Clone for CacheStore<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl<T> CacheStore<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for CacheStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CacheStore")
            .field("default_ttl", &self.inner.default_ttl)
            .field("sweep_interval", &self.inner.sweep_interval)
            .field("records", &state.records.len())
            .field("sweeping", &state.sweeper.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for CacheStore<T> {
    fn default() -> Self {
        Self::with_config(&StoreConfig::default())
    }
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
    /// Create an empty store using the default TTL (5 minutes) and sweep
    /// interval (60 seconds).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &StoreConfig) -> Self {
        Self::with_timings(config.default_ttl(), config.sweep_interval())
    }

    pub fn with_timings(default_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_ttl,
                sweep_interval,
                state: Mutex::new(State { records: HashMap::new(), sweeper: None }),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Build the key for `base` within `namespace`.
    pub fn generate_key(&self, namespace: impl Into<String>, base: impl Into<String>) -> CacheKey {
        CacheKey::new(namespace, base)
    }

    /// Return a copy of the record for `key`.
    ///
    /// Reading a key that has never been seen creates and stores an empty,
    /// `initialized` record, which stays expired until the first real write.
    pub fn get_state(&self, key: &CacheKey) -> CacheRecord<T> {
        let mut state = self.lock();
        state.records.entry(key.clone()).or_insert_with(CacheRecord::placeholder).clone()
    }

    /// Merge `patch` over the record for `key`, stamp it with the current
    /// time and return a copy of the result.
    pub fn set_state(&self, key: &CacheKey, patch: RecordPatch<T>) -> CacheRecord<T> {
        let mut state = self.lock();
        let record = state.records.entry(key.clone()).or_insert_with(CacheRecord::placeholder);
        record.apply(patch);
        let record = record.clone();
        self.start_sweeper(&mut state);
        record
    }

    /// Remove the record for `key`, if any.
    pub fn delete_state(&self, key: &CacheKey) {
        let mut state = self.lock();
        state.records.remove(key);
        Self::stop_sweeper_if_empty(&mut state);
    }

    /// Remove every record belonging to `namespace`, returning how many were
    /// removed.
    #[instrument(skip(self))]
    pub fn clear_namespace(&self, namespace: &str) -> usize {
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|key, _| key.namespace() != namespace);
        let removed = before - state.records.len();
        Self::stop_sweeper_if_empty(&mut state);
        tracing::info!(removed, "Cleared namespace");
        removed
    }

    /// Whether `key` should be fetched again.
    ///
    /// True when the record is missing, has never been written, or is older
    /// than `ttl` (the default TTL when `None`). Unlike
    /// [`get_state`](Self::get_state), this never creates a record.
    pub fn is_expired(&self, key: &CacheKey, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        let state = self.lock();
        match state.records.get(key) {
            None => true,
            Some(record) if record.initialized => true,
            Some(record) => Instant::now().saturating_duration_since(record.timestamp) > ttl,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Whether the background sweep task is currently scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.lock().sweeper.as_ref().is_some_and(|sweeper| !sweeper.is_finished())
    }

    /// Run one sweep pass, evicting every record older than the default TTL.
    ///
    /// Called periodically by the background task, but safe to call by hand.
    /// Returns the number of evicted records.
    pub fn sweep(&self) -> usize {
        let ttl = self.inner.default_ttl;
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|_, record| now.saturating_duration_since(record.timestamp) <= ttl);
        let removed = before - state.records.len();
        Self::stop_sweeper_if_empty(&mut state);
        if removed > 0 {
            tracing::debug!(removed, remaining = state.records.len(), "Swept expired records");
        }
        removed
    }

    /// Stop the background sweep. Records are kept; the next write restarts
    /// the sweep.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.lock().sweeper.take() {
            tracing::debug!("Stopping background sweep");
            sweeper.abort();
        }
    }

    fn start_sweeper(&self, state: &mut State<T>) {
        if state.records.is_empty() || state.sweeper.as_ref().is_some_and(|sweeper| !sweeper.is_finished()) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!("No async runtime available; background sweep not started");
            return;
        };
        tracing::debug!(interval = ?self.inner.sweep_interval, "Starting background sweep");
        let store = Arc::downgrade(&self.inner);
        let period = self.inner.sweep_interval;
        state.sweeper = Some(runtime.spawn(Self::run_sweeper(store, period)));
    }

    async fn run_sweeper(store: Weak<Inner<T>>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Only hold the store for the duration of one pass; once every
            // handle is gone the task winds down on its own.
            let Some(inner) = store.upgrade() else { break };
            let store = CacheStore { inner };
            store.sweep();
            if store.is_empty() {
                break;
            }
        }
    }

    fn stop_sweeper_if_empty(state: &mut State<T>) {
        if !state.records.is_empty() {
            return;
        }
        if let Some(sweeper) = state.sweeper.take() {
            tracing::debug!("Store drained; stopping background sweep");
            sweeper.abort();
        }
    }
}
