//! Fetch attempts: retry with backoff, optimistic writes and per-key
//! deduplication of in-flight fetches.

use crate::error::{CallbackError, Error, ErrorKind, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use swr_store::{CacheKey, CacheStore, FetchError, RecordPatch};
use tokio::runtime::Handle;
use tracing::instrument;

pub type FetchResult<T> = std::result::Result<T, FetchError>;
/// Caller-supplied asynchronous operation producing the value for a key.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;
pub type OnSuccess<T> = Arc<dyn Fn(&T) -> std::result::Result<(), CallbackError> + Send + Sync>;
pub type OnError = Arc<dyn Fn(&FetchError) -> std::result::Result<(), CallbackError> + Send + Sync>;

type Flight<T> = Shared<BoxFuture<'static, std::result::Result<T, ErrorKind>>>;

pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Wrap an async closure as a [`Fetcher`].
///
/// ```
/// use swr::revalidate::{fetcher, Fetcher};
///
/// let fetch: Fetcher<u32> = fetcher(|| async { Ok(42) });
/// ```
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Settings for a single [`RevalidationEngine::attempt`].
pub struct AttemptOptions<T> {
    /// Retries after the first failure before giving up.
    pub retry_limit: u32,
    /// Pause before each retry.
    pub retry_interval: Duration,
    /// Written to the record as soon as the attempt starts.
    pub optimistic_data: Option<T>,
    pub on_success: Option<OnSuccess<T>>,
    pub on_error: Option<OnError>,
}

impl<T> Default for AttemptOptions<T> {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            optimistic_data: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl<T: Clone> Clone for AttemptOptions<T> {
    fn clone(&self) -> Self {
        Self {
            retry_limit: self.retry_limit,
            retry_interval: self.retry_interval,
            optimistic_data: self.optimistic_data.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> AttemptOptions<T> {
    pub fn with_retry(mut self, limit: u32, interval: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_interval = interval;
        self
    }

    pub fn with_optimistic_data(mut self, data: T) -> Self {
        self.optimistic_data = Some(data);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) -> std::result::Result<(), CallbackError> + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(
        mut self,
        callback: impl Fn(&FetchError) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// Runs fetches against a [`CacheStore`] and records their outcome.
///
/// At most one fetch per key is in flight at any time: a second
/// [`attempt`](Self::attempt) for a key that is still being fetched waits for
/// the outstanding fetch and receives the same outcome instead of calling its
/// fetcher again.
pub struct RevalidationEngine<T> {
    store: CacheStore<T>,
    in_flight: Arc<Mutex<HashMap<CacheKey, Flight<T>>>>,
}

impl<T> Clone for RevalidationEngine<T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), in_flight: Arc::clone(&self.in_flight) }
    }
}

impl<T: Clone + Send + Sync + 'static> RevalidationEngine<T> {
    pub fn new(store: CacheStore<T>) -> Self {
        Self { store, in_flight: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn store(&self) -> &CacheStore<T> {
        &self.store
    }

    /// Whether a fetch for `key` is currently outstanding.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    /// Fetch the value for `key`, retrying on failure, and store the outcome.
    ///
    /// The attempt number starts at the record's current `retry_count`, so a
    /// key that failed before continues its retry numbering rather than
    /// starting over; only a success resets it. From a clean record the
    /// fetcher is called at most `retry_limit + 1` times, `retry_interval`
    /// apart.
    ///
    /// Exactly one of `on_success`/`on_error` runs when the attempt settles,
    /// never on intermediate retries. If this call joins a fetch that is
    /// already in flight, only the callbacks of the call that started it run.
    ///
    /// # Errors
    /// - [`ErrorKind::Fetch`] with the last fetch error once retries are
    ///   exhausted. The same error is stored on the record.
    /// - [`ErrorKind::Callback`] when a callback fails. The record's loading
    ///   flags are cleared but the outcome is not written.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn attempt(&self, key: &CacheKey, fetcher: &Fetcher<T>, options: &AttemptOptions<T>) -> Result<T> {
        let (flight, joined) = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(flight) => (flight.clone(), true),
                None => {
                    let flight = self.launch(key.clone(), Arc::clone(fetcher), options.clone());
                    in_flight.insert(key.clone(), flight.clone());
                    (flight, false)
                },
            }
        };
        if joined {
            tracing::debug!("Joining fetch already in flight");
            if let Some(data) = options.optimistic_data.clone() {
                self.store.set_state(key, RecordPatch::new().data(data));
            }
        }
        flight.await.map_err(Error::from)
    }

    /// Fetch `base` within `namespace` ahead of any binding, using the default
    /// retry settings, so a binding created later finds the data warm.
    pub async fn preload(&self, namespace: &str, base: &str, fetcher: &Fetcher<T>) -> Result<T> {
        let key = self.store.generate_key(namespace, base);
        self.attempt(&key, fetcher, &AttemptOptions::default()).await
    }

    /// Start the fetch for `key` on the runtime so that it settles even when
    /// every caller waiting on it goes away.
    fn launch(&self, key: CacheKey, fetcher: Fetcher<T>, options: AttemptOptions<T>) -> Flight<T> {
        let mut guard = FlightGuard { store: self.store.clone(), in_flight: Arc::clone(&self.in_flight), key, settled: false };
        let flight = async move {
            let outcome = Self::run(&guard.store, &guard.key, &fetcher, &options).await;
            guard.settled = true;
            outcome
        };
        let Ok(runtime) = Handle::try_current() else {
            // Outside tokio the callers drive the fetch themselves.
            return flight.boxed().shared();
        };
        let task = runtime.spawn(flight);
        async move {
            task.await.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Fetch task ended before settling");
                Err(ErrorKind::Interrupted)
            })
        }
        .boxed()
        .shared()
    }

    async fn run(
        store: &CacheStore<T>,
        key: &CacheKey,
        fetcher: &Fetcher<T>,
        options: &AttemptOptions<T>,
    ) -> std::result::Result<T, ErrorKind> {
        let mut attempt = store.get_state(key).retry_count;
        loop {
            Self::mark_loading(store, key, options);
            match fetcher().await {
                Ok(data) => {
                    if let Some(on_success) = &options.on_success {
                        on_success(&data).map_err(|err| Self::abandon(store, key, err))?;
                    }
                    store.set_state(
                        key,
                        RecordPatch::new().data(data.clone()).clear_error().loading(false).validating(false).retry_count(0),
                    );
                    tracing::debug!(attempt, "Fetch succeeded");
                    return Ok(data);
                },
                Err(error) if attempt < options.retry_limit => {
                    attempt += 1;
                    tracing::warn!(%error, attempt, retry_limit = options.retry_limit, "Fetch failed; retrying");
                    store.set_state(key, RecordPatch::new().retry_count(attempt));
                    tokio::time::sleep(options.retry_interval).await;
                },
                Err(error) => {
                    tracing::warn!(%error, attempt, "Fetch failed; retries exhausted");
                    if let Some(on_error) = &options.on_error {
                        on_error(&error).map_err(|err| Self::abandon(store, key, err))?;
                    }
                    store.set_state(
                        key,
                        RecordPatch::new().error(error.clone()).loading(false).validating(false).retry_count(attempt),
                    );
                    return Err(ErrorKind::Fetch(error));
                },
            }
        }
    }

    /// Flag the record as in flight, writing optimistic data if there is any.
    /// `is_validating` is only set when previously fetched data stays visible.
    fn mark_loading(store: &CacheStore<T>, key: &CacheKey, options: &AttemptOptions<T>) {
        let patch = RecordPatch::new().loading(true);
        let patch = match options.optimistic_data.clone() {
            Some(data) => patch.data(data).validating(false),
            None => {
                let serving = store.get_state(key).data.is_some();
                patch.validating(serving)
            },
        };
        store.set_state(key, patch);
    }

    fn abandon(store: &CacheStore<T>, key: &CacheKey, err: CallbackError) -> ErrorKind {
        tracing::warn!(error = %err, "Callback failed; abandoning update");
        store.set_state(key, RecordPatch::new().loading(false).validating(false));
        ErrorKind::Callback(err)
    }
}

/// Owned by a running fetch. Dropping it releases the key for new fetches,
/// and clears the loading flags if the fetch never got to settle.
struct FlightGuard<T: Clone + Send + Sync + 'static> {
    store: CacheStore<T>,
    in_flight: Arc<Mutex<HashMap<CacheKey, Flight<T>>>>,
    key: CacheKey,
    settled: bool,
}

impl<T: Clone + Send + Sync + 'static> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.key);
        if !self.settled && self.store.contains(&self.key) {
            tracing::debug!(key = %self.key, "Fetch abandoned before settling");
            self.store.set_state(&self.key, RecordPatch::new().loading(false).validating(false));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
