//! Per-consumer bindings between a cache key and a host view.

use crate::error::{ErrorKind, Result};
use crate::host::{HostHandle, TeardownHook};
use crate::revalidate::{AttemptOptions, Fetcher, OnError, OnSuccess, RevalidationEngine};
use crate::watch::{DebouncedAction, DependencyWatcher};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use swr_config::RevalidateConfig;
use swr_store::{CacheKey, CacheRecord, FetchError};
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::instrument;

/// Per-binding settings.
pub struct SwrOptions<T> {
    /// Host values whose changes trigger a debounced revalidation.
    pub deps: Vec<String>,
    /// Freshness window; the store's default TTL when `None`.
    pub ttl: Option<Duration>,
    /// Fetch on construction when the cached record is expired.
    pub fire_immediately: bool,
    pub retry_limit: u32,
    pub retry_interval: Duration,
    pub debounce: Duration,
    /// Revalidate periodically until teardown.
    pub refresh_interval: Option<Duration>,
    /// Let [`Binding::on_show`] revalidate expired data.
    pub refresh_on_show: bool,
    pub on_success: Option<OnSuccess<T>>,
    pub on_error: Option<OnError>,
}

impl<T> Default for SwrOptions<T> {
    fn default() -> Self {
        Self::from_config(&RevalidateConfig::default())
    }
}

impl<T> Clone for SwrOptions<T> {
    fn clone(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            ttl: self.ttl,
            fire_immediately: self.fire_immediately,
            retry_limit: self.retry_limit,
            retry_interval: self.retry_interval,
            debounce: self.debounce,
            refresh_interval: self.refresh_interval,
            refresh_on_show: self.refresh_on_show,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> std::fmt::Debug for SwrOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrOptions")
            .field("deps", &self.deps)
            .field("ttl", &self.ttl)
            .field("fire_immediately", &self.fire_immediately)
            .field("retry_limit", &self.retry_limit)
            .field("retry_interval", &self.retry_interval)
            .field("debounce", &self.debounce)
            .field("refresh_interval", &self.refresh_interval)
            .field("refresh_on_show", &self.refresh_on_show)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T> SwrOptions<T> {
    /// Options seeded from loaded configuration.
    pub fn from_config(config: &RevalidateConfig) -> Self {
        Self {
            deps: Vec::new(),
            ttl: None,
            fire_immediately: config.fire_immediately,
            retry_limit: config.retry_limit,
            retry_interval: config.retry_interval(),
            debounce: config.debounce(),
            refresh_interval: None,
            refresh_on_show: false,
            on_success: None,
            on_error: None,
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_fire_immediately(mut self, fire_immediately: bool) -> Self {
        self.fire_immediately = fire_immediately;
        self
    }

    pub fn with_retry(mut self, limit: u32, interval: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_interval = interval;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn with_refresh_on_show(mut self, refresh_on_show: bool) -> Self {
        self.refresh_on_show = refresh_on_show;
        self
    }

    pub fn with_on_success(
        mut self,
        callback: impl Fn(&T) -> std::result::Result<(), crate::error::CallbackError> + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn with_on_error(
        mut self,
        callback: impl Fn(&FetchError) -> std::result::Result<(), crate::error::CallbackError> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// One entry of [`Binding::batch_mutate`]: a sibling key in the binding's
/// namespace and how to fetch it.
pub struct BatchItem<T> {
    pub base_key: String,
    pub fetcher: Fetcher<T>,
    pub optimistic_data: Option<T>,
}

impl<T> BatchItem<T> {
    pub fn new(base_key: impl Into<String>, fetcher: Fetcher<T>) -> Self {
        Self { base_key: base_key.into(), fetcher, optimistic_data: None }
    }

    pub fn with_optimistic_data(mut self, data: T) -> Self {
        self.optimistic_data = Some(data);
        self
    }
}

/// Connects one cache key to one host.
///
/// The record for the key is projected into the host view under the base key
/// as `{data, isLoading, isValidating, error}` whenever a fetch started
/// through this binding settles. When the host is torn down, every record in
/// its namespace is dropped from the store.
///
/// Cloning is cheap; clones refer to the same binding.
pub struct Binding<T> {
    inner: Arc<BindingInner<T>>,
}

struct BindingInner<T> {
    engine: RevalidationEngine<T>,
    host: HostHandle,
    key: CacheKey,
    fetcher: Fetcher<T>,
    options: SwrOptions<T>,
    watcher: DependencyWatcher,
    torn_down: Arc<AtomicBool>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Serialize + Send + Sync + 'static> Binding<T> {
    /// Bind `base_key` within the host's namespace.
    ///
    /// Background work (the initial fetch, refresh polling and debounced
    /// dependency fetches) is spawned on the current tokio runtime; without
    /// one it is skipped with a warning.
    #[instrument(skip_all, fields(namespace = host.namespace(), base_key = base_key))]
    pub fn new(
        engine: RevalidationEngine<T>,
        host: HostHandle,
        base_key: &str,
        fetcher: Fetcher<T>,
        options: SwrOptions<T>,
    ) -> Self {
        let key = engine.store().generate_key(host.namespace(), base_key);
        let inner = Arc::new_cyclic(|weak: &Weak<BindingInner<T>>| {
            let weak = weak.clone();
            let action: DebouncedAction = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Binding { inner }.revalidate_logged().await;
                    }
                }
                .boxed()
            });
            BindingInner {
                watcher: DependencyWatcher::new(Arc::clone(&host), options.debounce, action),
                engine,
                host,
                key,
                fetcher,
                options,
                torn_down: Arc::new(AtomicBool::new(false)),
            }
        });
        let binding = Self { inner };

        binding.inner.engine.store().get_state(&binding.inner.key);
        if binding.inner.host.read(base_key).is_none() {
            binding.project();
        }
        binding.watch_dependencies();
        binding.register_teardown();

        let options = &binding.inner.options;
        if options.fire_immediately && binding.inner.engine.store().is_expired(&binding.inner.key, options.ttl) {
            binding.spawn_revalidate();
        }
        if let Some(period) = options.refresh_interval {
            binding.spawn_refresh(period);
        }
        binding
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn base_key(&self) -> &str {
        self.inner.key.base()
    }

    pub fn watcher(&self) -> &DependencyWatcher {
        &self.inner.watcher
    }

    pub fn current_state(&self) -> CacheRecord<T> {
        self.inner.engine.store().get_state(&self.inner.key)
    }

    /// Fetch the bound key, writing `optimistic_data` to the record first when
    /// given, and project the outcome into the host.
    ///
    /// The view is updated whether or not the fetch succeeds. If the host is
    /// torn down while the fetch runs, its outcome is returned but dropped
    /// from the store and never projected.
    pub async fn mutate(&self, optimistic_data: Option<T>) -> Result<T> {
        let mut options = self.attempt_options();
        options.optimistic_data = optimistic_data;
        options.on_success = self.inner.options.on_success.clone();
        options.on_error = self.inner.options.on_error.clone();
        let outcome = self.inner.engine.attempt(&self.inner.key, &self.inner.fetcher, &options).await;
        if self.is_torn_down() {
            self.discard([&self.inner.key]);
        } else {
            self.project();
        }
        outcome
    }

    /// Fetch several keys next to this binding's key concurrently, then
    /// project this binding's own key once.
    ///
    /// Every item runs to completion; the first failure in item order is
    /// returned afterwards. Callbacks are not run for batch items.
    #[instrument(skip_all, fields(key = %self.inner.key, items = items.len()))]
    pub async fn batch_mutate(&self, items: Vec<BatchItem<T>>) -> Result<Vec<T>> {
        let engine = &self.inner.engine;
        let keys: Vec<CacheKey> = items.iter().map(|item| self.inner.key.sibling(item.base_key.as_str())).collect();
        let attempts = items.into_iter().zip(&keys).map(|(BatchItem { fetcher, optimistic_data, .. }, key)| {
            let mut options = self.attempt_options();
            options.optimistic_data = optimistic_data;
            async move { engine.attempt(key, &fetcher, &options).await }
        });
        let outcomes = join_all(attempts).await;
        if self.is_torn_down() {
            self.discard(&keys);
        } else {
            self.project();
        }
        outcomes.into_iter().collect()
    }

    pub async fn revalidate(&self) -> Result<T> {
        self.mutate(None).await
    }

    /// Tell the binding its host became visible again.
    ///
    /// With `refresh_on_show` set and an expired record, a revalidation is
    /// started in the background. Returns whether one was started.
    pub fn on_show(&self) -> bool {
        let options = &self.inner.options;
        if !options.refresh_on_show || self.is_torn_down() {
            return false;
        }
        if !self.inner.engine.store().is_expired(&self.inner.key, options.ttl) {
            return false;
        }
        self.spawn_revalidate()
    }

    /// Whether the host has been torn down. A torn-down binding no longer
    /// fetches in the background or writes to its host.
    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    fn attempt_options(&self) -> AttemptOptions<T> {
        AttemptOptions::default().with_retry(self.inner.options.retry_limit, self.inner.options.retry_interval)
    }

    async fn revalidate_logged(&self) {
        if self.is_torn_down() {
            tracing::debug!(key = %self.inner.key, "Host torn down; skipping background revalidation");
            return;
        }
        if let Err(err) = self.revalidate().await {
            let kind: &ErrorKind = &err;
            tracing::warn!(key = %self.inner.key, error = %kind, "Background revalidation failed");
        }
    }

    fn spawn_revalidate(&self) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(key = %self.inner.key, "No async runtime available; skipping background revalidation");
            return false;
        };
        let binding = self.clone();
        runtime.spawn(async move { binding.revalidate_logged().await });
        true
    }

    fn spawn_refresh(&self, period: Duration) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(key = %self.inner.key, "No async runtime available; refresh polling disabled");
            return;
        };
        runtime.spawn(Self::poll(Arc::downgrade(&self.inner), period));
    }

    async fn poll(binding: Weak<BindingInner<T>>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = binding.upgrade() else { break };
            if inner.torn_down.load(Ordering::SeqCst) {
                break;
            }
            Binding { inner }.revalidate_logged().await;
        }
        tracing::debug!("Refresh polling stopped");
    }

    fn watch_dependencies(&self) {
        let base = self.base_key();
        let deps = self.inner.options.deps.iter().filter(|dep| {
            // The projection itself writes this name.
            let own = dep.as_str() == base;
            if own {
                tracing::warn!(dependency = %dep, "Ignoring dependency on the binding's own view");
            }
            !own
        });
        self.inner.watcher.watch(deps);
    }

    fn register_teardown(&self) {
        let store = self.inner.engine.store().clone();
        let namespace = self.inner.key.namespace().to_string();
        let torn_down = Arc::clone(&self.inner.torn_down);
        let hook: TeardownHook = Box::new(move || {
            torn_down.store(true, Ordering::SeqCst);
            store.clear_namespace(&namespace);
        });
        self.inner.host.on_teardown(hook);
    }

    /// Drop records written by fetches that settled after teardown.
    fn discard<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        let store = self.inner.engine.store();
        for key in keys {
            store.delete_state(key);
        }
        tracing::debug!(key = %self.inner.key, "Discarded fetch outcome after teardown");
    }

    /// Write the live record into the host view.
    fn project(&self) {
        if self.is_torn_down() {
            return;
        }
        let record = self.current_state();
        let data = match record.data.as_ref().map(serde_json::to_value).transpose() {
            Ok(data) => data.unwrap_or(Value::Null),
            Err(error) => {
                tracing::warn!(key = %self.inner.key, %error, "Cached data could not be serialized for the view");
                Value::Null
            },
        };
        let error = record.error.as_ref().map_or(Value::Null, |error| Value::String(error.to_string()));
        let base = self.base_key();
        self.inner.host.write(vec![
            (format!("{base}.data"), data),
            (format!("{base}.isLoading"), Value::Bool(record.is_loading)),
            (format!("{base}.isValidating"), Value::Bool(record.is_validating)),
            (format!("{base}.error"), error),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use crate::host::{Host, MemoryHost};
    use crate::revalidate::fetcher;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use swr_store::{CacheStore, RecordPatch};

    #[derive(Clone, Debug, PartialEq, Serialize)]
    struct Payload {
        value: String,
    }

    fn payload(value: &str) -> Payload {
        Payload { value: value.to_string() }
    }

    fn counting_fetcher(value: &'static str) -> (Arc<AtomicUsize>, Fetcher<Payload>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch = fetcher(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(payload(value))
            }
        });
        (calls, fetch)
    }

    fn failing_fetcher(message: &'static str) -> Fetcher<Payload> {
        fetcher(move || async move { Err(FetchError::msg(message)) })
    }

    fn setup() -> (RevalidationEngine<Payload>, Arc<MemoryHost>) {
        (RevalidationEngine::new(CacheStore::new()), Arc::new(MemoryHost::new("test-page")))
    }

    fn quiet() -> SwrOptions<Payload> {
        SwrOptions::default().with_fire_immediately(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_projection() {
        let (engine, host) = setup();
        let (_calls, fetch) = counting_fetcher("test");
        let binding = Binding::new(engine, host.clone(), "testData", fetch, quiet());
        assert_eq!(
            host.read("testData"),
            Some(json!({"data": null, "isLoading": false, "isValidating": false, "error": null}))
        );
        assert!(binding.current_state().initialized);
        assert_eq!(binding.key().to_string(), "test-page_testData");
        assert_eq!(binding.base_key(), "testData");
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_view_not_overwritten() {
        let (engine, _) = setup();
        let host = Arc::new(MemoryHost::with_values("test-page", [("testData", json!("server-rendered"))]));
        let (_calls, fetch) = counting_fetcher("test");
        Binding::new(engine, host.clone(), "testData", fetch, quiet());
        assert_eq!(host.read("testData"), Some(json!("server-rendered")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_projects_result() {
        let (engine, host) = setup();
        let (_calls, fetch) = counting_fetcher("test");
        let options = quiet().with_ttl(Duration::ZERO);
        let binding = Binding::new(engine, host.clone(), "testData", fetch, options);

        let value = binding.mutate(None).await.unwrap();
        assert_eq!(value, payload("test"));
        let view = host.read("testData").unwrap();
        assert_eq!(view["data"], json!({"value": "test"}));
        assert_eq!(view["isLoading"], json!(false));
        assert_eq!(view["error"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_immediately_when_expired() {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        Binding::new(engine, host.clone(), "testData", fetch, SwrOptions::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.read("testData").unwrap()["data"], json!({"value": "test"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_preloaded_data_skips_initial_fetch() {
        let (engine, host) = setup();
        let (preload_calls, preload) = counting_fetcher("warm");
        engine.preload("test-page", "testData", &preload).await.unwrap();

        let (calls, fetch) = counting_fetcher("test");
        let binding = Binding::new(engine, host.clone(), "testData", fetch, SwrOptions::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(preload_calls.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(binding.current_state().data, Some(payload("warm")));
        assert_eq!(host.read("testData").unwrap()["data"], json!({"value": "warm"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_still_projected() {
        let (engine, host) = setup();
        let options = quiet().with_retry(2, Duration::from_millis(100));
        let binding = Binding::new(engine, host.clone(), "testData", failing_fetcher("boom"), options);

        let err = binding.mutate(None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Fetch(_)));
        let view = host.read("testData").unwrap();
        assert_eq!(view["isLoading"], json!(false));
        assert_eq!(view["error"], json!("boom"));
        assert_eq!(binding.current_state().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_fire_from_options() {
        let (engine, host) = setup();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let options = quiet().with_retry(1, Duration::from_millis(10)).with_on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let binding = Binding::new(engine, host, "testData", failing_fetcher("boom"), options);
        binding.revalidate().await.unwrap_err();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_success_leaves_view_untouched() {
        let (engine, host) = setup();
        let (_calls, fetch) = counting_fetcher("test");
        let options = quiet().with_on_success(|_| Err(CallbackError::msg("nope")));
        let binding = Binding::new(engine, host.clone(), "testData", fetch, options);
        let err = binding.mutate(None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Callback(_)));
        assert_eq!(host.read("testData").unwrap()["data"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_update() {
        let (engine, host) = setup();
        let fetch = fetcher(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(payload("confirmed"))
        });
        let binding = Binding::new(engine, host.clone(), "testData", fetch, quiet());
        let pending = tokio::spawn({
            let binding = binding.clone();
            async move { binding.mutate(Some(payload("optimistic"))).await.is_ok() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = binding.current_state();
        assert_eq!(record.data, Some(payload("optimistic")));
        assert!(record.is_loading);

        assert!(pending.await.unwrap());
        assert_eq!(host.read("testData").unwrap()["data"], json!({"value": "confirmed"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_mutates_fetch_once() {
        let (engine, host) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch = fetcher(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(payload("shared"))
            }
        });
        let binding = Binding::new(engine, host, "testData", fetch, quiet());
        let (first, second) = tokio::join!(binding.mutate(None), binding.mutate(None));
        assert_eq!(first.unwrap(), payload("shared"));
        assert_eq!(second.unwrap(), payload("shared"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mutate() {
        let (engine, host) = setup();
        let (_calls, fetch) = counting_fetcher("primary");
        let binding = Binding::new(engine.clone(), host.clone(), "testData", fetch, quiet());
        let projections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&projections);
        let _subscription = host.observe(
            "testData",
            Arc::new(move |_: &Value| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (_a, fetch_a) = counting_fetcher("a");
        let (_b, fetch_b) = counting_fetcher("b");
        let values = binding
            .batch_mutate(vec![BatchItem::new("first", fetch_a), BatchItem::new("second", fetch_b)])
            .await
            .unwrap();
        assert_eq!(values, vec![payload("a"), payload("b")]);
        assert_eq!(projections.load(Ordering::SeqCst), 1);

        let store = engine.store();
        assert_eq!(store.get_state(&binding.key().sibling("first")).data, Some(payload("a")));
        assert_eq!(store.get_state(&binding.key().sibling("second")).data, Some(payload("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mutate_waits_for_all_before_failing() {
        let (engine, host) = setup();
        let (_calls, fetch) = counting_fetcher("primary");
        let options = quiet().with_retry(0, Duration::ZERO);
        let binding = Binding::new(engine.clone(), host, "testData", fetch, options);
        let slow = fetcher(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(payload("slow"))
        });
        let items = vec![BatchItem::new("broken", failing_fetcher("down")), BatchItem::new("slow", slow)];

        let err = binding.batch_mutate(items).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Fetch(e) if e.to_string() == "down"));
        assert_eq!(engine.store().get_state(&binding.key().sibling("slow")).data, Some(payload("slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_changes_debounced() {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        let options = quiet().with_deps(["dep1", "dep2"]).with_debounce(Duration::from_millis(300));
        let binding = Binding::new(engine, host.clone(), "testData", fetch, options);

        host.set("dep1", json!("a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.set("dep2", json!("b"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.set("dep1", json!("c"));
        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.read("testData").unwrap()["data"], json!({"value": "test"}));
        assert_eq!(binding.watcher().last_value("dep1"), Some(json!("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_view_is_never_a_dependency() {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        let options = quiet().with_deps(["testData", "dep1"]);
        let binding = Binding::new(engine, host, "testData", fetch, options);
        assert!(!binding.watcher().is_watching("testData"));
        assert!(binding.watcher().is_watching("dep1"));

        binding.mutate(None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_clears_namespace_and_chains() {
        let (engine, host) = setup();
        let earlier = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&earlier);
        host.on_teardown(Box::new(move || flag.store(true, Ordering::SeqCst)));

        let (_calls, fetch) = counting_fetcher("test");
        let binding = Binding::new(engine.clone(), host.clone(), "testData", fetch, quiet());
        binding.mutate(None).await.unwrap();
        let store = engine.store();
        let sibling = binding.key().sibling("other");
        store.set_state(&sibling, RecordPatch::new().data(payload("x")));
        let elsewhere = store.generate_key("another-page", "testData");
        store.set_state(&elsewhere, RecordPatch::new().data(payload("y")));

        host.teardown();
        assert!(earlier.load(Ordering::SeqCst));
        assert!(!store.contains(binding.key()));
        assert!(!store.contains(&sibling));
        assert!(store.contains(&elsewhere));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_interval_polls_until_teardown() {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        let options = quiet().with_refresh_interval(Duration::from_secs(1));
        let _binding = Binding::new(engine, host.clone(), "testData", fetch, options);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        host.teardown();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    fn slow_fetcher(value: &'static str, delay: Duration) -> (Arc<AtomicUsize>, Fetcher<Payload>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch = fetcher(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(payload(value))
            }
        });
        (calls, fetch)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_settling_after_teardown_is_discarded() {
        let (engine, host) = setup();
        let (calls, fetch) = slow_fetcher("late", Duration::from_millis(100));
        let binding = Binding::new(engine.clone(), host.clone(), "testData", fetch, SwrOptions::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        host.teardown();
        assert!(binding.is_torn_down());
        assert!(!engine.store().contains(binding.key()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!engine.store().contains(binding.key()));
        assert!(!engine.store().is_sweeping());
        assert_eq!(host.read("testData").unwrap()["data"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_changes_ignored_after_teardown() {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        let options = quiet().with_deps(["dep1"]);
        let binding = Binding::new(engine.clone(), host.clone(), "testData", fetch, options);

        host.teardown();
        host.set("dep1", json!("changed"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!engine.store().contains(binding.key()));
        assert!(!binding.on_show());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_change_during_fetch_does_not_cancel_it() {
        let (engine, host) = setup();
        let (calls, fetch) = slow_fetcher("test", Duration::from_millis(200));
        let options = quiet().with_deps(["dep1"]).with_debounce(Duration::from_millis(300));
        let binding = Binding::new(engine.clone(), host.clone(), "testData", fetch, options);

        host.set("dep1", json!(1));
        // First fetch runs from 300ms to 500ms; this change lands in between.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        host.set("dep1", json!(2));

        tokio::time::sleep(Duration::from_millis(151)).await;
        assert_eq!(binding.current_state().data, Some(payload("test")));
        assert!(!engine.is_in_flight(binding.key()));

        // Second fetch runs from 650ms to 850ms.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!binding.current_state().is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_stops_when_binding_dropped() {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        let options = quiet().with_refresh_interval(Duration::from_secs(1));
        let binding = Binding::new(engine, host, "testData", fetch, options);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(binding);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case(true, 2)]
    #[case(false, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_on_show(#[case] refresh_on_show: bool, #[case] expected_calls: usize) {
        let (engine, host) = setup();
        let (calls, fetch) = counting_fetcher("test");
        let options = quiet().with_ttl(Duration::from_millis(100)).with_refresh_on_show(refresh_on_show);
        let binding = Binding::new(engine, host, "testData", fetch, options);
        binding.mutate(None).await.unwrap();

        // Still fresh.
        assert!(!binding.on_show());
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(binding.on_show(), refresh_on_show);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
    }

    #[test]
    fn test_options_from_config() {
        let config = RevalidateConfig { retry_limit: 5, retry_interval_ms: 20, debounce_ms: 40, fire_immediately: false };
        let options = SwrOptions::<Payload>::from_config(&config);
        assert_eq!(options.retry_limit, 5);
        assert_eq!(options.retry_interval, Duration::from_millis(20));
        assert_eq!(options.debounce, Duration::from_millis(40));
        assert!(!options.fire_immediately);
        assert!(options.deps.is_empty());
        assert_eq!(options.ttl, None);
    }

    #[test]
    fn test_no_runtime_skips_background_work() {
        let engine = RevalidationEngine::new(CacheStore::new());
        let host = Arc::new(MemoryHost::new("test-page"));
        let (calls, fetch) = counting_fetcher("test");
        let binding = Binding::new(engine, host.clone(), "testData", fetch, SwrOptions::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(host.read("testData").is_some());
        assert!(binding.current_state().initialized);
    }
}
