//! Dependency watching and debounced revalidation.
//!
//! A binding can declare host values it depends on. Whenever one of them is
//! written, the binding should fetch again, but a burst of writes (a user
//! typing, several fields updated one after another) must not turn into a
//! burst of fetches. Every change restarts one shared timer per binding, and
//! the action only runs once the timer expires without being restarted.

use crate::host::{HostHandle, Subscription};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Work run once a burst of changes has settled.
pub type DebouncedAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Coalesces triggers into a single delayed action.
///
/// Each [`trigger`](Self::trigger) supersedes any trigger still waiting out its
/// window; superseded triggers are dropped, not queued. Only one timer is
/// pending at a time. An action that has already started runs as its own
/// task and is never interrupted by a later trigger.
#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
    action: DebouncedAction,
}

impl Debouncer {
    pub fn new(window: Duration, action: DebouncedAction) -> Self {
        Self { window, pending: Arc::new(Mutex::new(None)), action }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedule the action to run after the window, unless another trigger
    /// arrives first. Returns whether a pending trigger was superseded.
    pub fn trigger(&self) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No async runtime available; dropping debounced trigger");
            return false;
        };
        let action = Arc::clone(&self.action);
        let window = self.window;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(window).await;
            tokio::spawn(action());
        });
        let Some(previous) = lock(&self.pending).replace(timer) else { return false };
        let superseded = !previous.is_finished();
        previous.abort();
        if superseded {
            tracing::debug!("Trigger superseded by a later change");
        }
        superseded
    }

    /// Whether a trigger is waiting out its window.
    pub fn is_pending(&self) -> bool {
        lock(&self.pending).as_ref().is_some_and(|timer| !timer.is_finished())
    }
}

/// Observes a binding's declared dependencies on its host.
///
/// Installing a watch is idempotent per dependency name: asking to watch the
/// same name again never registers a second observer with the host. The
/// observers are removed from the host when the last clone of the watcher is
/// dropped.
#[derive(Clone)]
pub struct DependencyWatcher {
    host: HostHandle,
    state: Arc<WatchState>,
}

struct WatchState {
    debouncer: Debouncer,
    watching: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Last value seen for each dependency.
    shadow: Mutex<HashMap<String, Value>>,
}

impl DependencyWatcher {
    pub fn new(host: HostHandle, window: Duration, action: DebouncedAction) -> Self {
        Self {
            host,
            state: Arc::new(WatchState {
                debouncer: Debouncer::new(window, action),
                watching: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
                shadow: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Watch every name in `deps`, returning how many observers were newly
    /// installed.
    pub fn watch<I, S>(&self, deps: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut installed = 0;
        for name in deps {
            let name = name.as_ref();
            if !lock(&self.state.watching).insert(name.to_string()) {
                continue;
            }
            let state = Arc::downgrade(&self.state);
            let dependency = name.to_string();
            let subscription =
                self.host.observe(name, Arc::new(move |value: &Value| Self::changed(&state, &dependency, value)));
            lock(&self.state.subscriptions).push(subscription);
            tracing::debug!(dependency = name, "Watching dependency");
            installed += 1;
        }
        installed
    }

    pub fn is_watching(&self, name: &str) -> bool {
        lock(&self.state.watching).contains(name)
    }

    /// Last value observed for `name` since the watch was installed.
    pub fn last_value(&self, name: &str) -> Option<Value> {
        lock(&self.state.shadow).get(name).cloned()
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.state.debouncer
    }

    fn changed(state: &Weak<WatchState>, dependency: &str, value: &Value) {
        // The host may outlive the binding that installed the observer.
        let Some(state) = state.upgrade() else { return };
        lock(&state.shadow).insert(dependency.to_string(), value.clone());
        tracing::debug!(dependency, "Dependency changed");
        state.debouncer.trigger();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
