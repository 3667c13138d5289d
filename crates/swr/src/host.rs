//! The host collaborator: whatever owns the view a binding projects into.
//!
//! The engine never renders anything itself. It only needs to read and write
//! named values on the host, to be told when one of them changes, and to be
//! told when the host goes away. [`MemoryHost`] is a complete in-process
//! implementation, useful on its own and in tests.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Called with the new value of an observed name after every write to it.
pub type Observer = Arc<dyn Fn(&Value) + Send + Sync>;
/// Run once when the host is discarded.
pub type TeardownHook = Box<dyn FnOnce() + Send>;
pub type HostHandle = Arc<dyn Host + Send + Sync>;

/// Keeps an observer installed. Dropping it removes the observer from the
/// host.
#[must_use = "the observer is removed as soon as the subscription is dropped"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Capabilities a binding requires from its host.
pub trait Host: Send + Sync {
    /// Identity of this host. Every cache key a binding creates is scoped by
    /// it, and it is cleared as a whole on teardown, so distinct hosts must
    /// use distinct namespaces.
    fn namespace(&self) -> &str;

    /// Current value bound under the top-level `name`, if any.
    fn read(&self, name: &str) -> Option<Value>;

    /// Apply a partial update. Each path is dot-separated (`"user.data"`) and
    /// replaces only the value at that path, creating intermediate objects as
    /// needed. Applied synchronously, in order.
    fn write(&self, updates: Vec<(String, Value)>);

    /// Register `observer` for changes to the top-level `name` for as long as
    /// the returned [`Subscription`] is kept.
    fn observe(&self, name: &str, observer: Observer) -> Subscription;

    /// Register a teardown hook. Hooks chain: registering one never discards
    /// those registered before it.
    fn on_teardown(&self, hook: TeardownHook);
}

/// In-memory [`Host`] backed by a JSON object.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use swr::host::{Host, MemoryHost};
///
/// let host = MemoryHost::new("home");
/// host.write(vec![("user.data".to_string(), json!({"name": "alice"}))]);
/// assert_eq!(host.read("user"), Some(json!({"data": {"name": "alice"}})));
/// ```
pub struct MemoryHost {
    namespace: String,
    view: Mutex<Map<String, Value>>,
    observers: Arc<Mutex<ObserverTable>>,
    next_observer: AtomicU64,
    teardown: Mutex<Option<TeardownHook>>,
    torn_down: AtomicBool,
}

impl MemoryHost {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_values(namespace, std::iter::empty::<(String, Value)>())
    }

    /// Create a host whose view starts out with `values`.
    pub fn with_values(
        namespace: impl Into<String>,
        values: impl IntoIterator<Item = (impl Into<String>, Value)>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            view: Mutex::new(values.into_iter().map(|(name, value)| (name.into(), value)).collect()),
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_observer: AtomicU64::new(0),
            teardown: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Convenience wrapper around [`Host::write`] for a single path.
    pub fn set(&self, path: impl Into<String>, value: Value) {
        self.write(vec![(path.into(), value)]);
    }

    /// Copy of the whole view.
    pub fn snapshot(&self) -> Value {
        Value::Object(lock(&self.view).clone())
    }

    /// Number of observers installed for `name`.
    pub fn observer_count(&self, name: &str) -> usize {
        lock(&self.observers).get(name).map_or(0, Vec::len)
    }

    /// Run the chained teardown hooks, most recently registered first. Only
    /// the first call has any effect.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = lock(&self.teardown).take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl Host for MemoryHost {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn read(&self, name: &str) -> Option<Value> {
        lock(&self.view).get(name).cloned()
    }

    fn write(&self, updates: Vec<(String, Value)>) {
        let mut touched: Vec<String> = Vec::new();
        {
            let mut view = lock(&self.view);
            for (path, value) in updates {
                let name = path.split('.').next().unwrap_or_default().to_string();
                set_path(&mut view, &path, value);
                if !touched.contains(&name) {
                    touched.push(name);
                }
            }
        }
        // Observers may write back into the host, so neither lock can be held
        // while they run.
        for name in touched {
                let observers: Vec<Observer> = lock(&self.observers)
                .get(&name)
                .map(|installed| installed.iter().map(|(_, observer)| Arc::clone(observer)).collect())
                .unwrap_or_default();
            if observers.is_empty() {
                continue;
            }
            let value = self.read(&name).unwrap_or(Value::Null);
            for observer in observers {
                observer(&value);
            }
        }
    }

    fn observe(&self, name: &str, observer: Observer) -> Subscription {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        lock(&self.observers).entry(name.to_string()).or_default().push((id, observer));
        let table: Weak<Mutex<ObserverTable>> = Arc::downgrade(&self.observers);
        let name = name.to_string();
        Subscription::new(move || {
            let Some(table) = table.upgrade() else { return };
            let mut table = lock(&table);
            if let Some(installed) = table.get_mut(&name) {
                installed.retain(|(installed_id, _)| *installed_id != id);
                if installed.is_empty() {
                    table.remove(&name);
                }
            }
        })
    }

    fn on_teardown(&self, hook: TeardownHook) {
        let mut slot = lock(&self.teardown);
        let previous = slot.take();
        *slot = Some(Box::new(move || {
            hook();
            if let Some(previous) = previous {
                previous();
            }
        }));
    }
}

type ObserverTable = HashMap<String, Vec<(u64, Observer)>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set `value` at the dot-separated `path`, replacing anything in the way
/// that is not an object.
fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let Some((head, rest)) = path.split_once('.') else {
        map.insert(path.to_string(), value);
        return;
    };
    let child = map.entry(head).or_insert(Value::Null);
    if let Value::Object(inner) = child {
        set_path(inner, rest, value);
    } else {
        let mut inner = Map::new();
        set_path(&mut inner, rest, value);
        *child = Value::Object(inner);
    }
}
