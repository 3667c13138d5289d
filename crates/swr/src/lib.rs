//! Stale-while-revalidate bindings.
//!
//! A [`Binding`] ties one cache key to one [`Host`](host::Host): it serves
//! whatever the shared [`CacheStore`] currently holds for the key and
//! revalidates it in the background, projecting the outcome into the host's
//! view as `{data, isLoading, isValidating, error}`.
//!
//! # Architecture
//! - **Store** (`swr-store`): keyed fetch state with TTL expiry and a
//!   self-stopping background sweep.
//! - **Engine** ([`RevalidationEngine`]): runs fetches with retry, optimistic
//!   writes and per-key deduplication of in-flight fetches.
//! - **Watcher** ([`DependencyWatcher`]): observes host values a binding
//!   depends on and revalidates, debounced, when they change.
//! - **Binding** ([`Binding`]): the per-consumer front, wiring the above to a
//!   host and clearing the host's namespace on teardown.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use swr::host::{Host, MemoryHost};
//! use swr::{fetcher, Binding, CacheStore, RevalidationEngine, SwrOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = RevalidationEngine::new(CacheStore::new());
//! let host = Arc::new(MemoryHost::new("home"));
//! let options = SwrOptions::default().with_fire_immediately(false);
//! let user = Binding::new(engine, host.clone(), "user", fetcher(|| async { Ok("alice") }), options);
//!
//! user.revalidate().await.unwrap();
//! assert_eq!(host.read("user").unwrap()["data"], "alice");
//! # }
//! ```

pub mod binding;
pub mod error;
pub mod host;
pub mod revalidate;
pub mod watch;

pub use crate::binding::{BatchItem, Binding, SwrOptions};
pub use crate::revalidate::{AttemptOptions, Fetcher, RevalidationEngine, fetcher};
pub use crate::watch::{Debouncer, DependencyWatcher};
pub use swr_store::{CacheKey, CacheRecord, CacheStore, FetchError, RecordPatch};
