//! Keyed fetch-state store for stale-while-revalidate caching.
//!
//! This crate holds the shared state of the cache: one [`CacheRecord`] per
//! [`CacheKey`], tracking the last fetched value, in-flight and error state,
//! and enough timing information to decide when a value has gone stale.
//!
//! The store itself never fetches anything. Writers (the revalidation engine
//! in the `swr` crate) merge [`RecordPatch`]es into it; readers get copies of
//! records, never references into the table.
//!
//! # Example
//!
//! ```
//! use swr_store::{CacheStore, RecordPatch};
//!
//! let store: CacheStore<String> = CacheStore::new();
//! let key = store.generate_key("home", "user");
//!
//! // Unknown keys are created lazily and are always expired.
//! assert!(store.get_state(&key).initialized);
//! assert!(store.is_expired(&key, None));
//!
//! store.set_state(&key, RecordPatch::new().data("alice".to_string()));
//! assert!(!store.is_expired(&key, None));
//! ```

mod error;
mod key;
mod record;
mod store;

pub use crate::error::FetchError;
pub use crate::key::CacheKey;
pub use crate::record::{CacheRecord, RecordPatch};
pub use crate::store::CacheStore;
