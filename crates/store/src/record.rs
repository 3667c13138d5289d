use crate::FetchError;
use tokio::time::Instant;

/// Fetch state tracked for one [`CacheKey`](crate::CacheKey).
#[derive(Clone, Debug)]
pub struct CacheRecord<T> {
    /// Last successfully fetched value, or an optimistic value written ahead
    /// of the fetch.
    pub data: Option<T>,
    /// An attempt for this key is in flight.
    pub is_loading: bool,
    /// An attempt is in flight while previously fetched data is still being
    /// served. Never set without `is_loading`.
    pub is_validating: bool,
    /// Last terminal fetch failure; cleared on success.
    pub error: Option<FetchError>,
    /// Time of the last write to this record.
    pub timestamp: Instant,
    /// Consecutive failed attempts since the last success.
    pub retry_count: u32,
    /// Auto-created and never written. Always treated as expired.
    pub initialized: bool,
}

impl<T> CacheRecord<T> {
    pub(crate) fn placeholder() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_validating: false,
            error: None,
            timestamp: Instant::now(),
            retry_count: 0,
            initialized: true,
        }
    }

    pub(crate) fn apply(&mut self, patch: RecordPatch<T>) {
        let RecordPatch { data, is_loading, is_validating, error, retry_count } = patch;
        if let Some(data) = data {
            self.data = data;
        }
        if let Some(is_loading) = is_loading {
            self.is_loading = is_loading;
        }
        if let Some(is_validating) = is_validating {
            self.is_validating = is_validating;
        }
        if let Some(error) = error {
            self.error = error;
        }
        if let Some(retry_count) = retry_count {
            self.retry_count = retry_count;
        }
        self.timestamp = Instant::now();
        self.initialized = false;
    }
}

/// Partial update merged over a [`CacheRecord`] by
/// [`CacheStore::set_state`](crate::CacheStore::set_state).
///
/// Fields left as `None` keep their current value. `data` and `error` are
/// doubly optional so that they can be explicitly cleared.
#[derive(Clone, Debug)]
pub struct RecordPatch<T> {
    pub data: Option<Option<T>>,
    pub is_loading: Option<bool>,
    pub is_validating: Option<bool>,
    pub error: Option<Option<FetchError>>,
    pub retry_count: Option<u32>,
}

impl<T> Default for RecordPatch<T> {
    fn default() -> Self {
        Self { data: None, is_loading: None, is_validating: None, error: None, retry_count: None }
    }
}

impl<T> RecordPatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: T) -> Self {
        self.data = Some(Some(data));
        self
    }

    pub fn clear_data(mut self) -> Self {
        self.data = Some(None);
        self
    }

    pub fn loading(mut self, is_loading: bool) -> Self {
        self.is_loading = Some(is_loading);
        self
    }

    pub fn validating(mut self, is_validating: bool) -> Self {
        self.is_validating = Some(is_validating);
        self
    }

    pub fn error(mut self, error: FetchError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}
