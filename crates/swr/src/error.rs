//! SWR Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! [`ErrorKind`] is [`Clone`] because one in-flight fetch may settle for
//! several waiting callers at once; each of them gets its own [`Error`] built
//! from the shared kind.

use derive_more::{Display, Error};
use std::error::Error as StdError;
use std::sync::Arc;
use swr_store::FetchError;

/// An SWR error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for SWR operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Clone, Debug, Display, Error)]
pub enum ErrorKind {
    /// The fetcher kept failing until the retry limit was exhausted. The same
    /// error is stored on the cache record.
    #[display("fetch failed: {_0}")]
    Fetch(FetchError),
    /// An `on_success` or `on_error` callback returned an error; the update
    /// it was part of has been abandoned.
    #[display("callback failed: {_0}")]
    Callback(CallbackError),
    /// The background task running the fetch panicked or was cancelled
    /// before the fetch settled.
    #[display("fetch task ended before settling")]
    Interrupted,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

/// Failure reported by a user-supplied `on_success`/`on_error` callback.
#[derive(Clone, Debug, Display)]
#[display("{_0}")]
pub struct CallbackError(Arc<dyn StdError + Send + Sync + 'static>);

impl CallbackError {
    pub fn new(err: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self(Arc::from(err.into()))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }
}

impl StdError for CallbackError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}
