//! Fetch Error Type
//!
//! The store never fails on its own; the only error it knows about is the one
//! a fetcher produced, which records carry around so every consumer of a key
//! can observe the last terminal failure.

use derive_more::Display;
use std::error::Error as StdError;
use std::sync::Arc;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Opaque failure produced by a caller-supplied fetcher.
///
/// Cheap to clone: every record snapshot and every caller waiting on the same
/// in-flight fetch shares the same underlying error.
#[derive(Clone, Debug, Display)]
#[display("{_0}")]
pub struct FetchError(Arc<dyn StdError + Send + Sync + 'static>);

impl FetchError {
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self(Arc::from(err.into()))
    }

    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }

    /// The error the fetcher originally produced.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl PartialEq for FetchError {
    /// Two errors are equal when they are the same shared failure.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
