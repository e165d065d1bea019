//! Error classification for the Store client (spec.md §4.1).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity drops, read timeouts. The caller (or
    /// [`crate::retry::retry`]) should retry with capped exponential
    /// backoff; this should rarely escape `RedisStore` itself.
    #[error("transient connectivity failure: {0}")]
    Transient(String),
    /// Observed behavior, not an error: the caller asked for a key that
    /// isn't there.
    #[error("no such key: {0}")]
    NoSuchKey(String),
    /// Unexpected substrate error codes or schema violations. Never
    /// retried blindly.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
