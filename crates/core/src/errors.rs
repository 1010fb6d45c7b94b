//! Core error types for the QuoteVault cache.
//!
//! This module defines substrate-agnostic error types. Storage-specific errors
//! (from Diesel, SQLite, etc.) are converted to these types by the substrate
//! implementation, and upstream errors arrive as [`MarketDataError`] and are
//! mapped here.

use std::time::Duration;

use quotevault_market_data::{MarketDataError, RetryClass};
use thiserror::Error;

/// Type alias for Result using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Root error type for the cache.
///
/// Errors are `Clone` so that the outcome of one coalesced refresh can be
/// handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The provider could not be reached or answered with garbage.
    /// Callers get last-known-good data, flagged stale, when any exists.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The provider answered with data that failed validation. Asking again
    /// returns the same answer, so this is never retried.
    #[error("Invalid upstream data: {0}")]
    InvalidUpstreamData(String),

    /// The provider rate limited us and the retry budget ran out.
    #[error("Rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider cannot serve this dataset at all.
    #[error("Not supported by provider: {0}")]
    NotSupported(String),

    /// Two writers raced on one entry and the local re-merge lost again.
    #[error("Concurrent update failed for {0}")]
    ConcurrentUpdateFailed(String),

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Schema migration from version {from_version} failed: {reason}")]
    MigrationFailed { from_version: u32, reason: String },

    #[error("Store schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    /// A wait on a refresh lease or on the rate limiter passed its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to load configuration: {0}")]
    ConfigIO(String),

    #[error("Invalid configuration value: {0}")]
    InvalidConfigValue(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised by the persistent store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The substrate is unavailable. Surfaced to the caller, never retried.
    #[error("I/O failure: {0}")]
    Io(String),

    /// A record failed its integrity check.
    #[error("Corrupt entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },
}

impl Error {
    /// Whether another attempt after a backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable(_) | Error::RateLimited { .. }
        )
    }

    /// Delay the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Transient upstream failures become retryable errors; everything the
/// provider classifies as terminal maps to a variant that is never retried.
impl From<MarketDataError> for Error {
    fn from(err: MarketDataError) -> Self {
        if err.retry_class() == RetryClass::WithBackoff {
            return match err {
                MarketDataError::RateLimited { retry_after, .. } => {
                    Error::RateLimited { retry_after }
                }
                MarketDataError::Timeout { provider } => {
                    Error::UpstreamUnavailable(format!("{} timed out", provider))
                }
                MarketDataError::Transport { provider, message } => {
                    Error::UpstreamUnavailable(format!("{}: {}", provider, message))
                }
                other => Error::UpstreamUnavailable(other.to_string()),
            };
        }
        match err {
            MarketDataError::SymbolNotFound(symbol) => Error::NotFound(symbol),
            MarketDataError::NoDataForRange(detail) => Error::NotFound(detail),
            MarketDataError::UnknownExchange(code) => Error::UnknownExchange(code),
            MarketDataError::NotSupported(what) => Error::NotSupported(what),
            other => Error::InvalidUpstreamData(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
