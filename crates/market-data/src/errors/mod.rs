//! Error types and retry classification for the market data crate.
//!
//! This module provides:
//! - [`MarketDataError`]: The error enum for upstream fetches and calendar lookups
//! - [`RetryClass`]: Classification for determining retry behavior

mod retry;

pub use retry::RetryClass;

use std::time::Duration;

use thiserror::Error;

/// Type alias for Result using [`MarketDataError`].
pub type Result<T> = std::result::Result<T, MarketDataError>;

/// Errors that can occur while talking to the upstream provider or
/// resolving exchange sessions.
///
/// Each variant is classified into a [`RetryClass`] via the [`retry_class`](Self::retry_class)
/// method, which the batch orchestrator uses to decide whether a symbol is
/// requeued or reported as failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketDataError {
    /// The requested symbol was not found by the provider.
    /// This is a terminal error - retrying won't help.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// No data available for the requested range.
    /// The symbol exists but the provider has nothing for the period.
    #[error("No data for range: {0}")]
    NoDataForRange(String),

    /// The provider rate limited the request (HTTP 429).
    /// Should retry with exponential backoff, honouring `retry_after` when given.
    #[error("Rate limited: {provider}")]
    RateLimited {
        /// The provider that rate limited the request
        provider: String,
        /// Delay suggested by the provider before the next attempt
        retry_after: Option<Duration>,
    },

    /// The request to the provider, or a wait for a rate limiter token, timed out.
    #[error("Timeout: {provider}")]
    Timeout {
        /// The provider that timed out
        provider: String,
    },

    /// The transport failed (connection reset, 5xx, malformed body).
    #[error("Transport error: {provider} - {message}")]
    Transport {
        /// The provider that returned the error
        provider: String,
        /// The error message from the transport
        message: String,
    },

    /// The exchange code is not known to the calendar.
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    /// Data validation failed.
    /// The provider returned data that failed validation checks.
    #[error("Validation failed: {message}")]
    ValidationFailed {
        /// Description of the validation failure
        message: String,
    },

    /// The provider cannot serve this kind of dataset at all.
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl MarketDataError {
    /// Returns the retry classification for this error.
    ///
    /// - [`RetryClass::Never`]: Don't retry, the error is terminal
    /// - [`RetryClass::WithBackoff`]: Retry with exponential backoff
    ///
    /// # Examples
    ///
    /// ```
    /// use quotevault_market_data::errors::{MarketDataError, RetryClass};
    ///
    /// let error = MarketDataError::RateLimited { provider: "YAHOO".to_string(), retry_after: None };
    /// assert_eq!(error.retry_class(), RetryClass::WithBackoff);
    ///
    /// let error = MarketDataError::SymbolNotFound("INVALID".to_string());
    /// assert_eq!(error.retry_class(), RetryClass::Never);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::SymbolNotFound(_)
            | Self::NoDataForRange(_)
            | Self::UnknownExchange(_)
            | Self::ValidationFailed { .. }
            | Self::NotSupported(_) => RetryClass::Never,

            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Transport { .. } => {
                RetryClass::WithBackoff
            }
        }
    }

    /// The delay the provider asked for, if this is a rate-limit signal.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
