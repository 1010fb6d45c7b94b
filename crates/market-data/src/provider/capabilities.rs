//! Provider capabilities and rate limiting configuration.
//!
//! This module defines structures for describing which datasets an upstream
//! provider can serve and how hard it may be called.

use std::time::Duration;

/// Describes the datasets an upstream provider can serve.
///
/// The cache consults this before issuing a fetch so unsupported datasets
/// fail fast with `NotSupported` instead of burning rate-limit tokens.
#[derive(Clone, Debug)]
pub struct ProviderCapabilities {
    /// Whether bars shorter than a day are available.
    pub supports_intraday: bool,

    /// Whether dividends and splits are available.
    pub supports_corporate_actions: bool,

    /// Whether financial statements are available.
    pub supports_financials: bool,

    /// Whether option chains are available.
    pub supports_options: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_intraday: true,
            supports_corporate_actions: true,
            supports_financials: true,
            supports_options: true,
        }
    }
}

/// Rate limiting configuration for a provider.
///
/// Controls how aggressively we can call a provider to avoid
/// hitting their rate limits and getting blocked.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimit {
    /// Requests allowed per `interval`.
    pub requests_per_interval: u32,

    /// Length of the rate window.
    pub interval: Duration,

    /// Requests that may be issued back to back before throttling kicks in.
    pub burst: u32,

    /// Maximum concurrent requests to this provider.
    pub max_concurrency: usize,
}

impl RateLimit {
    /// Sustained request rate in requests per second.
    pub fn per_second(&self) -> f64 {
        let secs = self.interval.as_secs_f64();
        if secs <= 0.0 {
            f64::INFINITY
        } else {
            self.requests_per_interval as f64 / secs
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_interval: 60,
            interval: Duration::from_secs(60),
            burst: 1,
            max_concurrency: 4,
        }
    }
}
