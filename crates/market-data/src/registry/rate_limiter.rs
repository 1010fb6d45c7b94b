//! Token bucket rate limiter for upstream providers.
//!
//! Implements per-provider rate limiting using the token bucket algorithm.
//! Each provider gets its own bucket with a configurable refill rate
//! (requests per interval) and burst capacity.
//!
//! Time is measured with [`tokio::time::Instant`], so tests running on a
//! paused runtime clock observe exact waits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::errors::MarketDataError;
use crate::models::ProviderId;
use crate::provider::RateLimit;

/// Default rate limit: 60 requests per minute.
const DEFAULT_REQUESTS_PER_INTERVAL: u32 = 60;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default bucket capacity: no bursting beyond the steady rate.
const DEFAULT_BURST_CAPACITY: u32 = 1;

/// Token bucket for a single provider.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Last time the bucket was updated.
    last_update: Instant,
    /// Token refill rate (tokens per second).
    rate: f64,
    /// Maximum bucket capacity.
    capacity: f64,
}

impl TokenBucket {
    fn with_config(config: &RateLimitConfig) -> Self {
        let capacity = config.burst_capacity.max(1) as f64;
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: config.per_second(),
            capacity,
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let new_tokens = elapsed * self.rate;

        self.tokens = (self.tokens + new_tokens).min(self.capacity);
        self.last_update = now;
    }

    /// Try to acquire a token immediately.
    /// Returns true if a token was available, false otherwise.
    fn try_acquire(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Calculate the wait time until a token becomes available.
    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let tokens_needed = 1.0 - self.tokens;
            let seconds_needed = tokens_needed / self.rate;
            Duration::from_secs_f64(seconds_needed)
        }
    }
}

/// Rate limiter configuration for a provider.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed per `interval`.
    pub requests_per_interval: u32,
    /// Length of the rate window.
    pub interval: Duration,
    /// Maximum burst capacity.
    pub burst_capacity: u32,
}

impl RateLimitConfig {
    /// Steady refill rate in tokens per second.
    pub fn per_second(&self) -> f64 {
        let secs = self.interval.as_secs_f64();
        if secs <= 0.0 {
            f64::MAX
        } else {
            self.requests_per_interval.max(1) as f64 / secs
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: DEFAULT_REQUESTS_PER_INTERVAL,
            interval: DEFAULT_INTERVAL,
            burst_capacity: DEFAULT_BURST_CAPACITY,
        }
    }
}

impl From<&RateLimit> for RateLimitConfig {
    fn from(limit: &RateLimit) -> Self {
        Self {
            requests_per_interval: limit.requests_per_interval,
            interval: limit.interval,
            burst_capacity: limit.burst,
        }
    }
}

/// Token bucket rate limiter for multiple providers.
///
/// Thread-safe rate limiter that maintains per-provider token buckets.
/// Buckets are created on-demand with default settings, or can be
/// pre-configured with custom limits.
pub struct RateLimiter {
    /// Per-provider token buckets.
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Per-provider configuration overrides.
    configs: Mutex<HashMap<String, RateLimitConfig>>,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the buckets mutex, recovering from poison if necessary.
    ///
    /// For rate limiting, it's safe to recover from a poisoned mutex since
    /// the worst case is slightly incorrect rate limiting, which is better
    /// than panicking.
    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter buckets mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Lock the configs mutex, recovering from poison if necessary.
    fn lock_configs(&self) -> MutexGuard<'_, HashMap<String, RateLimitConfig>> {
        self.configs.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter configs mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Configure rate limits for a specific provider.
    pub fn configure(&self, provider: &ProviderId, config: RateLimitConfig) {
        let mut configs = self.lock_configs();
        configs.insert(provider.to_string(), config);
        drop(configs); // Release configs lock before acquiring buckets lock

        // Reset the bucket if it already exists
        let mut buckets = self.lock_buckets();
        buckets.remove(provider.as_ref());
    }

    /// Acquire a token for the given provider.
    ///
    /// This method will wait (asynchronously) until a token is available.
    /// If the provider doesn't have a bucket yet, one is created with
    /// default settings.
    pub async fn acquire(&self, provider: &ProviderId) {
        loop {
            let wait_time = match self.poll_token(provider) {
                None => return,
                Some(wait) => wait,
            };

            debug!(
                "Rate limiter: waiting {:?} for provider '{}'",
                wait_time, provider
            );
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Acquire a token, giving up once `deadline` would be passed.
    ///
    /// Returns [`MarketDataError::Timeout`] without consuming a token when the
    /// next token cannot arrive before the deadline.
    pub async fn acquire_until(
        &self,
        provider: &ProviderId,
        deadline: Instant,
    ) -> Result<(), MarketDataError> {
        loop {
            let wait_time = match self.poll_token(provider) {
                None => return Ok(()),
                Some(wait) => wait,
            };

            if Instant::now() + wait_time > deadline {
                debug!(
                    "Rate limiter: next token for '{}' in {:?} misses the deadline",
                    provider, wait_time
                );
                return Err(MarketDataError::Timeout {
                    provider: provider.to_string(),
                });
            }
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Takes a token if one is available, otherwise reports how long to wait.
    fn poll_token(&self, provider: &ProviderId) -> Option<Duration> {
        let mut buckets = self.lock_buckets();

        let bucket = buckets
            .entry(provider.to_string())
            .or_insert_with(|| self.create_bucket(provider));

        if bucket.try_acquire() {
            debug!("Rate limiter: acquired token for '{}'", provider);
            return None;
        }

        // Sleep at least a millisecond so a rounding remainder cannot spin
        Some(bucket.time_until_available().max(Duration::from_millis(1)))
    }

    /// Try to acquire a token without waiting.
    ///
    /// Returns true if a token was acquired, false if rate limited.
    pub fn try_acquire(&self, provider: &ProviderId) -> bool {
        let mut buckets = self.lock_buckets();

        let bucket = buckets
            .entry(provider.to_string())
            .or_insert_with(|| self.create_bucket(provider));

        bucket.try_acquire()
    }

    /// Get the remaining tokens for a provider.
    pub fn remaining_tokens(&self, provider: &ProviderId) -> f64 {
        let mut buckets = self.lock_buckets();

        if let Some(bucket) = buckets.get_mut(provider.as_ref()) {
            bucket.refill();
            bucket.tokens
        } else {
            self.config_for(provider).burst_capacity.max(1) as f64
        }
    }

    /// Reset the rate limiter for a provider.
    pub fn reset(&self, provider: &ProviderId) {
        let mut buckets = self.lock_buckets();
        buckets.remove(provider.as_ref());
    }

    fn config_for(&self, provider: &ProviderId) -> RateLimitConfig {
        self.lock_configs()
            .get(provider.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    /// Create a bucket for a provider, using custom config if available.
    fn create_bucket(&self, provider: &ProviderId) -> TokenBucket {
        TokenBucket::with_config(&self.config_for(provider))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
