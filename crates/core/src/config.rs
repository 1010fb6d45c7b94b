//! Cache configuration.
//!
//! Loaded from JSON (camelCase keys). Every field has a default, so an empty
//! object `{}` is a valid configuration.
//!
//! ```json
//! {
//!   "freshness": { "providerLagSecs": 15, "corporateActionGraceDays": 1 },
//!   "orchestrator": { "requestsPerInterval": 2, "intervalMs": 1000 },
//!   "history": { "defaultLookbackDays": 365 }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use quotevault_market_data::{Interval, RateLimit, RateLimitConfig};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Top-level cache configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub freshness: FreshnessPolicy,
    pub orchestrator: OrchestratorConfig,
    pub history: HistoryConfig,
}

impl CacheConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfigValue(format!("Malformed cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigIO(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject values that would stall or disable the cache.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_concurrency == 0 {
            return Err(invalid("orchestrator.maxConcurrency must be at least 1"));
        }
        if o.requests_per_interval == 0 || o.interval_ms == 0 {
            return Err(invalid("orchestrator rate must be positive"));
        }
        if o.burst == 0 {
            return Err(invalid("orchestrator.burst must be at least 1"));
        }
        if o.retry_budget == 0 {
            return Err(invalid("orchestrator.retryBudget must allow one attempt"));
        }
        if o.base_backoff_ms > o.max_backoff_ms {
            return Err(invalid("orchestrator.baseBackoffMs exceeds maxBackoffMs"));
        }
        if self.freshness.option_chain_interval.is_some_and(|i| !i.is_intraday()) {
            return Err(invalid("freshness.optionChainInterval must be intraday"));
        }
        if self.freshness.overdue_recheck_days == 0 {
            return Err(invalid("freshness.overdueRecheckDays must be at least 1"));
        }
        if self.history.default_lookback_days == 0 {
            return Err(invalid("history.defaultLookbackDays must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfigValue(message.to_string())
}

/// Knobs of the per-dataset freshness rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FreshnessPolicy {
    /// Seconds after a bar closes before the provider reports it.
    pub provider_lag_secs: u64,
    /// Intraday entries older than this are stale during regular hours.
    pub intraday_max_age_secs: Option<u64>,
    /// Days after an ex-date before the provider is trusted to reflect it.
    pub corporate_action_grace_days: u32,
    /// Per-exchange grace windows, keyed by exchange code.
    pub corporate_action_grace_overrides: HashMap<String, u32>,
    /// Dividend and split entries older than this are always stale.
    pub corporate_action_max_age_days: Option<u32>,
    /// Days between a period end and the filing that reports it.
    pub filing_lag_days: u32,
    /// How often an overdue filing is looked for again.
    pub overdue_recheck_days: u32,
    /// Bar interval whose closes mark an option chain stale. `None` uses 15m.
    pub option_chain_interval: Option<Interval>,
    /// Missing-day gaps at most this many trading days apart are reported as one.
    pub missing_range_merge_threshold: usize,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            provider_lag_secs: 15,
            intraday_max_age_secs: None,
            corporate_action_grace_days: 1,
            corporate_action_grace_overrides: HashMap::new(),
            corporate_action_max_age_days: None,
            filing_lag_days: 45,
            overdue_recheck_days: 7,
            option_chain_interval: None,
            missing_range_merge_threshold: 5,
        }
    }
}

impl FreshnessPolicy {
    pub fn provider_lag(&self) -> Duration {
        Duration::seconds(self.provider_lag_secs as i64)
    }

    pub fn intraday_max_age(&self) -> Option<Duration> {
        self.intraday_max_age_secs.map(|s| Duration::seconds(s as i64))
    }

    /// Grace window for an exchange, falling back to the global default.
    pub fn grace_for(&self, exchange: &str) -> Duration {
        let days = self
            .corporate_action_grace_overrides
            .get(exchange)
            .copied()
            .unwrap_or(self.corporate_action_grace_days);
        Duration::days(days as i64)
    }

    pub fn corporate_action_max_age(&self) -> Option<Duration> {
        self.corporate_action_max_age_days
            .map(|d| Duration::days(d as i64))
    }

    pub fn filing_lag(&self) -> Duration {
        Duration::days(self.filing_lag_days as i64)
    }

    pub fn overdue_recheck(&self) -> Duration {
        Duration::days(self.overdue_recheck_days as i64)
    }

    pub fn option_chain_interval(&self) -> Interval {
        self.option_chain_interval.unwrap_or(Interval::Min15)
    }
}

/// Batch refresh limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Upstream fetches allowed to run at once.
    pub max_concurrency: usize,
    /// Requests admitted per `interval_ms`.
    pub requests_per_interval: u32,
    pub interval_ms: u64,
    /// Requests that may go out back to back.
    pub burst: u32,
    /// Attempts per symbol before it is reported failed.
    pub retry_budget: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Longest a caller waits on another caller's in-flight refresh.
    pub lease_wait_timeout_ms: u64,
    /// Longest a fetch waits for a rate limiter token.
    pub limiter_wait_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            requests_per_interval: 2,
            interval_ms: 1000,
            burst: 1,
            retry_budget: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            lease_wait_timeout_ms: 30_000,
            limiter_wait_timeout_ms: 60_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_millis(self.interval_ms)
    }

    pub fn lease_wait_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.lease_wait_timeout_ms)
    }

    pub fn limiter_wait_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.limiter_wait_timeout_ms)
    }

    /// These limits, tightened to what the provider advertises. The slower
    /// of the two request rates wins, as do the smaller burst and worker
    /// bound.
    pub fn within(&self, advertised: &RateLimit) -> OrchestratorConfig {
        let ours = RateLimitConfig {
            requests_per_interval: self.requests_per_interval,
            interval: self.interval(),
            burst_capacity: self.burst,
        };
        let theirs = RateLimitConfig::from(advertised);
        let mut tightened = self.clone();
        if theirs.per_second() < ours.per_second() {
            tightened.requests_per_interval = theirs.requests_per_interval;
            tightened.interval_ms = u64::try_from(theirs.interval.as_millis()).unwrap_or(u64::MAX);
        }
        tightened.burst = self.burst.min(theirs.burst_capacity.max(1));
        tightened.max_concurrency = self.max_concurrency.min(advertised.max_concurrency.max(1));
        tightened
    }

    /// Exponential backoff before attempt `attempt + 1`, capped at the max.
    pub fn backoff(&self, attempt: u32) -> StdDuration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        StdDuration::from_millis(ms)
    }
}

/// Defaults for time-series requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    /// Days of history served when a caller gives no range.
    pub default_lookback_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_lookback_days: 365,
        }
    }
}
