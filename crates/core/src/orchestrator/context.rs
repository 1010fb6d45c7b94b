//! Shared in-memory state of the orchestrator.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use quotevault_market_data::{ProviderId, RateLimitConfig, RateLimiter, Symbol};
use tokio::time::Instant;

use super::lease::LeaseTable;
use crate::config::OrchestratorConfig;
use crate::datasets::FetchGate;
use crate::errors::{Error, Result};

/// Everything the orchestrator shares between concurrent refreshes.
///
/// Built once per cache and passed down explicitly; tests build a fresh one
/// per run.
pub struct RefreshContext {
    leases: LeaseTable,
    limiter: Arc<RateLimiter>,
    provider: ProviderId,
    limiter_wait: Duration,
    symbols: DashMap<String, Symbol>,
}

impl RefreshContext {
    /// Context for one provider with the configured request ceiling.
    pub fn new(provider: &'static str, config: &OrchestratorConfig) -> Self {
        let provider: ProviderId = Cow::Borrowed(provider);
        let limiter = Arc::new(RateLimiter::new());
        limiter.configure(
            &provider,
            RateLimitConfig {
                requests_per_interval: config.requests_per_interval,
                interval: config.interval(),
                burst_capacity: config.burst,
            },
        );
        Self {
            leases: LeaseTable::new(),
            limiter,
            provider,
            limiter_wait: config.limiter_wait_timeout(),
            symbols: DashMap::new(),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Gate that takes one limiter token per upstream request.
    pub fn gate(&self) -> LimiterGate<'_> {
        LimiterGate {
            limiter: &self.limiter,
            provider: &self.provider,
            wait: self.limiter_wait,
        }
    }

    /// Remember a resolved symbol. The first resolution of a ticker wins.
    pub fn remember(&self, symbol: Symbol) -> Symbol {
        self.symbols
            .entry(symbol.ticker.clone())
            .or_insert(symbol)
            .clone()
    }

    pub fn resolved(&self, ticker: &str) -> Option<Symbol> {
        self.symbols.get(ticker).map(|s| s.clone())
    }

    pub fn forget(&self, ticker: &str) {
        self.symbols.remove(ticker);
    }
}

/// [`FetchGate`] backed by the shared rate limiter.
pub struct LimiterGate<'a> {
    limiter: &'a RateLimiter,
    provider: &'a ProviderId,
    wait: Duration,
}

#[async_trait]
impl FetchGate for LimiterGate<'_> {
    async fn admit(&self) -> Result<()> {
        let deadline = Instant::now() + self.wait;
        self.limiter
            .acquire_until(self.provider, deadline)
            .await
            .map_err(|_| {
                debug!("No {} token within {:?}", self.provider, self.wait);
                Error::Timeout(format!(
                    "no request slot for {} within {:?}",
                    self.provider, self.wait
                ))
            })
    }
}
