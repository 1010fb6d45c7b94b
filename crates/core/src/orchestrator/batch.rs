//! Bounded, rate-limited, coalesced batch refresh.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use log::{debug, info, warn};
use quotevault_market_data::Symbol;
use tokio::sync::Semaphore;

use super::context::RefreshContext;
use super::lease::Lease;
use super::RefreshOutcome;
use crate::config::OrchestratorConfig;
use crate::datasets::{Datasets, RefreshReport};
use crate::errors::{Error, Result};
use crate::model::{CacheKey, DatasetKind, SubKey};

/// Per-symbol results of one batch, keyed by ticker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub results: BTreeMap<String, Result<RefreshOutcome>>,
}

impl BatchReport {
    pub fn get(&self, ticker: &str) -> Option<&Result<RefreshOutcome>> {
        self.results.get(ticker)
    }

    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    /// Tickers whose refresh failed, with the error.
    pub fn failures(&self) -> impl Iterator<Item = (&String, &Error)> {
        self.results
            .iter()
            .filter_map(|(ticker, r)| r.as_ref().err().map(|e| (ticker, e)))
    }

    fn count(&self, wanted: fn(&RefreshOutcome) -> bool) -> usize {
        self.results
            .values()
            .filter(|r| r.as_ref().is_ok_and(wanted))
            .count()
    }
}

/// Runs refreshes under the worker bound, the rate ceiling and the
/// one-fetch-per-key rule.
pub struct BatchOrchestrator {
    datasets: Arc<Datasets>,
    context: Arc<RefreshContext>,
    config: OrchestratorConfig,
    workers: Semaphore,
}

impl BatchOrchestrator {
    pub fn new(
        datasets: Arc<Datasets>,
        context: Arc<RefreshContext>,
        config: OrchestratorConfig,
    ) -> Self {
        let workers = Semaphore::new(config.max_concurrency.max(1));
        Self {
            datasets,
            context,
            config,
            workers,
        }
    }

    pub fn context(&self) -> &Arc<RefreshContext> {
        &self.context
    }

    pub fn datasets(&self) -> &Arc<Datasets> {
        &self.datasets
    }

    /// Refresh `kind` for every symbol; each symbol gets its own result.
    pub async fn refresh_all(
        &self,
        symbols: &[Symbol],
        kind: &DatasetKind,
        sub_key: &SubKey,
    ) -> BatchReport {
        info!("Refreshing {} for {} symbols", kind, symbols.len());
        let runs = symbols.iter().map(|symbol| async move {
            let result = self.refresh_one(symbol, kind, sub_key).await;
            (symbol.ticker.clone(), result)
        });
        let report = BatchReport {
            results: join_all(runs).await.into_iter().collect(),
        };

        info!(
            "Batch {} done: {} fresh, {} refreshed, {} coalesced, {} expired, {} failed",
            kind,
            report.count(|o| matches!(o, RefreshOutcome::AlreadyFresh)),
            report.count(|o| matches!(o, RefreshOutcome::Refreshed { .. })),
            report.count(|o| matches!(o, RefreshOutcome::Coalesced)),
            report.count(|o| matches!(o, RefreshOutcome::Expired)),
            report.results.len() - report.succeeded()
        );
        report
    }

    /// Refresh one `(symbol, kind)`, coalescing with any refresh in flight.
    pub async fn refresh_one(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
    ) -> Result<RefreshOutcome> {
        self.refresh_within(symbol, kind, sub_key, None).await
    }

    /// Like [`refresh_one`](Self::refresh_one), also refreshing an entry
    /// older than `max_age` that the calendar rules would still serve.
    pub async fn refresh_within(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
    ) -> Result<RefreshOutcome> {
        let fresh = self
            .datasets
            .evaluate(symbol, kind, sub_key, max_age)
            .await?
            .is_fresh();
        if fresh {
            debug!("{} {} already fresh", symbol, kind);
            return Ok(RefreshOutcome::AlreadyFresh);
        }

        // The lease covers the whole (symbol, kind) entry, but the leader may
        // have refreshed a different sub-key. A follower only returns once
        // its own sub-key is fresh, else it contends for the lease again.
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        loop {
            match self.context.leases().acquire(&key) {
                Lease::Leader(guard) => {
                    let result = self.lead(symbol, kind, sub_key, max_age).await;
                    guard.complete(result.clone());
                    return result;
                }
                Lease::Follower(waiter) => {
                    let outcome = waiter.wait(self.config.lease_wait_timeout()).await?;
                    let verdict = self
                        .datasets
                        .evaluate(symbol, kind, sub_key, max_age)
                        .await?;
                    if verdict.is_fresh() {
                        return Ok(outcome);
                    }
                    debug!(
                        "{} {} still not fresh for {:?} after coalesced refresh",
                        symbol, kind, sub_key
                    );
                }
            }
        }
    }

    /// Run the refresh as lease holder, retrying transient failures.
    async fn lead(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
    ) -> Result<RefreshOutcome> {
        let gate = self.context.gate();
        let budget = self.config.retry_budget.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _permit = self.workers.acquire().await.map_err(|_| {
                    Error::UpstreamUnavailable("worker pool closed".to_string())
                })?;
                self.datasets
                    .refresh(symbol, kind, sub_key, max_age, &gate)
                    .await
            };

            match result {
                Ok(RefreshReport::UpToDate) if attempt == 1 => {
                    return Ok(RefreshOutcome::AlreadyFresh)
                }
                Ok(RefreshReport::UpToDate) | Ok(RefreshReport::Updated { .. }) => {
                    return Ok(RefreshOutcome::Refreshed { attempts: attempt })
                }
                Ok(RefreshReport::Expired) => return Ok(RefreshOutcome::Expired),
                Err(err) if err.is_retryable() && attempt < budget => {
                    let delay = self
                        .config
                        .backoff(attempt)
                        .max(err.retry_after().unwrap_or_default());
                    warn!(
                        "Attempt {}/{} for {} {} failed: {}; retrying in {:?}",
                        attempt, budget, symbol, kind, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(
                            "Giving up on {} {} after {} attempts: {}",
                            symbol, kind, attempt, err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
