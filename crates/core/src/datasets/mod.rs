//! Dataset managers.
//!
//! One manager per dataset family turns "make `(symbol, kind)` current for
//! this sub-key" into store reads, freshness checks, upstream fetches and
//! optimistic merges:
//!
//! ```text
//!   read entry ──► evaluate ──► Fresh ─────────────────────► done
//!                     │
//!                     ├─► Stale ──► fetch full scope ──┐
//!                     │                                ├─► merge + put(expected version)
//!                     └─► Partial(range) ──► fetch ────┘        │
//!                                                      Conflict ─► re-read, re-merge once
//! ```
//!
//! Managers never wait on leases or retry upstream failures; the batch
//! orchestrator does both around [`Datasets::refresh`].

mod adjust;
mod corporate_actions;
mod financials;
mod gaps;
mod options;
mod prices;

pub use adjust::{adjust_bars, Adjustment};
pub use corporate_actions::CorporateActionsManager;
pub use financials::FinancialsManager;
pub use gaps::missing_ranges;
pub use options::OptionsManager;
pub use prices::{merge_bars, BarDiscrepancy, PricesManager, VerifyTolerance};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::{FetchProvider, MarketDataError, Symbol};

use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::freshness::{FreshnessEngine, Verdict};
use crate::model::{CacheEntry, CacheKey, DatasetKind, SubKey};
use crate::store::{EntryStore, Lookup, PutOutcome};

// =============================================================================
// Shared plumbing
// =============================================================================

/// Admission control for upstream calls.
///
/// Managers call [`admit`](FetchGate::admit) before every provider request;
/// the orchestrator's gate waits on the rate limiter.
#[async_trait]
pub trait FetchGate: Send + Sync {
    async fn admit(&self) -> Result<()>;
}

/// Gate that admits every request immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenGate;

#[async_trait]
impl FetchGate for OpenGate {
    async fn admit(&self) -> Result<()> {
        Ok(())
    }
}

/// Collaborators shared by all managers.
pub struct DatasetContext {
    pub store: EntryStore,
    pub engine: Arc<FreshnessEngine>,
    pub provider: Arc<dyn FetchProvider>,
    pub clock: Arc<dyn Clock>,
}

impl DatasetContext {
    pub fn calendar(&self) -> &Calendar {
        self.engine.calendar()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn provider_id(&self) -> &'static str {
        self.provider.id()
    }
}

/// What one refresh did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshReport {
    /// The entry was already fresh; nothing was fetched.
    UpToDate,
    /// Upstream responses merged into the entry.
    Updated { fetches: u32 },
    /// The option chain expired; expired chains are never refetched.
    Expired,
}

/// Data handed to a caller, flagged stale when it could not be refreshed.
#[derive(Clone, Debug, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    /// True when the data may be behind what the provider would return now.
    pub stale: bool,
    /// Why a refresh failed, when stale data is served in its place.
    pub error: Option<Error>,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl<T> Fetched<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            data: f(self.data),
            stale: self.stale,
            error: self.error,
            last_refresh: self.last_refresh,
        }
    }
}

/// Put a merged entry, re-reading and re-merging once on a version conflict.
///
/// `merge` receives the current entry (or `None` when the key is missing or
/// corrupt) and returns the entry to store.
pub(crate) async fn commit_merge<F>(
    store: &EntryStore,
    key: &CacheKey,
    mut lookup: Lookup,
    merge: F,
) -> Result<CacheEntry>
where
    F: Fn(Option<&CacheEntry>) -> CacheEntry,
{
    for attempt in 0..2 {
        let entry = merge(lookup.entry());
        match store.put(key, &entry, lookup.expected()).await? {
            PutOutcome::Written { .. } => return Ok(entry),
            PutOutcome::Conflict => {
                debug!(
                    "Concurrent write to {} (attempt {}), re-reading to merge",
                    key,
                    attempt + 1
                );
                lookup = store.read(key).await?;
            }
        }
    }
    warn!("Giving up on {} after a second version conflict", key);
    Err(Error::ConcurrentUpdateFailed(key.to_string()))
}

/// The entry if its payload is valid for `kind`; merging into a malformed
/// entry would keep the damage.
pub(crate) fn usable<'a>(
    entry: Option<&'a CacheEntry>,
    kind: &DatasetKind,
) -> Option<&'a CacheEntry> {
    entry.filter(|e| e.kind == *kind && e.payload.validate(kind).is_ok())
}

/// Log and convert an upstream failure.
pub(crate) fn upstream_failure(key: &CacheKey, err: MarketDataError) -> Error {
    warn!("Upstream fetch for {} failed: {}", key, err);
    Error::from(err)
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes each dataset kind to its manager.
pub struct Datasets {
    ctx: Arc<DatasetContext>,
    prices: PricesManager,
    corporate_actions: CorporateActionsManager,
    financials: FinancialsManager,
    options: OptionsManager,
}

impl Datasets {
    pub fn new(ctx: Arc<DatasetContext>) -> Self {
        Self {
            prices: PricesManager::new(ctx.clone()),
            corporate_actions: CorporateActionsManager::new(ctx.clone()),
            financials: FinancialsManager::new(ctx.clone()),
            options: OptionsManager::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<DatasetContext> {
        &self.ctx
    }

    pub fn prices(&self) -> &PricesManager {
        &self.prices
    }

    pub fn corporate_actions(&self) -> &CorporateActionsManager {
        &self.corporate_actions
    }

    pub fn financials(&self) -> &FinancialsManager {
        &self.financials
    }

    pub fn options(&self) -> &OptionsManager {
        &self.options
    }

    /// Freshness of the stored entry for `(symbol, kind)` right now. With
    /// `max_age`, entries refreshed longer ago than that are stale too.
    pub async fn evaluate(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
    ) -> Result<Verdict> {
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let lookup = self.ctx.store.read(&key).await?;
        Ok(self.ctx.engine.evaluate_within(
            kind,
            sub_key,
            lookup.entry(),
            self.ctx.now(),
            max_age,
        ))
    }

    /// Bring `(symbol, kind)` up to date for `sub_key`.
    pub async fn refresh(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        match kind {
            DatasetKind::IntradayPrice { .. } | DatasetKind::DailyPrice => {
                self.prices.refresh(symbol, kind, sub_key, max_age, gate).await
            }
            DatasetKind::Dividend | DatasetKind::Split => {
                self.corporate_actions
                    .refresh(symbol, kind, sub_key, max_age, gate)
                    .await
            }
            DatasetKind::FinancialStatement { .. } => {
                self.financials
                    .refresh(symbol, kind, sub_key, max_age, gate)
                    .await
            }
            DatasetKind::OptionChain { .. } => {
                self.options
                    .refresh(symbol, kind, sub_key, max_age, gate)
                    .await
            }
        }
    }
}
