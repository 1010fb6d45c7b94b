//! Caller-facing cache facade.
//!
//! [`QuoteCache`] wires the store, freshness engine, dataset managers and
//! orchestrator together. Every read goes through the same path:
//!
//! 1. resolve the ticker to a `{ticker, exchange}` symbol
//! 2. refresh through the orchestrator (a no-op when the entry is fresh)
//! 3. serve the stored entry, narrowed to the request
//!
//! When step 2 fails and something is cached, the cached data is served
//! flagged stale. Only a cold miss surfaces the error.

#[cfg(test)]
mod service_tests;

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use log::{debug, info, warn};
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::{
    Dividend, FetchProvider, FinancialStatement, Interval, OptionChain, PriceBar,
    ReportingPeriod, Split, StatementKind, Symbol,
};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::datasets::{
    Adjustment, BarDiscrepancy, DatasetContext, Datasets, FetchGate, Fetched, VerifyTolerance,
};
use crate::errors::{Error, Result};
use crate::freshness::FreshnessEngine;
use crate::migrations::SchemaUpgrader;
use crate::model::{CacheEntry, CacheKey, DatasetKind, DateRange, SubKey};
use crate::orchestrator::{BatchOrchestrator, BatchReport, RefreshContext, RefreshOutcome};
use crate::store::{EntryStore, KvSubstrate, StoreManifest};

/// Options for [`QuoteCache::get_prices_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PriceQuery {
    /// Sessions to serve. Intraday defaults to today, daily to the
    /// configured lookback.
    pub range: Option<DateRange>,
    /// Refetch when the entry was refreshed longer ago than this, even if
    /// the calendar rules call it fresh.
    pub max_age: Option<Duration>,
    /// Back-adjust for splits and dividends cached for the symbol.
    pub adjustment: Adjustment,
}

impl PriceQuery {
    pub fn range(range: DateRange) -> Self {
        Self {
            range: Some(range),
            ..Self::default()
        }
    }
}

/// A local cache of provider data with calendar-aware freshness.
pub struct QuoteCache {
    config: CacheConfig,
    store: EntryStore,
    provider: Arc<dyn FetchProvider>,
    datasets: Arc<Datasets>,
    orchestrator: BatchOrchestrator,
    clock: Arc<dyn Clock>,
}

impl QuoteCache {
    /// Open the cache on `substrate`, migrating it to the current schema.
    pub async fn open(
        substrate: Arc<dyn KvSubstrate>,
        provider: Arc<dyn FetchProvider>,
        calendar: Arc<Calendar>,
        config: CacheConfig,
    ) -> Result<Self> {
        Self::open_with_clock(substrate, provider, calendar, config, Arc::new(SystemClock)).await
    }

    /// Like [`open`](Self::open) with an injected clock.
    pub async fn open_with_clock(
        substrate: Arc<dyn KvSubstrate>,
        provider: Arc<dyn FetchProvider>,
        calendar: Arc<Calendar>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let manifest = SchemaUpgrader::new(substrate.clone(), clock.clone())
            .open_and_migrate()
            .await?;
        info!(
            "Opened cache for provider {} at schema version {}",
            provider.id(),
            manifest.schema_version
        );

        let store = EntryStore::new(substrate);
        let engine = Arc::new(FreshnessEngine::new(calendar, config.freshness.clone()));
        let datasets = Arc::new(Datasets::new(Arc::new(DatasetContext {
            store: store.clone(),
            engine,
            provider: provider.clone(),
            clock: clock.clone(),
        })));
        let limits = config.orchestrator.within(&provider.rate_limit());
        debug!(
            "Provider {} limits: {} requests per {:?}, burst {}, {} workers",
            provider.id(),
            limits.requests_per_interval,
            limits.interval(),
            limits.burst,
            limits.max_concurrency
        );
        let context = Arc::new(RefreshContext::new(provider.id(), &limits));
        let orchestrator = BatchOrchestrator::new(datasets.clone(), context, limits);

        Ok(Self {
            config,
            store,
            provider,
            datasets,
            orchestrator,
            clock,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn manifest(&self) -> Result<Option<StoreManifest>> {
        self.store.read_manifest().await
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// Tell the cache which exchange a ticker trades on.
    ///
    /// The first registration or resolution of a ticker is final.
    pub fn register_symbol(&self, symbol: Symbol) -> Result<Symbol> {
        self.datasets
            .context()
            .calendar()
            .timezone(&symbol.exchange)?;
        Ok(self.orchestrator.context().remember(symbol))
    }

    /// The symbol for `ticker`, asking the provider on first use.
    pub async fn resolve(&self, ticker: &str) -> Result<Symbol> {
        let context = self.orchestrator.context();
        if let Some(symbol) = context.resolved(ticker) {
            return Ok(symbol);
        }
        context.gate().admit().await?;
        let symbol = self.provider.resolve_symbol(ticker).await?;
        self.datasets
            .context()
            .calendar()
            .timezone(&symbol.exchange)?;
        info!("Resolved {} to {}", ticker, symbol);
        Ok(context.remember(symbol))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Bars for `ticker`, as the provider returned them. Intraday intervals
    /// default to today's session, daily bars to the configured lookback.
    pub async fn get_prices(
        &self,
        ticker: &str,
        interval: Interval,
        range: Option<DateRange>,
    ) -> Result<Fetched<Vec<PriceBar>>> {
        let query = PriceQuery {
            range,
            ..PriceQuery::default()
        };
        self.get_prices_with(ticker, interval, query).await
    }

    /// Bars for `ticker` with a per-call age bound and optional
    /// split/dividend adjustment.
    ///
    /// Adjustment reads the cached splits and dividends from the start of
    /// the range to today, refreshing them as needed. A newly cached event
    /// re-adjusts every earlier bar on the next read.
    pub async fn get_prices_with(
        &self,
        ticker: &str,
        interval: Interval,
        query: PriceQuery,
    ) -> Result<Fetched<Vec<PriceBar>>> {
        let kind = price_kind(interval)?;
        let symbol = self.resolve(ticker).await?;
        let range = match query.range {
            Some(range) => range,
            None if interval.is_intraday() => DateRange::single(self.today(&symbol)?),
            None => self.default_range(&symbol)?,
        };

        let fetched = self
            .fetch_within(&symbol, kind, SubKey::range(range), query.max_age)
            .await?;
        let Fetched {
            data,
            stale,
            error,
            last_refresh,
        } = fetched;
        let Some(entry) = data else {
            return Ok(Fetched {
                data: Vec::new(),
                stale,
                error,
                last_refresh,
            });
        };
        let adjustment = query.adjustment;
        if adjustment == Adjustment::none() {
            return Ok(Fetched {
                data: self.datasets.prices().view(&entry, range)?,
                stale,
                error,
                last_refresh,
            });
        }

        let actions_range = DateRange {
            start: range.start,
            end: range.end.max(self.today(&symbol)?),
        };
        let splits = if adjustment.splits {
            self.get_splits(ticker, Some(actions_range)).await?
        } else {
            Fetched {
                data: Vec::new(),
                stale: false,
                error: None,
                last_refresh: None,
            }
        };
        let dividends = self.get_dividends(ticker, Some(actions_range)).await?;
        let bars = self.datasets.prices().adjusted_view(
            &entry,
            range,
            &splits.data,
            &dividends.data,
            adjustment,
        )?;
        Ok(Fetched {
            data: bars,
            stale: stale || splits.stale || dividends.stale,
            error: error.or(splits.error).or(dividends.error),
            last_refresh,
        })
    }

    pub async fn get_dividends(
        &self,
        ticker: &str,
        range: Option<DateRange>,
    ) -> Result<Fetched<Vec<Dividend>>> {
        let symbol = self.resolve(ticker).await?;
        let range = self.range_or_default(&symbol, range)?;
        let fetched = self
            .fetch(&symbol, DatasetKind::Dividend, SubKey::range(range))
            .await?;
        let manager = self.datasets.corporate_actions();
        Ok(fetched.map(|entry| {
            entry.map_or_else(Vec::new, |e| manager.dividends_in(&e, range))
        }))
    }

    pub async fn get_splits(
        &self,
        ticker: &str,
        range: Option<DateRange>,
    ) -> Result<Fetched<Vec<Split>>> {
        let symbol = self.resolve(ticker).await?;
        let range = self.range_or_default(&symbol, range)?;
        let fetched = self
            .fetch(&symbol, DatasetKind::Split, SubKey::range(range))
            .await?;
        let manager = self.datasets.corporate_actions();
        Ok(fetched.map(|entry| entry.map_or_else(Vec::new, |e| manager.splits_in(&e, range))))
    }

    /// Statements of one kind and period. `cadence_days` overrides the
    /// filing cadence estimated from the cached history.
    pub async fn get_financials(
        &self,
        ticker: &str,
        statement: StatementKind,
        period: ReportingPeriod,
        cadence_days: Option<u32>,
    ) -> Result<Fetched<Vec<FinancialStatement>>> {
        let symbol = self.resolve(ticker).await?;
        let fetched = self
            .fetch(
                &symbol,
                DatasetKind::FinancialStatement { statement, period },
                SubKey::Filing { cadence_days },
            )
            .await?;
        let manager = self.datasets.financials();
        Ok(fetched.map(|entry| {
            entry.map_or_else(Vec::new, |e| manager.statements_in(&e, None))
        }))
    }

    /// The chain for one expiry. An expired chain is served flagged stale
    /// and never refetched.
    pub async fn get_option_chain(
        &self,
        ticker: &str,
        expiry: NaiveDate,
    ) -> Result<Fetched<OptionChain>> {
        let symbol = self.resolve(ticker).await?;
        let fetched = self
            .fetch(
                &symbol,
                DatasetKind::OptionChain { expiry },
                SubKey::Expiry { expiry },
            )
            .await?;
        let chain = fetched
            .data
            .as_ref()
            .and_then(|entry| self.datasets.options().chain(entry))
            .ok_or_else(|| {
                Error::NotFound(format!("no option chain for {} expiring {}", symbol, expiry))
            })?;
        Ok(fetched.map(|_| chain))
    }

    // =========================================================================
    // Batch and housekeeping
    // =========================================================================

    /// Refresh `kind` for many tickers at once. Tickers that cannot be
    /// resolved are reported failed; the rest still run.
    pub async fn refresh_all(
        &self,
        tickers: &[&str],
        kind: &DatasetKind,
        sub_key: &SubKey,
    ) -> BatchReport {
        let mut symbols = Vec::with_capacity(tickers.len());
        let mut unresolved = Vec::new();
        for ticker in tickers {
            match self.resolve(ticker).await {
                Ok(symbol) => symbols.push(symbol),
                Err(err) => {
                    warn!("Cannot refresh {}: {}", ticker, err);
                    unresolved.push((ticker.to_string(), Err(err)));
                }
            }
        }
        let mut report = self
            .orchestrator
            .refresh_all(&symbols, kind, sub_key)
            .await;
        report.results.extend(unresolved);
        report
    }

    /// Delete the cached `kind` for `ticker`, or every entry of the ticker.
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, ticker: &str, kind: Option<&DatasetKind>) -> Result<usize> {
        let keys = match kind {
            Some(kind) => vec![CacheKey::new(ticker, kind.clone())],
            None => self.store.keys_for_symbol(ticker).await?,
        };
        let mut removed = 0;
        for key in &keys {
            if self.store.delete(key).await? {
                removed += 1;
            }
        }
        info!("Invalidated {} entries of {}", removed, ticker);
        Ok(removed)
    }

    /// Trading-day holes in the cached bars of `ticker` over `range`.
    pub async fn price_gaps(
        &self,
        ticker: &str,
        interval: Interval,
        range: DateRange,
    ) -> Result<Vec<DateRange>> {
        let kind = price_kind(interval)?;
        let symbol = self.resolve(ticker).await?;
        self.datasets
            .prices()
            .missing_ranges(&symbol, &kind, range)
            .await
    }

    /// Compare the cached bars of `ticker` with what the provider returns
    /// now. With `repair`, mismatching bars are replaced by upstream's.
    pub async fn verify_prices(
        &self,
        ticker: &str,
        interval: Interval,
        tolerance: VerifyTolerance,
        repair: bool,
    ) -> Result<Vec<BarDiscrepancy>> {
        let kind = price_kind(interval)?;
        let symbol = self.resolve(ticker).await?;
        let gate = self.orchestrator.context().gate();
        self.datasets
            .prices()
            .verify(&symbol, &kind, tolerance, repair, &gate)
            .await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn fetch(
        &self,
        symbol: &Symbol,
        kind: DatasetKind,
        sub_key: SubKey,
    ) -> Result<Fetched<Option<CacheEntry>>> {
        self.fetch_within(symbol, kind, sub_key, None).await
    }

    /// Refresh through the orchestrator, then read the entry back.
    async fn fetch_within(
        &self,
        symbol: &Symbol,
        kind: DatasetKind,
        sub_key: SubKey,
        max_age: Option<Duration>,
    ) -> Result<Fetched<Option<CacheEntry>>> {
        let refreshed = self
            .orchestrator
            .refresh_within(symbol, &kind, &sub_key, max_age)
            .await;
        let key = CacheKey::new(symbol.ticker.clone(), kind);
        let entry = self.store.get(&key).await?;
        let last_refresh = entry.as_ref().map(|e| e.last_refresh);

        match refreshed {
            Ok(outcome) => Ok(Fetched {
                data: entry,
                stale: outcome == RefreshOutcome::Expired,
                error: None,
                last_refresh,
            }),
            Err(err) => match entry {
                Some(entry) if degrades(&err) => {
                    warn!("Serving stale {} after refresh failed: {}", key, err);
                    Ok(Fetched {
                        data: Some(entry),
                        stale: true,
                        error: Some(err),
                        last_refresh,
                    })
                }
                _ => Err(err),
            },
        }
    }

    fn today(&self, symbol: &Symbol) -> Result<NaiveDate> {
        Ok(self
            .datasets
            .context()
            .calendar()
            .local_date(&symbol.exchange, self.clock.now())?)
    }

    fn default_range(&self, symbol: &Symbol) -> Result<DateRange> {
        let end = self.today(symbol)?;
        let start = end - Duration::days(i64::from(self.config.history.default_lookback_days));
        DateRange::new(start, end)
    }

    fn range_or_default(&self, symbol: &Symbol, range: Option<DateRange>) -> Result<DateRange> {
        match range {
            Some(range) => Ok(range),
            None => self.default_range(symbol),
        }
    }
}

/// Dataset holding bars of `interval`. Only daily and intraday bars are
/// cached.
fn price_kind(interval: Interval) -> Result<DatasetKind> {
    if interval.is_intraday() {
        Ok(DatasetKind::IntradayPrice { interval })
    } else if interval == Interval::Day1 {
        Ok(DatasetKind::DailyPrice)
    } else {
        Err(Error::InvalidRequest(format!(
            "{} bars are not cached; use 1d or an intraday interval",
            interval
        )))
    }
}

/// Failures that cached data can paper over.
fn degrades(err: &Error) -> bool {
    !matches!(err, Error::Store(_) | Error::InvalidRequest(_))
}

