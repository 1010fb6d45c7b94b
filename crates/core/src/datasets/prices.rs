//! Intraday and daily price series.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use quotevault_market_data::{BarValidator, Dividend, Interval, PriceBar, Split, Symbol};
use rust_decimal::Decimal;

use super::adjust::{adjust_bars, Adjustment};
use super::{
    commit_merge, missing_ranges, upstream_failure, usable, DatasetContext, FetchGate,
    RefreshReport,
};
use crate::errors::{Error, Result};
use crate::freshness::Verdict;
use crate::model::{CacheEntry, CacheKey, DatasetKind, DateRange, Payload, Provenance, SubKey};
use crate::store::Lookup;

/// Daily extensions per refresh: one trailing and one leading gap.
const MAX_DAILY_ROUNDS: usize = 2;

/// Keeps one bar per timestamp; `incoming` wins over `existing`.
pub fn merge_bars(existing: &[PriceBar], incoming: &[PriceBar]) -> Vec<PriceBar> {
    let mut by_time: BTreeMap<DateTime<Utc>, PriceBar> = existing
        .iter()
        .map(|bar| (bar.timestamp, bar.clone()))
        .collect();
    for bar in incoming {
        by_time.insert(bar.timestamp, bar.clone());
    }
    by_time.into_values().collect()
}

/// Fetch window for a stale intraday entry: the request, stretched so it
/// overlaps or touches the coverage.
fn intraday_window(requested: DateRange, coverage: Option<DateRange>) -> DateRange {
    match coverage {
        None => requested,
        Some(cov) if requested.end < cov.start => requested.hull(&DateRange::single(cov.start)),
        Some(cov) => {
            let start = if requested.start < cov.start {
                requested.start
            } else {
                requested.start.min(cov.end)
            };
            DateRange {
                start,
                end: requested.end.max(cov.end),
            }
        }
    }
}

pub struct PricesManager {
    ctx: Arc<DatasetContext>,
    validator: BarValidator,
}

impl PricesManager {
    pub fn new(ctx: Arc<DatasetContext>) -> Self {
        Self {
            ctx,
            validator: BarValidator::new(),
        }
    }

    pub(super) async fn refresh(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        let requested = sub_key.requested_range().ok_or_else(|| {
            Error::InvalidRequest(format!("{} needs a date range", kind))
        })?;
        match kind {
            DatasetKind::IntradayPrice { interval } => {
                if !self.ctx.provider.capabilities().supports_intraday {
                    return Err(Error::NotSupported(format!(
                        "{}: intraday prices",
                        self.ctx.provider_id()
                    )));
                }
                self.refresh_intraday(symbol, kind, *interval, requested, max_age, gate)
                    .await
            }
            DatasetKind::DailyPrice => {
                self.refresh_daily(symbol, kind, requested, max_age, gate)
                    .await
            }
            other => Err(Error::InvalidRequest(format!(
                "{} is not a price dataset",
                other
            ))),
        }
    }

    async fn refresh_intraday(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        interval: Interval,
        requested: DateRange,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let sub_key = SubKey::range(requested);
        let now = self.ctx.now();
        let lookup = self.ctx.store.read(&key).await?;
        if self
            .ctx
            .engine
            .evaluate_within(kind, &sub_key, lookup.entry(), now, max_age)
            .is_fresh()
        {
            return Ok(RefreshReport::UpToDate);
        }

        let today = self.ctx.calendar().local_date(&symbol.exchange, now)?;
        let requested = DateRange {
            start: requested.start.min(today),
            end: requested.end.min(today),
        };
        let coverage = usable(lookup.entry(), kind).and_then(|e| e.coverage);
        let window = intraday_window(requested, coverage);

        let bars = self.fetch(symbol, &key, window, interval, gate).await?;
        self.commit(symbol, kind, &key, lookup, sub_key, Some(window), bars, now)
            .await?;
        Ok(RefreshReport::Updated { fetches: 1 })
    }

    async fn refresh_daily(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        requested: DateRange,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let sub_key = SubKey::range(requested);
        let mut fetches = 0;
        let mut held_back = None;

        for _ in 0..MAX_DAILY_ROUNDS {
            let now = self.ctx.now();
            let lookup = self.ctx.store.read(&key).await?;
            let window = match self
                .ctx
                .engine
                .evaluate_within(kind, &sub_key, lookup.entry(), now, max_age)
            {
                Verdict::Fresh => break,
                Verdict::PartialExtensionNeeded(range) => range,
                Verdict::Stale => {
                    let last_complete = self
                        .ctx
                        .engine
                        .last_published_day(&symbol.exchange, now)?;
                    if requested.start > last_complete {
                        debug!(
                            "No completed session in {} for {} yet",
                            requested, key
                        );
                        break;
                    }
                    DateRange {
                        start: requested.start,
                        end: requested.end.min(last_complete),
                    }
                }
            };
            if held_back.is_some_and(|day| window.contains_date(day)) {
                break;
            }

            let bars = self
                .fetch(symbol, &key, window, Interval::Day1, gate)
                .await?;
            fetches += 1;
            let confirmed = self.confirmed_daily(symbol, window, &bars, now)?;
            if confirmed.map_or(true, |c| c.end < window.end) {
                held_back = Some(window.end);
            }
            self.commit(symbol, kind, &key, lookup, sub_key.clone(), confirmed, bars, now)
                .await?;
        }

        if fetches == 0 {
            Ok(RefreshReport::UpToDate)
        } else {
            Ok(RefreshReport::Updated { fetches })
        }
    }

    /// The part of a daily `window` upstream has vouched for.
    ///
    /// Days before the latest published session are final whether or not
    /// they carry a bar. The latest one only counts once a bar for it came
    /// back; until then it stays outside the coverage and is asked for again.
    fn confirmed_daily(
        &self,
        symbol: &Symbol,
        window: DateRange,
        bars: &[PriceBar],
        now: DateTime<Utc>,
    ) -> Result<Option<DateRange>> {
        let calendar = self.ctx.calendar();
        let latest = self.ctx.engine.last_published_day(&symbol.exchange, now)?;
        if window.end < latest {
            return Ok(Some(window));
        }
        let tz = calendar.timezone(&symbol.exchange)?;
        if bars.iter().any(|bar| bar.session_date(tz) == window.end) {
            return Ok(Some(window));
        }
        let end = calendar.previous_trading_day(&symbol.exchange, window.end)?;
        debug!(
            "No {} bar for {} yet; coverage stops at {}",
            window.end, symbol, end
        );
        Ok(DateRange::new(window.start, end).ok())
    }

    /// Fetch bars whose session dates fall in `window`, dropping invalid ones.
    async fn fetch(
        &self,
        symbol: &Symbol,
        key: &CacheKey,
        window: DateRange,
        interval: Interval,
        gate: &dyn FetchGate,
    ) -> Result<Vec<PriceBar>> {
        let calendar = self.ctx.calendar();
        let start = calendar.start_of_day(&symbol.exchange, window.start)?;
        let end = calendar.start_of_day(&symbol.exchange, window.end + Duration::days(1))?;

        gate.admit().await?;
        debug!("Fetching {} bars for {} over {}", interval, key, window);
        let bars = self
            .ctx
            .provider
            .fetch_prices(symbol, start, end, interval)
            .await
            .map_err(|e| upstream_failure(key, e))?;

        let (valid, invalid) = self.validator.validate_batch(bars);
        for (bar, err) in &invalid {
            warn!("Dropping bar {} for {}: {}", bar.timestamp, key, err);
        }
        Ok(merge_bars(&[], &valid))
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        key: &CacheKey,
        lookup: Lookup,
        sub_key: SubKey,
        window: Option<DateRange>,
        bars: Vec<PriceBar>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let provider = self.ctx.provider_id();
        let entry = commit_merge(&self.ctx.store, key, lookup, |current| {
            match usable(current, kind) {
                Some(current) => {
                    let Payload::Prices(existing) = &current.payload else {
                        return fresh_entry(symbol, kind, &sub_key, window, &bars, provider, now);
                    };
                    let mut provenance = current.provenance.clone();
                    provenance.fetches += 1;
                    CacheEntry {
                        sub_key: sub_key.clone(),
                        payload: Payload::Prices(merge_bars(existing, &bars)),
                        last_refresh: now,
                        coverage: match (current.coverage, window) {
                            (Some(cov), Some(window)) => Some(cov.hull(&window)),
                            (cov, window) => cov.or(window),
                        },
                        provenance,
                        ..current.clone()
                    }
                }
                None => fresh_entry(symbol, kind, &sub_key, window, &bars, provider, now),
            }
        })
        .await?;
        info!(
            "Stored {} bars for {} covering {}",
            entry.payload.len(),
            key,
            entry.coverage.map_or_else(String::new, |c| c.to_string())
        );
        Ok(())
    }

    /// Bars of `entry` whose local session date lies in `range`.
    pub fn view(&self, entry: &CacheEntry, range: DateRange) -> Result<Vec<PriceBar>> {
        let tz = self.ctx.calendar().timezone(&entry.symbol.exchange)?;
        let Payload::Prices(bars) = &entry.payload else {
            return Ok(Vec::new());
        };
        Ok(bars
            .iter()
            .filter(|bar| range.contains_date(bar.session_date(tz)))
            .cloned()
            .collect())
    }

    /// Like [`view`](Self::view), back-adjusted for the given corporate
    /// actions. Factors are computed over every cached bar, so closes
    /// before `range` still anchor dividends inside it.
    pub fn adjusted_view(
        &self,
        entry: &CacheEntry,
        range: DateRange,
        splits: &[Split],
        dividends: &[Dividend],
        adjustment: Adjustment,
    ) -> Result<Vec<PriceBar>> {
        let tz = self.ctx.calendar().timezone(&entry.symbol.exchange)?;
        let Payload::Prices(bars) = &entry.payload else {
            return Ok(Vec::new());
        };
        Ok(adjust_bars(bars, splits, dividends, tz, adjustment)
            .into_iter()
            .filter(|bar| range.contains_date(bar.session_date(tz)))
            .collect())
    }

    /// Compare the cached bars of `(symbol, kind)` with a fresh upstream
    /// fetch over the entry's coverage.
    ///
    /// With `repair`, a mismatching entry has its bars replaced by the
    /// upstream ones and its `replaced_at` stamped.
    pub async fn verify(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        tolerance: VerifyTolerance,
        repair: bool,
        gate: &dyn FetchGate,
    ) -> Result<Vec<BarDiscrepancy>> {
        let interval = match kind {
            DatasetKind::IntradayPrice { interval } => *interval,
            DatasetKind::DailyPrice => Interval::Day1,
            other => {
                return Err(Error::InvalidRequest(format!(
                    "{} is not a price dataset",
                    other
                )))
            }
        };
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let lookup = self.ctx.store.read(&key).await?;
        let Some((cached, window)) = usable(lookup.entry(), kind).and_then(|e| match &e.payload {
            Payload::Prices(bars) => e.coverage.map(|cov| (bars.clone(), cov)),
            _ => None,
        }) else {
            debug!("Nothing cached to verify for {}", key);
            return Ok(Vec::new());
        };

        let upstream = self.fetch(symbol, &key, window, interval, gate).await?;
        let discrepancies = compare_bars(&cached, &upstream, tolerance);
        if discrepancies.is_empty() {
            info!("Cached bars for {} match upstream over {}", key, window);
            return Ok(discrepancies);
        }
        warn!(
            "{} cached bars for {} disagree with upstream over {}",
            discrepancies.len(),
            key,
            window
        );

        if repair {
            let now = self.ctx.now();
            let provider = self.ctx.provider_id();
            commit_merge(&self.ctx.store, &key, lookup, |current| {
                let current = usable(current, kind).cloned().unwrap_or_else(|| {
                    let sub_key = SubKey::range(window);
                    fresh_entry(symbol, kind, &sub_key, Some(window), &[], provider, now)
                });
                let mut provenance = current.provenance.clone();
                provenance.replaced_at = Some(now);
                CacheEntry {
                    payload: Payload::Prices(upstream.clone()),
                    provenance,
                    ..current
                }
            })
            .await?;
            info!("Replaced cached bars for {} with upstream", key);
        }
        Ok(discrepancies)
    }

    /// Trading days in `range` with no stored bar, grouped into ranges.
    pub async fn missing_ranges(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        range: DateRange,
    ) -> Result<Vec<DateRange>> {
        let calendar = self.ctx.calendar();
        let tz = calendar.timezone(&symbol.exchange)?;
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let known: BTreeSet<_> = match self.ctx.store.get(&key).await? {
            Some(CacheEntry {
                payload: Payload::Prices(bars),
                ..
            }) => bars.iter().map(|bar| bar.session_date(tz)).collect(),
            _ => BTreeSet::new(),
        };
        let threshold = self.ctx.engine.policy().missing_range_merge_threshold;
        Ok(missing_ranges(calendar, &symbol.exchange, &known, range, threshold)?)
    }
}

/// Relative tolerances used by [`PricesManager::verify`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VerifyTolerance {
    pub price: Decimal,
    pub volume: Decimal,
}

impl Default for VerifyTolerance {
    fn default() -> Self {
        Self {
            price: Decimal::new(1, 4),
            volume: Decimal::new(5, 3),
        }
    }
}

/// One disagreement between the cache and upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BarDiscrepancy {
    /// Cached bar that upstream no longer returns.
    MissingUpstream { timestamp: DateTime<Utc> },
    /// Upstream bar the cache does not have.
    MissingLocally { timestamp: DateTime<Utc> },
    /// Both have the bar but price or volume differ beyond tolerance.
    Differs {
        timestamp: DateTime<Utc>,
        cached: PriceBar,
        upstream: PriceBar,
    },
}

fn within(cached: Decimal, upstream: Decimal, rtol: Decimal) -> bool {
    let diff = (cached - upstream).abs();
    if upstream.is_zero() {
        return diff.is_zero();
    }
    diff / upstream.abs() <= rtol
}

fn compare_bars(
    cached: &[PriceBar],
    upstream: &[PriceBar],
    tolerance: VerifyTolerance,
) -> Vec<BarDiscrepancy> {
    let theirs: BTreeMap<_, _> = upstream.iter().map(|bar| (bar.timestamp, bar)).collect();
    let ours: BTreeMap<_, _> = cached.iter().map(|bar| (bar.timestamp, bar)).collect();
    let mut found = Vec::new();
    for (timestamp, bar) in &ours {
        match theirs.get(timestamp) {
            None => found.push(BarDiscrepancy::MissingUpstream {
                timestamp: *timestamp,
            }),
            Some(other) => {
                let prices_match = [
                    (bar.open, other.open),
                    (bar.high, other.high),
                    (bar.low, other.low),
                    (bar.close, other.close),
                ]
                .into_iter()
                .all(|(a, b)| within(a, b, tolerance.price));
                if !prices_match || !within(bar.volume, other.volume, tolerance.volume) {
                    found.push(BarDiscrepancy::Differs {
                        timestamp: *timestamp,
                        cached: (*bar).clone(),
                        upstream: (*other).clone(),
                    });
                }
            }
        }
    }
    for timestamp in theirs.keys().filter(|t| !ours.contains_key(*t)) {
        found.push(BarDiscrepancy::MissingLocally {
            timestamp: *timestamp,
        });
    }
    found.sort_by_key(|d| match d {
        BarDiscrepancy::MissingUpstream { timestamp }
        | BarDiscrepancy::MissingLocally { timestamp }
        | BarDiscrepancy::Differs { timestamp, .. } => *timestamp,
    });
    found
}

fn fresh_entry(
    symbol: &Symbol,
    kind: &DatasetKind,
    sub_key: &SubKey,
    window: Option<DateRange>,
    bars: &[PriceBar],
    provider: &str,
    now: DateTime<Utc>,
) -> CacheEntry {
    CacheEntry {
        symbol: symbol.clone(),
        kind: kind.clone(),
        sub_key: sub_key.clone(),
        payload: Payload::Prices(bars.to_vec()),
        schema_version: crate::store::CURRENT_SCHEMA_VERSION,
        last_refresh: now,
        coverage: window,
        provenance: Provenance::new(provider),
        expires_at: None,
    }
}
