//! Dividends and splits.
//!
//! Both come from one upstream call but are cached as separate entries, so
//! a dividend refresh never rewrites the split history and vice versa.
//! A response that changes or drops a cached event is a restatement: the
//! cached events are replaced rather than merged, and the replacement is
//! recorded in the entry's provenance.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use quotevault_market_data::{CorporateActions, Dividend, Split, Symbol};

use super::{commit_merge, upstream_failure, usable, DatasetContext, FetchGate, RefreshReport};
use crate::errors::{Error, Result};
use crate::freshness::Verdict;
use crate::model::{CacheEntry, CacheKey, DatasetKind, DateRange, Payload, Provenance, SubKey};
use crate::store::CURRENT_SCHEMA_VERSION;

/// An event keyed by its ex-date.
pub(crate) trait CorporateEvent: Clone + PartialEq + Send + Sync {
    fn ex_date(&self) -> NaiveDate;
    fn from_payload(payload: &Payload) -> Option<&[Self]>;
    fn into_payload(events: Vec<Self>) -> Payload;
    fn select(actions: CorporateActions) -> Vec<Self>;
}

impl CorporateEvent for Dividend {
    fn ex_date(&self) -> NaiveDate {
        self.ex_date
    }

    fn from_payload(payload: &Payload) -> Option<&[Self]> {
        match payload {
            Payload::Dividends(events) => Some(events),
            _ => None,
        }
    }

    fn into_payload(events: Vec<Self>) -> Payload {
        Payload::Dividends(events)
    }

    fn select(actions: CorporateActions) -> Vec<Self> {
        actions.dividends
    }
}

impl CorporateEvent for Split {
    fn ex_date(&self) -> NaiveDate {
        self.ex_date
    }

    fn from_payload(payload: &Payload) -> Option<&[Self]> {
        match payload {
            Payload::Splits(events) => Some(events),
            _ => None,
        }
    }

    fn into_payload(events: Vec<Self>) -> Payload {
        Payload::Splits(events)
    }

    fn select(actions: CorporateActions) -> Vec<Self> {
        let (valid, invalid): (Vec<_>, Vec<_>) = actions
            .splits
            .into_iter()
            .partition(|s| s.ratio().is_some());
        for split in &invalid {
            warn!("Dropping split on {} with zero denominator", split.ex_date);
        }
        valid
    }
}

/// Union by ex-date, sorted; `incoming` wins on the same date.
pub(crate) fn merge_events<T: CorporateEvent>(existing: &[T], incoming: &[T]) -> Vec<T> {
    let mut by_date: BTreeMap<NaiveDate, T> = existing
        .iter()
        .map(|e| (e.ex_date(), e.clone()))
        .collect();
    for event in incoming {
        by_date.insert(event.ex_date(), event.clone());
    }
    by_date.into_values().collect()
}

/// Whether `incoming`, covering `window`, changes or drops a cached event.
pub(crate) fn is_restatement<T: CorporateEvent>(
    existing: &[T],
    incoming: &[T],
    window: DateRange,
) -> bool {
    existing
        .iter()
        .filter(|e| window.contains_date(e.ex_date()))
        .any(|e| !incoming.contains(e))
}

pub struct CorporateActionsManager {
    ctx: Arc<DatasetContext>,
}

impl CorporateActionsManager {
    pub fn new(ctx: Arc<DatasetContext>) -> Self {
        Self { ctx }
    }

    pub(super) async fn refresh(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        if !self.ctx.provider.capabilities().supports_corporate_actions {
            return Err(Error::NotSupported(format!(
                "{}: corporate actions",
                self.ctx.provider_id()
            )));
        }
        match kind {
            DatasetKind::Dividend => {
                self.refresh_events::<Dividend>(symbol, kind, sub_key, max_age, gate)
                    .await
            }
            DatasetKind::Split => {
                self.refresh_events::<Split>(symbol, kind, sub_key, max_age, gate)
                    .await
            }
            other => Err(Error::InvalidRequest(format!(
                "{} is not a corporate action dataset",
                other
            ))),
        }
    }

    async fn refresh_events<T: CorporateEvent>(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        let requested = sub_key
            .requested_range()
            .ok_or_else(|| Error::InvalidRequest(format!("{} needs a date range", kind)))?;
        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let now = self.ctx.now();
        let lookup = self.ctx.store.read(&key).await?;

        let window = match self
            .ctx
            .engine
            .evaluate_within(kind, sub_key, lookup.entry(), now, max_age)
        {
            Verdict::Fresh => return Ok(RefreshReport::UpToDate),
            Verdict::PartialExtensionNeeded(range) => range,
            Verdict::Stale => {
                // Pending ex-dates are recent; always reach today.
                let today = self.ctx.calendar().local_date(&symbol.exchange, now)?;
                let base = match usable(lookup.entry(), kind).and_then(|e| e.coverage) {
                    Some(cov) => requested.hull(&cov),
                    None => requested,
                };
                DateRange {
                    start: base.start.min(today),
                    end: base.end.max(today),
                }
            }
        };

        gate.admit().await?;
        debug!("Fetching corporate actions for {} over {}", key, window);
        let actions = self
            .ctx
            .provider
            .fetch_corporate_actions(symbol, window.start, window.end)
            .await
            .map_err(|e| upstream_failure(&key, e))?;
        let fetched: Vec<T> = T::select(actions)
            .into_iter()
            .filter(|e| window.contains_date(e.ex_date()))
            .collect();
        let fetched = merge_events(&[], &fetched);

        let provider = self.ctx.provider_id();
        let entry = commit_merge(&self.ctx.store, &key, lookup, |current| {
            merge_into(current, symbol, kind, sub_key, window, &fetched, provider, now)
        })
        .await?;
        info!(
            "Stored {} events for {} covering {}",
            entry.payload.len(),
            key,
            entry.coverage.map_or_else(String::new, |c| c.to_string())
        );
        Ok(RefreshReport::Updated { fetches: 1 })
    }

    /// Dividends of `entry` with ex-dates in `range`.
    pub fn dividends_in(&self, entry: &CacheEntry, range: DateRange) -> Vec<Dividend> {
        events_in(entry, range)
    }

    /// Splits of `entry` with ex-dates in `range`.
    pub fn splits_in(&self, entry: &CacheEntry, range: DateRange) -> Vec<Split> {
        events_in(entry, range)
    }
}

fn events_in<T: CorporateEvent>(entry: &CacheEntry, range: DateRange) -> Vec<T> {
    T::from_payload(&entry.payload)
        .unwrap_or_default()
        .iter()
        .filter(|e| range.contains_date(e.ex_date()))
        .cloned()
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn merge_into<T: CorporateEvent>(
    current: Option<&CacheEntry>,
    symbol: &Symbol,
    kind: &DatasetKind,
    sub_key: &SubKey,
    window: DateRange,
    fetched: &[T],
    provider: &str,
    now: DateTime<Utc>,
) -> CacheEntry {
    let existing = usable(current, kind)
        .and_then(|c| T::from_payload(&c.payload).map(|events| (c, events)));
    let Some((current, events)) = existing else {
        return CacheEntry {
            symbol: symbol.clone(),
            kind: kind.clone(),
            sub_key: sub_key.clone(),
            payload: T::into_payload(fetched.to_vec()),
            schema_version: CURRENT_SCHEMA_VERSION,
            last_refresh: now,
            coverage: Some(window),
            provenance: Provenance::new(provider),
            expires_at: None,
        };
    };

    let mut provenance = current.provenance.clone();
    provenance.fetches += 1;
    let restated = is_restatement(events, fetched, window);
    let merged = if restated {
        info!(
            "Upstream restated corporate actions for {} in {}",
            current.key(),
            window
        );
        provenance.replaced_at = Some(now);
        let outside: Vec<T> = events
            .iter()
            .filter(|e| !window.contains_date(e.ex_date()))
            .cloned()
            .collect();
        merge_events(&outside, fetched)
    } else {
        merge_events(events, fetched)
    };

    let coverage = match current.coverage {
        Some(cov) if cov.touches(&window) => cov.hull(&window),
        _ => window,
    };
    CacheEntry {
        sub_key: sub_key.clone(),
        payload: T::into_payload(merged),
        last_refresh: now,
        coverage: Some(coverage),
        provenance,
        ..current.clone()
    }
}
