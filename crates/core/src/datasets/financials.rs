//! Financial statement series.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info};
use quotevault_market_data::{FinancialStatement, Symbol};

use super::{commit_merge, upstream_failure, usable, DatasetContext, FetchGate, RefreshReport};
use crate::errors::{Error, Result};
use crate::model::{CacheEntry, CacheKey, DatasetKind, DateRange, Payload, Provenance, SubKey};
use crate::store::CURRENT_SCHEMA_VERSION;

/// Union by period end, sorted; `incoming` wins on the same period.
fn merge_statements(
    existing: &[FinancialStatement],
    incoming: &[FinancialStatement],
) -> Vec<FinancialStatement> {
    let mut by_period: BTreeMap<NaiveDate, FinancialStatement> = existing
        .iter()
        .map(|s| (s.period_end, s.clone()))
        .collect();
    for statement in incoming {
        by_period.insert(statement.period_end, statement.clone());
    }
    by_period.into_values().collect()
}

/// Whether `incoming` reports a cached period with different line items.
fn is_restatement(existing: &[FinancialStatement], incoming: &[FinancialStatement]) -> bool {
    incoming.iter().any(|new| {
        existing
            .iter()
            .any(|old| old.period_end == new.period_end && old.items != new.items)
    })
}

/// First to last period end, if any.
fn span(statements: &[FinancialStatement]) -> Option<DateRange> {
    match (statements.first(), statements.last()) {
        (Some(first), Some(last)) => Some(DateRange {
            start: first.period_end,
            end: last.period_end,
        }),
        _ => None,
    }
}

pub struct FinancialsManager {
    ctx: Arc<DatasetContext>,
}

impl FinancialsManager {
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
        let DatasetKind::FinancialStatement { statement, period } = kind else {
            return Err(Error::InvalidRequest(format!(
                "{} is not a financial statement dataset",
                kind
            )));
        };
        if !self.ctx.provider.capabilities().supports_financials {
            return Err(Error::NotSupported(format!(
                "{}: financial statements",
                self.ctx.provider_id()
            )));
        }

        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let now = self.ctx.now();
        let lookup = self.ctx.store.read(&key).await?;
        if self
            .ctx
            .engine
            .evaluate_within(kind, sub_key, lookup.entry(), now, max_age)
            .is_fresh()
        {
            return Ok(RefreshReport::UpToDate);
        }

        gate.admit().await?;
        debug!("Fetching {} {} statements for {}", period, statement, key);
        let fetched = self
            .ctx
            .provider
            .fetch_financials(symbol, *statement, *period)
            .await
            .map_err(|e| upstream_failure(&key, e))?;
        let fetched = merge_statements(&[], &fetched);

        let provider = self.ctx.provider_id();
        let entry = commit_merge(&self.ctx.store, &key, lookup, |current| {
            merge_into(current, symbol, kind, sub_key, &fetched, provider, now)
        })
        .await?;
        info!(
            "Stored {} statements for {}",
            entry.payload.len(),
            key
        );
        Ok(RefreshReport::Updated { fetches: 1 })
    }

    /// Statements of `entry`, optionally limited to period ends in `range`.
    pub fn statements_in(
        &self,
        entry: &CacheEntry,
        range: Option<DateRange>,
    ) -> Vec<FinancialStatement> {
        let Payload::Financials(statements) = &entry.payload else {
            return Vec::new();
        };
        statements
            .iter()
            .filter(|s| range.map_or(true, |r| r.contains_date(s.period_end)))
            .cloned()
            .collect()
    }
}

fn merge_into(
    current: Option<&CacheEntry>,
    symbol: &Symbol,
    kind: &DatasetKind,
    sub_key: &SubKey,
    fetched: &[FinancialStatement],
    provider: &str,
    now: DateTime<Utc>,
) -> CacheEntry {
    let existing = usable(current, kind).and_then(|c| match &c.payload {
        Payload::Financials(statements) => Some((c, statements)),
        _ => None,
    });
    let Some((current, statements)) = existing else {
        return CacheEntry {
            symbol: symbol.clone(),
            kind: kind.clone(),
            sub_key: sub_key.clone(),
            payload: Payload::Financials(fetched.to_vec()),
            schema_version: CURRENT_SCHEMA_VERSION,
            last_refresh: now,
            coverage: span(fetched),
            provenance: Provenance::new(provider),
            expires_at: None,
        };
    };

    let mut provenance = current.provenance.clone();
    provenance.fetches += 1;
    let merged = if is_restatement(statements, fetched) {
        info!("Upstream restated statements for {}", current.key());
        provenance.replaced_at = Some(now);
        fetched.to_vec()
    } else {
        merge_statements(statements, fetched)
    };

    CacheEntry {
        sub_key: sub_key.clone(),
        coverage: span(&merged),
        payload: Payload::Financials(merged),
        last_refresh: now,
        provenance,
        ..current.clone()
    }
}
