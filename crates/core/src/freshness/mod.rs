//! Freshness decisions.
//!
//! Staleness is not a fixed TTL: each dataset goes stale when the underlying
//! fact could have changed.
//!
//! | Dataset           | Stale when                                               |
//! |-------------------|----------------------------------------------------------|
//! | Intraday prices   | a bar closed (plus provider lag) since the last refresh  |
//! | Daily prices      | a completed trading day is missing from the coverage     |
//! | Dividends, splits | an ex-date (known or projected) passed, plus grace       |
//! | Financials        | the next filing is due, estimated from cadence           |
//! | Option chains     | like intraday until the expiry closes, then for good     |
//!
//! `evaluate` never fails: a missing, malformed or hard-expired entry is
//! Stale, and calendar errors are logged and answered with Stale.

mod events;
mod series;
mod sessions;

#[cfg(test)]
mod freshness_tests;

pub use events::median_gap_days;

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, warn};
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::errors::Result as CalendarResult;

use crate::config::FreshnessPolicy;
use crate::model::{CacheEntry, DatasetKind, DateRange, Payload, SubKey};

/// Outcome of a freshness check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Fresh,
    Stale,
    /// Only this range is missing; fetch it and merge.
    PartialExtensionNeeded(DateRange),
}

impl Verdict {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Verdict::Fresh)
    }
}

/// Pure freshness policy over an exchange calendar.
pub struct FreshnessEngine {
    calendar: Arc<Calendar>,
    policy: FreshnessPolicy,
}

impl FreshnessEngine {
    pub fn new(calendar: Arc<Calendar>, policy: FreshnessPolicy) -> Self {
        Self { calendar, policy }
    }

    pub fn calendar(&self) -> &Arc<Calendar> {
        &self.calendar
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// Decide whether `entry` can be served for `(kind, sub_key)` at `now`.
    ///
    /// # Arguments
    ///
    /// * `kind` - dataset kind the caller asked for
    /// * `sub_key` - requested range, filing cadence or expiry
    /// * `entry` - the cached entry, if any
    /// * `now` - the current instant
    ///
    /// # Returns
    ///
    /// The same verdict for the same inputs and calendar snapshot.
    pub fn evaluate(
        &self,
        kind: &DatasetKind,
        sub_key: &SubKey,
        entry: Option<&CacheEntry>,
        now: DateTime<Utc>,
    ) -> Verdict {
        self.evaluate_within(kind, sub_key, entry, now, None)
    }

    /// Like [`evaluate`](Self::evaluate), but an entry refreshed more than
    /// `max_age` ago is Stale even when the calendar rules call it fresh.
    pub fn evaluate_within(
        &self,
        kind: &DatasetKind,
        sub_key: &SubKey,
        entry: Option<&CacheEntry>,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
    ) -> Verdict {
        let verdict = self.evaluate_rules(kind, sub_key, entry, now);
        match (verdict, entry, max_age) {
            (Verdict::Fresh, Some(entry), Some(max_age)) if now - entry.last_refresh > max_age => {
                debug!(
                    "{} refreshed {} is older than the caller's {}s; stale",
                    entry.key(),
                    entry.last_refresh,
                    max_age.num_seconds()
                );
                Verdict::Stale
            }
            _ => verdict,
        }
    }

    fn evaluate_rules(
        &self,
        kind: &DatasetKind,
        sub_key: &SubKey,
        entry: Option<&CacheEntry>,
        now: DateTime<Utc>,
    ) -> Verdict {
        let Some(entry) = entry else {
            debug!("No cached {} entry; stale", kind);
            return Verdict::Stale;
        };
        if entry.kind != *kind {
            warn!(
                "Entry {} asked for as {}; treating as stale",
                entry.key(),
                kind
            );
            return Verdict::Stale;
        }
        if let Err(reason) = entry.payload.validate(kind) {
            warn!(
                "Malformed payload in {}: {}; treating as stale",
                entry.key(),
                reason
            );
            return Verdict::Stale;
        }
        if entry.expires_at.is_some_and(|at| now >= at) {
            debug!("{} passed its hard expiry; stale", entry.key());
            return Verdict::Stale;
        }

        let verdict = match self.decide(kind, sub_key, entry, now) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    "Freshness check for {} failed: {}; treating as stale",
                    entry.key(),
                    err
                );
                Verdict::Stale
            }
        };
        debug!(
            "{} refreshed {} is {:?} at {}",
            entry.key(),
            entry.last_refresh,
            verdict,
            now
        );
        verdict
    }

    fn decide(
        &self,
        kind: &DatasetKind,
        sub_key: &SubKey,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> CalendarResult<Verdict> {
        let exchange = entry.symbol.exchange.as_str();
        let calendar = self.calendar.as_ref();
        match kind {
            DatasetKind::IntradayPrice { interval } => {
                if let Some(gap) = series::intraday_gap(
                    calendar,
                    exchange,
                    sub_key.requested_range(),
                    entry.coverage,
                    now,
                )? {
                    return Ok(gap);
                }
                sessions::bar_rule(
                    calendar,
                    exchange,
                    *interval,
                    self.lag(exchange)?,
                    self.policy.intraday_max_age(),
                    entry.last_refresh,
                    now,
                )
            }
            DatasetKind::DailyPrice => series::daily_rule(
                calendar,
                exchange,
                sub_key.requested_range(),
                entry.coverage,
                self.policy.provider_lag(),
                now,
            ),
            DatasetKind::Dividend => {
                let Payload::Dividends(dividends) = &entry.payload else {
                    return Ok(Verdict::Stale);
                };
                events::corporate_action_rule(
                    calendar,
                    &self.policy,
                    exchange,
                    &dividends.iter().map(|d| d.ex_date).collect::<Vec<_>>(),
                    true,
                    sub_key.requested_range(),
                    entry,
                    now,
                )
            }
            DatasetKind::Split => {
                let Payload::Splits(splits) = &entry.payload else {
                    return Ok(Verdict::Stale);
                };
                events::corporate_action_rule(
                    calendar,
                    &self.policy,
                    exchange,
                    &splits.iter().map(|s| s.ex_date).collect::<Vec<_>>(),
                    false,
                    sub_key.requested_range(),
                    entry,
                    now,
                )
            }
            DatasetKind::FinancialStatement { period, .. } => {
                let Payload::Financials(statements) = &entry.payload else {
                    return Ok(Verdict::Stale);
                };
                let cadence = match sub_key {
                    SubKey::Filing { cadence_days } => *cadence_days,
                    _ => None,
                };
                events::filing_rule(
                    calendar,
                    &self.policy,
                    exchange,
                    *period,
                    cadence,
                    &statements.iter().map(|s| s.period_end).collect::<Vec<_>>(),
                    entry.last_refresh,
                    now,
                )
            }
            DatasetKind::OptionChain { expiry } => {
                if self.is_option_expired(exchange, *expiry, now)? {
                    return Ok(Verdict::Stale);
                }
                sessions::bar_rule(
                    calendar,
                    exchange,
                    self.policy.option_chain_interval(),
                    self.lag(exchange)?,
                    None,
                    entry.last_refresh,
                    now,
                )
            }
        }
    }

    /// Last session whose bar the provider has published at `now`: close
    /// plus exchange delay plus provider lag.
    pub fn last_published_day(
        &self,
        exchange: &str,
        now: DateTime<Utc>,
    ) -> CalendarResult<NaiveDate> {
        self.calendar
            .last_completed_trading_day(exchange, now - self.policy.provider_lag())
    }

    /// Provider lag plus the exchange's publication delay.
    fn lag(&self, exchange: &str) -> CalendarResult<Duration> {
        Ok(self.policy.provider_lag() + self.calendar.data_delay(exchange)?)
    }

    /// Regular close of the last trading day on or before `expiry`.
    pub fn option_expiry_close(
        &self,
        exchange: &str,
        expiry: NaiveDate,
    ) -> CalendarResult<DateTime<Utc>> {
        sessions::expiry_close(&self.calendar, exchange, expiry)
    }

    /// Whether the chain for `expiry` has stopped trading.
    pub fn is_option_expired(
        &self,
        exchange: &str,
        expiry: NaiveDate,
        now: DateTime<Utc>,
    ) -> CalendarResult<bool> {
        Ok(now >= self.option_expiry_close(exchange, expiry)?)
    }
}
