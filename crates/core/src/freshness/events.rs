//! Event-driven rules: corporate actions and financial filings.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::errors::Result;
use quotevault_market_data::ReportingPeriod;

use super::Verdict;
use crate::config::FreshnessPolicy;
use crate::model::{CacheEntry, DateRange};

/// Median gap in days between consecutive dates. Needs at least two dates.
pub fn median_gap_days(dates: &[NaiveDate]) -> Option<i64> {
    let mut gaps: Vec<i64> = dates
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days())
        .filter(|gap| *gap > 0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_unstable();
    let mid = gaps.len() / 2;
    Some(if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2
    } else {
        gaps[mid]
    })
}

/// Latest cadence-projected ex-date on or before `today`, if one is due.
fn projected_ex_date(ex_dates: &[NaiveDate], today: NaiveDate) -> Option<NaiveDate> {
    let gap = median_gap_days(ex_dates)?;
    let last = *ex_dates.iter().max()?;
    if last >= today {
        return None;
    }
    let periods = (today - last).num_days() / gap;
    (periods >= 1).then(|| last + Duration::days(periods * gap))
}

/// Fresh unless an ex-date has passed that the last refresh cannot reflect.
///
/// The pending ex-date is the latest known one on or before today, or for
/// cadence-projected series the latest projected one. The provider is
/// trusted to reflect an action once the exchange-local ex-date has started
/// and the grace window elapsed.
#[allow(clippy::too_many_arguments)]
pub(super) fn corporate_action_rule(
    calendar: &Calendar,
    policy: &FreshnessPolicy,
    exchange: &str,
    ex_dates: &[NaiveDate],
    project_cadence: bool,
    requested: Option<DateRange>,
    entry: &CacheEntry,
    now: DateTime<Utc>,
) -> Result<Verdict> {
    let today = calendar.local_date(exchange, now)?;

    let mut pending = ex_dates.iter().copied().filter(|d| *d <= today).max();
    if project_cadence {
        pending = pending.max(projected_ex_date(ex_dates, today));
    }
    if let Some(ex_date) = pending {
        let settled = calendar.start_of_day(exchange, ex_date)? + policy.grace_for(exchange);
        if entry.last_refresh < settled {
            return Ok(Verdict::Stale);
        }
    }

    if policy
        .corporate_action_max_age()
        .is_some_and(|age| now - entry.last_refresh >= age)
    {
        return Ok(Verdict::Stale);
    }

    // Events after the coverage end are governed by the pending-date logic
    // above; only history before the coverage can be missing.
    Ok(match (requested, entry.coverage) {
        (Some(req), Some(cov)) if req.start < cov.start => {
            Verdict::PartialExtensionNeeded(DateRange {
                start: req.start,
                end: cov.start - Duration::days(1),
            })
        }
        (Some(_), None) => Verdict::Stale,
        _ => Verdict::Fresh,
    })
}

/// Fresh until the next filing is due.
///
/// The due date is the last period end plus the filing cadence plus the
/// filing lag. Cadence comes from the caller, else the issuer's history,
/// else the nominal period length. An overdue filing is looked for at most
/// once per `overdue_recheck`.
#[allow(clippy::too_many_arguments)]
pub(super) fn filing_rule(
    calendar: &Calendar,
    policy: &FreshnessPolicy,
    exchange: &str,
    period: ReportingPeriod,
    cadence_hint: Option<u32>,
    period_ends: &[NaiveDate],
    last_refresh: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Verdict> {
    let recently_checked = now - last_refresh < policy.overdue_recheck();

    let Some(last_period) = period_ends.iter().max().copied() else {
        return Ok(if recently_checked {
            Verdict::Fresh
        } else {
            Verdict::Stale
        });
    };

    let cadence = cadence_hint
        .filter(|days| *days > 0)
        .map(i64::from)
        .or_else(|| median_gap_days(period_ends))
        .unwrap_or_else(|| period.nominal_cadence_days());
    let due_date = last_period + Duration::days(cadence) + policy.filing_lag();
    let due = calendar.start_of_day(exchange, due_date)?;

    if now < due || (last_refresh >= due && recently_checked) {
        Ok(Verdict::Fresh)
    } else {
        Ok(Verdict::Stale)
    }
}
