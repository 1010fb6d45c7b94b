//! Session-bound rules: intraday bars and live option chains.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::errors::{MarketDataError, Result};
use quotevault_market_data::Interval;

use super::Verdict;

/// Fresh while no bar of `interval` has been published since `last_refresh`.
///
/// During a regular segment bars close on a grid counted from the segment
/// open and count as published `lag` later. Outside regular hours nothing
/// new can arrive, so an entry taken within one bar of the last close stays
/// fresh until the next open.
pub(super) fn bar_rule(
    calendar: &Calendar,
    exchange: &str,
    interval: Interval,
    lag: Duration,
    max_age: Option<Duration>,
    last_refresh: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Verdict> {
    let step = interval.duration();

    let Some((open, _)) = calendar.current_segment(exchange, now)? else {
        let close = calendar.last_regular_close(exchange, now)?;
        return Ok(if last_refresh >= close - step {
            Verdict::Fresh
        } else {
            Verdict::Stale
        });
    };

    if last_refresh < open {
        return Ok(Verdict::Stale);
    }
    if max_age.is_some_and(|age| now - last_refresh >= age) {
        return Ok(Verdict::Stale);
    }
    match latest_publication(open, step, lag, now) {
        Some(published) if published >= last_refresh => Ok(Verdict::Stale),
        _ => Ok(Verdict::Fresh),
    }
}

/// When the most recent bar closing at or before `now - lag` was published.
fn latest_publication(
    open: DateTime<Utc>,
    step: Duration,
    lag: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let step_secs = step.num_seconds();
    if step_secs <= 0 {
        return None;
    }
    let elapsed = (now - lag - open).num_seconds();
    let bars = elapsed / step_secs;
    if bars < 1 {
        return None;
    }
    Some(open + Duration::seconds(bars * step_secs) + lag)
}

/// Regular close of the last trading day on or before `expiry`.
pub(super) fn expiry_close(
    calendar: &Calendar,
    exchange: &str,
    expiry: NaiveDate,
) -> Result<DateTime<Utc>> {
    let day = if calendar.is_trading_day(exchange, expiry)? {
        expiry
    } else {
        calendar.previous_trading_day(exchange, expiry)?
    };
    calendar
        .session_times(exchange, day)?
        .map(|times| times.close)
        .ok_or_else(|| {
            MarketDataError::NoDataForRange(format!("{} does not trade on {}", exchange, day))
        })
}
