//! Price coverage rules.

use chrono::{DateTime, Duration, Utc};
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::errors::Result;

use super::Verdict;
use crate::model::DateRange;

/// Fresh once the coverage reaches the last completed trading day (or the
/// requested end, if earlier) and the requested start.
///
/// A session only counts as completed once its close plus the exchange
/// delay plus `provider_lag` has passed. A trailing gap is reported before
/// a leading one. Gaps are always contiguous with the coverage, so merging
/// keeps it one range.
pub(super) fn daily_rule(
    calendar: &Calendar,
    exchange: &str,
    requested: Option<DateRange>,
    coverage: Option<DateRange>,
    provider_lag: Duration,
    now: DateTime<Utc>,
) -> Result<Verdict> {
    let Some(coverage) = coverage else {
        return Ok(Verdict::Stale);
    };
    let requested = requested.unwrap_or(coverage);

    let last_complete = calendar.last_completed_trading_day(exchange, now - provider_lag)?;
    let wanted_end = requested.end.min(last_complete);
    if coverage.end < wanted_end {
        let start = calendar.next_trading_day(exchange, coverage.end)?;
        if start <= wanted_end {
            return Ok(Verdict::PartialExtensionNeeded(DateRange {
                start,
                end: wanted_end,
            }));
        }
    }

    if requested.start < coverage.start {
        let end = calendar.previous_trading_day(exchange, coverage.start)?;
        if requested.start <= end {
            return Ok(Verdict::PartialExtensionNeeded(DateRange {
                start: requested.start,
                end,
            }));
        }
    }

    Ok(Verdict::Fresh)
}

/// Intraday entries must cover every requested day up to today; the bar
/// rule only decides freshness of days already covered.
///
/// Returns the missing stretch adjacent to the coverage, trailing first.
pub(super) fn intraday_gap(
    calendar: &Calendar,
    exchange: &str,
    requested: Option<DateRange>,
    coverage: Option<DateRange>,
    now: DateTime<Utc>,
) -> Result<Option<Verdict>> {
    let Some(requested) = requested else {
        return Ok(None);
    };
    let Some(coverage) = coverage else {
        return Ok(Some(Verdict::Stale));
    };
    let today = calendar.local_date(exchange, now)?;
    let end = requested.end.min(today);
    if end < requested.start {
        return Ok(None);
    }
    if end > coverage.end {
        let start = coverage.end.succ_opt().unwrap_or(coverage.end);
        return Ok(Some(Verdict::PartialExtensionNeeded(DateRange {
            start: start.max(requested.start),
            end,
        })));
    }
    if requested.start < coverage.start && requested.start <= end {
        let end = coverage.start.pred_opt().unwrap_or(coverage.start).min(end);
        return Ok(Some(Verdict::PartialExtensionNeeded(DateRange {
            start: requested.start,
            end,
        })));
    }
    Ok(None)
}
