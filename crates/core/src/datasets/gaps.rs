//! Missing trading-day detection for price series.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use quotevault_market_data::calendar::Calendar;
use quotevault_market_data::errors::Result;

use crate::model::DateRange;

/// Trading days in `range` that are not in `known`, grouped into ranges.
///
/// Two missing runs separated by at most `merge_threshold` known trading
/// days are reported as one range, so a caller refetching them issues fewer
/// requests.
pub fn missing_ranges(
    calendar: &Calendar,
    exchange: &str,
    known: &BTreeSet<NaiveDate>,
    range: DateRange,
    merge_threshold: usize,
) -> Result<Vec<DateRange>> {
    let days = calendar.trading_days(exchange, range.start, range.end)?;
    let mut missing: Vec<bool> = days.iter().map(|day| !known.contains(day)).collect();

    let positions: Vec<usize> = missing
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.then_some(i))
        .collect();
    for pair in positions.windows(2) {
        if pair[1] - pair[0] <= merge_threshold + 1 {
            missing[pair[0]..pair[1]].fill(true);
        }
    }

    let mut ranges = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, is_missing) in missing.iter().enumerate() {
        match (is_missing, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                ranges.push(DateRange {
                    start: days[start],
                    end: days[i - 1],
                });
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        ranges.push(DateRange {
            start: days[start],
            end: days[days.len() - 1],
        });
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotevault_market_data::StaticCalendarSource;
    use std::sync::Arc;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn calendar() -> Calendar {
        Calendar::new(Arc::new(StaticCalendarSource::new()))
    }

    /// Mon 4 Mar to Fri 15 Mar 2024: ten trading days.
    fn fortnight() -> DateRange {
        DateRange::new(d(2024, 3, 4), d(2024, 3, 15)).unwrap()
    }

    #[test]
    fn test_nothing_known_is_one_range() {
        let ranges = missing_ranges(&calendar(), "NYQ", &BTreeSet::new(), fortnight(), 0).unwrap();
        assert_eq!(ranges, vec![fortnight()]);
    }

    #[test]
    fn test_everything_known_is_empty() {
        let cal = calendar();
        let known: BTreeSet<_> = cal
            .trading_days("NYQ", d(2024, 3, 4), d(2024, 3, 15))
            .unwrap()
            .into_iter()
            .collect();
        assert!(missing_ranges(&cal, "NYQ", &known, fortnight(), 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_weekends_are_not_gaps() {
        // Everything but Fri 8 Mar and Mon 11 Mar is known.
        let cal = calendar();
        let known: BTreeSet<_> = cal
            .trading_days("NYQ", d(2024, 3, 4), d(2024, 3, 15))
            .unwrap()
            .into_iter()
            .filter(|day| *day != d(2024, 3, 8) && *day != d(2024, 3, 11))
            .collect();
        let ranges = missing_ranges(&cal, "NYQ", &known, fortnight(), 0).unwrap();
        assert_eq!(
            ranges,
            vec![DateRange::new(d(2024, 3, 8), d(2024, 3, 11)).unwrap()]
        );
    }

    #[test]
    fn test_merge_threshold_joins_nearby_gaps() {
        // Missing Tue 5 and Thu 7 Mar, with Wed 6 known.
        let cal = calendar();
        let known: BTreeSet<_> = cal
            .trading_days("NYQ", d(2024, 3, 4), d(2024, 3, 15))
            .unwrap()
            .into_iter()
            .filter(|day| *day != d(2024, 3, 5) && *day != d(2024, 3, 7))
            .collect();

        let split = missing_ranges(&cal, "NYQ", &known, fortnight(), 0).unwrap();
        assert_eq!(
            split,
            vec![
                DateRange::single(d(2024, 3, 5)),
                DateRange::single(d(2024, 3, 7)),
            ]
        );

        let merged = missing_ranges(&cal, "NYQ", &known, fortnight(), 1).unwrap();
        assert_eq!(
            merged,
            vec![DateRange::new(d(2024, 3, 5), d(2024, 3, 7)).unwrap()]
        );
    }
}
