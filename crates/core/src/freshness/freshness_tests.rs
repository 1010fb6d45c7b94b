//! Scenario tests for the freshness rules on the NYSE and HKEX calendars.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Asia::Hong_Kong;
use quotevault_market_data::calendar::{Calendar, StaticCalendarSource};
use quotevault_market_data::{
    Dividend, FinancialStatement, Interval, OptionChain, PriceBar, ReportingPeriod, Split,
    StatementKind, Symbol,
};
use rust_decimal_macros::dec;

use super::{FreshnessEngine, Verdict};
use crate::config::FreshnessPolicy;
use crate::model::{CacheEntry, DatasetKind, DateRange, Payload, Provenance, SubKey};
use crate::store::CURRENT_SCHEMA_VERSION;

// =============================================================================
// Fixtures
// =============================================================================

fn engine_with(policy: FreshnessPolicy) -> FreshnessEngine {
    let source = StaticCalendarSource::new().with_holidays("NYQ", [date(2024, 7, 4)]);
    FreshnessEngine::new(Arc::new(Calendar::new(Arc::new(source))), policy)
}

fn engine() -> FreshnessEngine {
    engine_with(FreshnessPolicy::default())
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn ny(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    New_York
        .with_ymd_and_hms(y, m, d, h, min, s)
        .unwrap()
        .with_timezone(&Utc)
}

fn range(start: NaiveDate, end: NaiveDate) -> DateRange {
    DateRange::new(start, end).unwrap()
}

fn entry(
    exchange: &str,
    kind: DatasetKind,
    payload: Payload,
    last_refresh: DateTime<Utc>,
    coverage: Option<DateRange>,
) -> CacheEntry {
    CacheEntry {
        symbol: Symbol::new("TEST", exchange),
        sub_key: SubKey::Filing { cadence_days: None },
        kind,
        payload,
        schema_version: CURRENT_SCHEMA_VERSION,
        last_refresh,
        coverage,
        provenance: Provenance::new("MOCK"),
        expires_at: None,
    }
}

fn one_minute() -> DatasetKind {
    DatasetKind::IntradayPrice {
        interval: Interval::Min1,
    }
}

fn intraday_entry(last_refresh: DateTime<Utc>) -> CacheEntry {
    entry(
        "NYQ",
        one_minute(),
        Payload::Prices(vec![]),
        last_refresh,
        Some(DateRange::single(date(2024, 3, 5))),
    )
}

fn today_key() -> SubKey {
    SubKey::range(DateRange::single(date(2024, 3, 5)))
}

fn dividends(dates: &[NaiveDate]) -> Payload {
    Payload::Dividends(
        dates
            .iter()
            .map(|d| Dividend {
                ex_date: *d,
                amount: dec!(0.24),
            })
            .collect(),
    )
}

fn quarterly_dividend_dates() -> Vec<NaiveDate> {
    vec![
        date(2023, 2, 10),
        date(2023, 5, 12),
        date(2023, 8, 11),
        date(2023, 11, 10),
        date(2024, 2, 9),
    ]
}

fn statements(period_ends: &[NaiveDate]) -> Payload {
    Payload::Financials(
        period_ends
            .iter()
            .map(|d| FinancialStatement {
                period_end: *d,
                filed_on: None,
                items: [("TotalRevenue".to_string(), dec!(1000))].into(),
            })
            .collect(),
    )
}

fn income_quarterly() -> DatasetKind {
    DatasetKind::FinancialStatement {
        statement: StatementKind::Income,
        period: ReportingPeriod::Quarterly,
    }
}

// =============================================================================
// Intraday
// =============================================================================

#[test]
fn test_intraday_refreshed_before_close_is_fresh_after_close() {
    let e = intraday_entry(ny(2024, 3, 5, 15, 59, 0));
    let verdict = engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 16, 5, 0));
    assert_eq!(verdict, Verdict::Fresh);
}

#[test]
fn test_intraday_goes_stale_when_a_bar_closes() {
    let e = intraday_entry(ny(2024, 3, 5, 15, 59, 0));
    let verdict =
        engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 15, 59, 30));
    assert_eq!(verdict, Verdict::Stale);
}

#[test]
fn test_intraday_fresh_until_bar_close_plus_lag() {
    let engine = engine();
    let e = intraday_entry(ny(2024, 3, 5, 10, 0, 20));
    // The 10:00 bar was published at 10:00:15, before the refresh
    assert_eq!(
        engine.evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 10, 1, 10)),
        Verdict::Fresh
    );
    // The 10:01 bar is published at 10:01:15
    assert_eq!(
        engine.evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 10, 1, 15)),
        Verdict::Stale
    );
}

#[test]
fn test_intraday_from_previous_session_is_stale_after_open() {
    let e = intraday_entry(ny(2024, 3, 4, 16, 30, 0));
    let verdict =
        engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 9, 30, 5));
    assert_eq!(verdict, Verdict::Stale);
}

#[test]
fn test_intraday_fresh_over_weekend() {
    let e = intraday_entry(ny(2024, 3, 1, 16, 10, 0));
    let verdict =
        engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 3, 12, 0, 0));
    assert_eq!(verdict, Verdict::Fresh);
}

#[test]
fn test_intraday_max_age_applies_during_long_bars() {
    let hourly = DatasetKind::IntradayPrice {
        interval: Interval::Hour1,
    };
    let mut e = intraday_entry(ny(2024, 3, 5, 10, 31, 0));
    e.kind = hourly.clone();
    let now = ny(2024, 3, 5, 11, 0, 0);

    assert_eq!(engine().evaluate(&hourly, &today_key(), Some(&e), now), Verdict::Fresh);

    let strict = engine_with(FreshnessPolicy {
        intraday_max_age_secs: Some(600),
        ..Default::default()
    });
    assert_eq!(strict.evaluate(&hourly, &today_key(), Some(&e), now), Verdict::Stale);
}

#[test]
fn test_lunch_break_counts_as_closed() {
    let hk = |h, m| {
        Hong_Kong
            .with_ymd_and_hms(2024, 3, 5, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    };
    let mut e = intraday_entry(hk(12, 0));
    e.symbol = Symbol::new("0700.HK", "HKG");
    let engine = engine();

    assert_eq!(
        engine.evaluate(&one_minute(), &today_key(), Some(&e), hk(12, 30)),
        Verdict::Fresh
    );
    // Afternoon segment opened after the refresh
    assert_eq!(
        engine.evaluate(&one_minute(), &today_key(), Some(&e), hk(13, 2)),
        Verdict::Stale
    );
}

#[test]
fn test_intraday_request_wider_than_coverage_needs_extension() {
    let e = intraday_entry(ny(2024, 3, 5, 16, 5, 0));
    let wider = SubKey::range(range(date(2024, 3, 1), date(2024, 3, 5)));
    let now = ny(2024, 3, 5, 16, 10, 0);

    assert_eq!(engine().evaluate(&one_minute(), &today_key(), Some(&e), now), Verdict::Fresh);
    assert_eq!(
        engine().evaluate(&one_minute(), &wider, Some(&e), now),
        Verdict::PartialExtensionNeeded(range(date(2024, 3, 1), date(2024, 3, 4)))
    );
}

#[test]
fn test_intraday_coverage_must_reach_today() {
    let e = intraday_entry(ny(2024, 3, 5, 16, 5, 0));
    let through_today = SubKey::range(range(date(2024, 3, 5), date(2024, 3, 8)));

    let verdict = engine().evaluate(
        &one_minute(),
        &through_today,
        Some(&e),
        ny(2024, 3, 6, 9, 0, 0),
    );

    assert_eq!(
        verdict,
        Verdict::PartialExtensionNeeded(DateRange::single(date(2024, 3, 6)))
    );
}

// =============================================================================
// Daily
// =============================================================================

fn daily_entry(coverage: DateRange) -> CacheEntry {
    entry(
        "NYQ",
        DatasetKind::DailyPrice,
        Payload::Prices(vec![]),
        ny(2024, 3, 6, 18, 0, 0),
        Some(coverage),
    )
}

#[test]
fn test_daily_missing_last_completed_day_needs_single_day_extension() {
    // D = Thu 7 Mar; coverage ends D-2 (Tue 5 Mar); last completed is D-1
    let e = daily_entry(range(date(2024, 2, 1), date(2024, 3, 5)));
    let sub_key = SubKey::range(range(date(2024, 2, 1), date(2024, 3, 7)));
    let verdict = engine().evaluate(
        &DatasetKind::DailyPrice,
        &sub_key,
        Some(&e),
        ny(2024, 3, 7, 10, 0, 0),
    );
    assert_eq!(
        verdict,
        Verdict::PartialExtensionNeeded(DateRange::single(date(2024, 3, 6)))
    );
}

#[test]
fn test_daily_current_through_friday_is_fresh_on_weekend() {
    let e = daily_entry(range(date(2024, 2, 1), date(2024, 3, 1)));
    let sub_key = SubKey::range(range(date(2024, 2, 1), date(2024, 3, 3)));
    let verdict = engine().evaluate(
        &DatasetKind::DailyPrice,
        &sub_key,
        Some(&e),
        ny(2024, 3, 3, 12, 0, 0),
    );
    assert_eq!(verdict, Verdict::Fresh);
}

#[test]
fn test_daily_today_not_needed_before_close() {
    let e = daily_entry(range(date(2024, 2, 1), date(2024, 3, 6)));
    let sub_key = SubKey::range(range(date(2024, 2, 1), date(2024, 3, 7)));
    let verdict = engine().evaluate(
        &DatasetKind::DailyPrice,
        &sub_key,
        Some(&e),
        ny(2024, 3, 7, 15, 0, 0),
    );
    assert_eq!(verdict, Verdict::Fresh);
}

#[test]
fn test_daily_session_completes_only_after_provider_lag() {
    let e = daily_entry(range(date(2024, 2, 1), date(2024, 3, 4)));
    let sub_key = SubKey::range(range(date(2024, 2, 1), date(2024, 3, 5)));
    let engine = engine();

    // Closed at 16:00 but the provider publishes 15s later
    assert_eq!(
        engine.evaluate(&DatasetKind::DailyPrice, &sub_key, Some(&e), ny(2024, 3, 5, 16, 0, 5)),
        Verdict::Fresh
    );
    assert_eq!(
        engine.evaluate(&DatasetKind::DailyPrice, &sub_key, Some(&e), ny(2024, 3, 5, 16, 0, 15)),
        Verdict::PartialExtensionNeeded(DateRange::single(date(2024, 3, 5)))
    );
    assert_eq!(
        engine.last_published_day("NYQ", ny(2024, 3, 5, 16, 0, 5)).unwrap(),
        date(2024, 3, 4)
    );
}

#[test]
fn test_daily_leading_gap_reported_after_trailing_edge() {
    let e = daily_entry(range(date(2024, 2, 5), date(2024, 3, 6)));
    let sub_key = SubKey::range(range(date(2024, 1, 2), date(2024, 3, 6)));
    let verdict = engine().evaluate(
        &DatasetKind::DailyPrice,
        &sub_key,
        Some(&e),
        ny(2024, 3, 7, 10, 0, 0),
    );
    // Mon 5 Feb is covered; the gap ends on Fri 2 Feb
    assert_eq!(
        verdict,
        Verdict::PartialExtensionNeeded(range(date(2024, 1, 2), date(2024, 2, 2)))
    );
}

#[test]
fn test_daily_extension_skips_holiday() {
    // Coverage ends Wed 3 Jul; 4 Jul is a holiday
    let e = daily_entry(range(date(2024, 6, 3), date(2024, 7, 3)));
    let sub_key = SubKey::range(range(date(2024, 6, 3), date(2024, 7, 8)));
    let verdict = engine().evaluate(
        &DatasetKind::DailyPrice,
        &sub_key,
        Some(&e),
        ny(2024, 7, 8, 9, 0, 0),
    );
    assert_eq!(
        verdict,
        Verdict::PartialExtensionNeeded(range(date(2024, 7, 5), date(2024, 7, 5)))
    );
}

// =============================================================================
// Corporate actions
// =============================================================================

fn dividend_entry(last_refresh: DateTime<Utc>) -> CacheEntry {
    entry(
        "NYQ",
        DatasetKind::Dividend,
        dividends(&quarterly_dividend_dates()),
        last_refresh,
        Some(range(date(2020, 1, 1), date(2024, 4, 1))),
    )
}

fn dividend_key() -> SubKey {
    SubKey::range(range(date(2020, 1, 1), date(2024, 5, 20)))
}

#[test]
fn test_projected_dividend_forces_refresh() {
    // Cadence projects an ex-date around 10 May 2024
    let e = dividend_entry(ny(2024, 4, 1, 12, 0, 0));
    let verdict = engine().evaluate(
        &DatasetKind::Dividend,
        &dividend_key(),
        Some(&e),
        ny(2024, 5, 20, 12, 0, 0),
    );
    assert_eq!(verdict, Verdict::Stale);
}

#[test]
fn test_refresh_after_grace_window_is_fresh() {
    let e = dividend_entry(ny(2024, 5, 15, 12, 0, 0));
    let verdict = engine().evaluate(
        &DatasetKind::Dividend,
        &dividend_key(),
        Some(&e),
        ny(2024, 5, 20, 12, 0, 0),
    );
    assert_eq!(verdict, Verdict::Fresh);
}

#[test]
fn test_no_pending_action_is_fresh() {
    let e = dividend_entry(ny(2024, 3, 1, 12, 0, 0));
    let verdict = engine().evaluate(
        &DatasetKind::Dividend,
        &dividend_key(),
        Some(&e),
        ny(2024, 3, 20, 12, 0, 0),
    );
    assert_eq!(verdict, Verdict::Fresh);
}

#[test]
fn test_grace_window_is_per_exchange() {
    let mut policy = FreshnessPolicy::default();
    policy
        .corporate_action_grace_overrides
        .insert("NYQ".to_string(), 10);
    // Known split on Mon 10 Jun; refreshed three days later
    let e = entry(
        "NYQ",
        DatasetKind::Split,
        Payload::Splits(vec![Split {
            ex_date: date(2024, 6, 10),
            numerator: dec!(10),
            denominator: dec!(1),
        }]),
        ny(2024, 6, 13, 12, 0, 0),
        Some(range(date(2020, 1, 1), date(2024, 6, 13))),
    );
    let key = SubKey::range(range(date(2020, 1, 1), date(2024, 6, 14)));
    let now = ny(2024, 6, 14, 12, 0, 0);

    assert_eq!(engine().evaluate(&DatasetKind::Split, &key, Some(&e), now), Verdict::Fresh);
    assert_eq!(
        engine_with(policy).evaluate(&DatasetKind::Split, &key, Some(&e), now),
        Verdict::Stale
    );
}

#[test]
fn test_corporate_action_leading_gap_extends() {
    let e = dividend_entry(ny(2024, 3, 1, 12, 0, 0));
    let key = SubKey::range(range(date(2015, 1, 1), date(2024, 3, 20)));
    let verdict = engine().evaluate(&DatasetKind::Dividend, &key, Some(&e), ny(2024, 3, 20, 12, 0, 0));
    assert_eq!(
        verdict,
        Verdict::PartialExtensionNeeded(range(date(2015, 1, 1), date(2019, 12, 31)))
    );
}

// =============================================================================
// Financial statements
// =============================================================================

fn quarter_ends() -> Vec<NaiveDate> {
    vec![
        date(2023, 3, 31),
        date(2023, 6, 30),
        date(2023, 9, 30),
        date(2023, 12, 31),
    ]
}

fn financials_entry(last_refresh: DateTime<Utc>) -> CacheEntry {
    entry(
        "NYQ",
        income_quarterly(),
        statements(&quarter_ends()),
        last_refresh,
        None,
    )
}

fn filing_key() -> SubKey {
    SubKey::Filing { cadence_days: None }
}

#[test]
fn test_financials_fresh_until_next_filing_due() {
    // Median cadence 92 days + 45 days lag: due 16 May 2024
    let e = financials_entry(ny(2024, 3, 1, 12, 0, 0));
    let engine = engine();
    assert_eq!(
        engine.evaluate(&income_quarterly(), &filing_key(), Some(&e), ny(2024, 5, 15, 12, 0, 0)),
        Verdict::Fresh
    );
    assert_eq!(
        engine.evaluate(&income_quarterly(), &filing_key(), Some(&e), ny(2024, 5, 17, 12, 0, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_overdue_filing_rechecked_weekly() {
    let e = financials_entry(ny(2024, 5, 18, 12, 0, 0));
    let engine = engine();
    assert_eq!(
        engine.evaluate(&income_quarterly(), &filing_key(), Some(&e), ny(2024, 5, 20, 12, 0, 0)),
        Verdict::Fresh
    );
    assert_eq!(
        engine.evaluate(&income_quarterly(), &filing_key(), Some(&e), ny(2024, 5, 26, 12, 0, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_caller_cadence_overrides_history() {
    let e = financials_entry(ny(2024, 3, 1, 12, 0, 0));
    let semiannual = SubKey::Filing {
        cadence_days: Some(182),
    };
    assert_eq!(
        engine().evaluate(&income_quarterly(), &semiannual, Some(&e), ny(2024, 5, 20, 12, 0, 0)),
        Verdict::Fresh
    );
}

// =============================================================================
// Option chains
// =============================================================================

fn chain_kind(expiry: NaiveDate) -> DatasetKind {
    DatasetKind::OptionChain { expiry }
}

fn chain_entry(expiry: NaiveDate, last_refresh: DateTime<Utc>) -> CacheEntry {
    entry(
        "NYQ",
        chain_kind(expiry),
        Payload::OptionChain(OptionChain {
            expiry,
            contracts: vec![],
        }),
        last_refresh,
        None,
    )
}

#[test]
fn test_option_chain_expires_at_expiry_close() {
    let expiry = date(2024, 3, 15);
    let e = chain_entry(expiry, ny(2024, 3, 15, 15, 59, 0));
    let key = SubKey::Expiry { expiry };
    let engine = engine();

    assert_eq!(
        engine.evaluate(&chain_kind(expiry), &key, Some(&e), ny(2024, 3, 15, 15, 59, 30)),
        Verdict::Fresh
    );
    assert_eq!(
        engine.evaluate(&chain_kind(expiry), &key, Some(&e), ny(2024, 3, 15, 16, 0, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_weekend_expiry_closes_on_friday() {
    let engine = engine();
    assert_eq!(
        engine.option_expiry_close("NYQ", date(2024, 3, 16)).unwrap(),
        ny(2024, 3, 15, 16, 0, 0)
    );
    assert!(engine
        .is_option_expired("NYQ", date(2024, 3, 16), ny(2024, 3, 15, 16, 0, 0))
        .unwrap());
}

// =============================================================================
// General rules
// =============================================================================

#[test]
fn test_missing_entry_is_stale() {
    assert_eq!(
        engine().evaluate(&DatasetKind::DailyPrice, &today_key(), None, ny(2024, 3, 5, 12, 0, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_malformed_payload_is_stale() {
    let bar = PriceBar::ohlcv(ny(2024, 3, 5, 9, 30, 0), dec!(10), dec!(9), dec!(11), dec!(10), dec!(1));
    let mut e = intraday_entry(ny(2024, 3, 5, 15, 59, 0));
    e.payload = Payload::Prices(vec![bar]);
    assert_eq!(
        engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 16, 5, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_hard_expiry_overrides_policy() {
    let mut e = intraday_entry(ny(2024, 3, 5, 15, 59, 0));
    e.expires_at = Some(ny(2024, 3, 5, 16, 1, 0));
    assert_eq!(
        engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 16, 5, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_unknown_exchange_is_stale_not_error() {
    let mut e = intraday_entry(ny(2024, 3, 5, 15, 59, 0));
    e.symbol = Symbol::new("TEST", "XXXX");
    assert_eq!(
        engine().evaluate(&one_minute(), &today_key(), Some(&e), ny(2024, 3, 5, 16, 5, 0)),
        Verdict::Stale
    );
}

#[test]
fn test_caller_max_age_turns_fresh_entry_stale() {
    let e = dividend_entry(ny(2024, 3, 1, 12, 0, 0));
    let now = ny(2024, 3, 20, 12, 0, 0);
    let evaluate = |max_age| {
        engine().evaluate_within(&DatasetKind::Dividend, &dividend_key(), Some(&e), now, max_age)
    };

    assert_eq!(evaluate(None), Verdict::Fresh);
    assert_eq!(evaluate(Some(Duration::days(30))), Verdict::Fresh);
    assert_eq!(evaluate(Some(Duration::days(7))), Verdict::Stale);
}

#[test]
fn test_max_age_does_not_hide_a_needed_extension() {
    let e = intraday_entry(ny(2024, 3, 5, 11, 0, 0));
    let wider = SubKey::range(range(date(2024, 3, 4), date(2024, 3, 5)));
    let verdict = engine().evaluate_within(
        &one_minute(),
        &wider,
        Some(&e),
        ny(2024, 3, 5, 11, 0, 30),
        Some(Duration::seconds(1)),
    );
    assert_eq!(
        verdict,
        Verdict::PartialExtensionNeeded(DateRange::single(date(2024, 3, 4)))
    );
}

#[test]
fn test_evaluate_is_deterministic() {
    let engine = engine();
    let e = dividend_entry(ny(2024, 4, 1, 12, 0, 0));
    let now = ny(2024, 5, 20, 12, 0, 0);
    let first = engine.evaluate(&DatasetKind::Dividend, &dividend_key(), Some(&e), now);
    for _ in 0..5 {
        assert_eq!(
            engine.evaluate(&DatasetKind::Dividend, &dividend_key(), Some(&e), now),
            first
        );
    }
}

#[test]
fn test_median_gap() {
    use super::median_gap_days;
    assert_eq!(median_gap_days(&[date(2024, 1, 1)]), None);
    assert_eq!(median_gap_days(&quarter_ends()), Some(92));
    assert_eq!(
        median_gap_days(&[date(2024, 1, 1), date(2024, 1, 11), date(2024, 1, 31)]),
        Some(15)
    );
}
