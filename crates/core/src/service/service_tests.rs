//! Tests for QuoteCache end to end, against a scripted provider.
//!
//! # Contract Points
//!
//! 1. Coalescing: concurrent callers for one key cause one upstream fetch
//! 2. Rate ceiling: a batch never outruns the configured request rate
//! 3. Retry budget: transient failures retry with backoff, then fail alone
//! 4. Degradation: a failed refresh serves cached data flagged stale
//! 5. Daily extension: only the missing trading days are fetched
//! 6. Coverage: a day counts as cached only once upstream returned it

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use futures::future::join_all;
    use quotevault_market_data::calendar::Calendar;
    use quotevault_market_data::{
        CorporateActions, Dividend, FetchProvider, FinancialStatement, Interval,
        MarketDataError, OptionChain, OptionContract, OptionRight, PriceBar, ReportingPeriod,
        RateLimit, StatementKind, StaticCalendarSource, Symbol,
    };
    use rust_decimal_macros::dec;

    use crate::clock::FixedClock;
    use crate::config::{CacheConfig, FreshnessPolicy, OrchestratorConfig};
    use crate::errors::{Error, Result};
    use crate::model::{CacheKey, DatasetKind, DateRange, SubKey};
    use crate::orchestrator::RefreshOutcome;
    use crate::datasets::{Adjustment, BarDiscrepancy, VerifyTolerance};
    use crate::service::{PriceQuery, QuoteCache};
    use crate::store::{
        BatchOp, ExpectedVersion, InMemorySubstrate, KvSubstrate, Versioned, WriteOutcome,
        CURRENT_SCHEMA_VERSION,
    };

    // =========================================================================
    // Mock FetchProvider
    // =========================================================================

    #[derive(Clone, Debug, PartialEq)]
    struct Call {
        ticker: String,
        what: &'static str,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    }

    #[derive(Clone, Default)]
    struct MockProvider {
        calls: Arc<Mutex<Vec<Call>>>,
        scripted: Arc<Mutex<HashMap<String, VecDeque<MarketDataError>>>>,
        broken: Arc<Mutex<HashSet<String>>>,
        unpublished: Arc<Mutex<HashSet<NaiveDate>>>,
        statements: Arc<Mutex<Vec<FinancialStatement>>>,
        restated: Arc<Mutex<HashSet<NaiveDate>>>,
        late_dividends: Arc<Mutex<Vec<Dividend>>>,
        advertised: Option<RateLimit>,
        delay: Duration,
    }

    impl MockProvider {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn advertising(limit: RateLimit) -> Self {
            Self {
                advertised: Some(limit),
                ..Self::default()
            }
        }

        fn fail_next(&self, ticker: &str, err: MarketDataError) {
            self.scripted
                .lock()
                .unwrap()
                .entry(ticker.to_string())
                .or_default()
                .push_back(err);
        }

        fn break_ticker(&self, ticker: &str) {
            self.broken.lock().unwrap().insert(ticker.to_string());
        }

        fn withhold_day(&self, day: NaiveDate) {
            self.unpublished.lock().unwrap().insert(day);
        }

        fn publish_all(&self) {
            self.unpublished.lock().unwrap().clear();
        }

        fn set_statements(&self, statements: Vec<FinancialStatement>) {
            *self.statements.lock().unwrap() = statements;
        }

        /// Bars on `day` now close at 11 instead of 10.5.
        fn restate_day(&self, day: NaiveDate) {
            self.restated.lock().unwrap().insert(day);
        }

        fn announce_dividend(&self, dividend: Dividend) {
            self.late_dividends.lock().unwrap().push(dividend);
        }

        fn calls(&self, ticker: &str, what: &str) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.ticker == ticker && c.what == what)
                .cloned()
                .collect()
        }

        fn total_calls(&self, what: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.what == what)
                .count()
        }

        async fn enter(
            &self,
            symbol: &Symbol,
            what: &'static str,
            window: Option<(DateTime<Utc>, DateTime<Utc>)>,
        ) -> std::result::Result<(), MarketDataError> {
            self.calls.lock().unwrap().push(Call {
                ticker: symbol.ticker.clone(),
                what,
                window,
            });
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.broken.lock().unwrap().contains(&symbol.ticker) {
                return Err(MarketDataError::Transport {
                    provider: "MOCK".to_string(),
                    message: "connection reset".to_string(),
                });
            }
            let next = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&symbol.ticker)
                .and_then(VecDeque::pop_front);
            match next {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn dividend_fixture() -> Vec<Dividend> {
        [
            date(2023, 2, 10),
            date(2023, 5, 12),
            date(2023, 8, 11),
            date(2023, 11, 10),
            date(2024, 2, 9),
        ]
        .into_iter()
        .map(|ex_date| Dividend {
            ex_date,
            amount: dec!(0.24),
        })
        .collect()
    }

    #[async_trait]
    impl FetchProvider for MockProvider {
        fn id(&self) -> &'static str {
            "MOCK"
        }

        /// Looser than any configuration under test unless overridden.
        fn rate_limit(&self) -> RateLimit {
            self.advertised.clone().unwrap_or(RateLimit {
                requests_per_interval: 1000,
                interval: Duration::from_secs(1),
                burst: 1000,
                max_concurrency: 64,
            })
        }

        async fn resolve_symbol(
            &self,
            ticker: &str,
        ) -> std::result::Result<Symbol, MarketDataError> {
            match ticker {
                "XYZ" => Ok(Symbol::new("XYZ", "NOPE")),
                "MISSING" => Err(MarketDataError::SymbolNotFound(ticker.to_string())),
                _ => Ok(Symbol::new(ticker, "NMS")),
            }
        }

        /// One bar per weekday in `[start, end)`, stamped 14:30 UTC, except
        /// for withheld days.
        async fn fetch_prices(
            &self,
            symbol: &Symbol,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            _interval: Interval,
        ) -> std::result::Result<Vec<PriceBar>, MarketDataError> {
            self.enter(symbol, "prices", Some((start, end))).await?;
            let mut bars = Vec::new();
            let unpublished = self.unpublished.lock().unwrap().clone();
            let restated = self.restated.lock().unwrap().clone();
            let mut day = start.date_naive();
            while day < end.date_naive() {
                if chrono::Datelike::weekday(&day).num_days_from_monday() < 5
                    && !unpublished.contains(&day)
                {
                    let ts = Utc.from_utc_datetime(&day.and_hms_opt(14, 30, 0).unwrap());
                    let close = if restated.contains(&day) { dec!(11) } else { dec!(10.5) };
                    bars.push(PriceBar::ohlcv(ts, dec!(10), dec!(11), dec!(9), close, dec!(1000)));
                }
                day = day.succ_opt().unwrap();
            }
            Ok(bars)
        }

        async fn fetch_financials(
            &self,
            symbol: &Symbol,
            _statement: StatementKind,
            _period: ReportingPeriod,
        ) -> std::result::Result<Vec<FinancialStatement>, MarketDataError> {
            self.enter(symbol, "financials", None).await?;
            Ok(self.statements.lock().unwrap().clone())
        }

        async fn fetch_option_chain(
            &self,
            symbol: &Symbol,
            expiry: NaiveDate,
        ) -> std::result::Result<OptionChain, MarketDataError> {
            self.enter(symbol, "options", None).await?;
            Ok(OptionChain {
                expiry,
                contracts: vec![OptionContract {
                    contract_symbol: format!("{}240308C00170000", symbol.ticker),
                    right: OptionRight::Call,
                    strike: dec!(170),
                    last_price: Some(dec!(3.1)),
                    bid: None,
                    ask: None,
                    implied_volatility: None,
                    open_interest: 120,
                    volume: 40,
                }],
            })
        }

        async fn fetch_corporate_actions(
            &self,
            symbol: &Symbol,
            start: NaiveDate,
            end: NaiveDate,
        ) -> std::result::Result<CorporateActions, MarketDataError> {
            self.enter(symbol, "actions", None).await?;
            let late = self.late_dividends.lock().unwrap().clone();
            Ok(CorporateActions {
                dividends: dividend_fixture()
                    .into_iter()
                    .chain(late)
                    .filter(|d| d.ex_date >= start && d.ex_date <= end)
                    .collect(),
                splits: Vec::new(),
            })
        }
    }

    // =========================================================================
    // Conflict-injecting substrate
    // =========================================================================

    #[derive(Default)]
    struct ContendedSubstrate {
        inner: InMemorySubstrate,
        conflicts: Mutex<bool>,
    }

    impl ContendedSubstrate {
        fn set_conflicts(&self, on: bool) {
            *self.conflicts.lock().unwrap() = on;
        }
    }

    #[async_trait]
    impl KvSubstrate for ContendedSubstrate {
        async fn read(&self, key: &str) -> Result<Option<Versioned>> {
            self.inner.read(key).await
        }

        async fn write(
            &self,
            key: &str,
            value: Vec<u8>,
            expected: ExpectedVersion,
        ) -> Result<WriteOutcome> {
            if *self.conflicts.lock().unwrap() {
                return Ok(WriteOutcome::Conflict);
            }
            self.inner.write(key, value, expected).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
            self.inner.scan_prefix(prefix).await
        }

        async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
            self.inner.write_batch(ops).await
        }
    }

    // =========================================================================
    // Harness
    // =========================================================================

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn range(start: NaiveDate, end: NaiveDate) -> DateRange {
        DateRange::new(start, end).unwrap()
    }

    /// Tuesday 5 March 2024, 07:00 New York: Monday is the last complete session.
    fn tuesday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    /// Wednesday 6 March 2024, 13:00 New York: Tuesday is the last complete session.
    fn wednesday_midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 18, 0, 0).unwrap()
    }

    struct Harness {
        cache: QuoteCache,
        provider: MockProvider,
        clock: Arc<FixedClock>,
        substrate: Arc<ContendedSubstrate>,
    }

    async fn harness_with(
        provider: MockProvider,
        config: CacheConfig,
        now: DateTime<Utc>,
    ) -> Harness {
        let clock = Arc::new(FixedClock::new(now));
        let substrate = Arc::new(ContendedSubstrate::default());
        let calendar = Arc::new(Calendar::new(Arc::new(StaticCalendarSource::new())));
        let cache = QuoteCache::open_with_clock(
            substrate.clone(),
            Arc::new(provider.clone()),
            calendar,
            config,
            clock.clone(),
        )
        .await
        .unwrap();
        Harness {
            cache,
            provider,
            clock,
            substrate,
        }
    }

    async fn harness(now: DateTime<Utc>) -> Harness {
        harness_with(MockProvider::default(), unthrottled(), now).await
    }

    fn unthrottled() -> CacheConfig {
        CacheConfig {
            orchestrator: OrchestratorConfig {
                requests_per_interval: 100,
                burst: 100,
                ..OrchestratorConfig::default()
            },
            ..CacheConfig::default()
        }
    }

    // =========================================================================
    // Daily extension
    // =========================================================================

    #[tokio::test]
    async fn test_cold_daily_request_stops_at_last_complete_session() {
        let h = harness(tuesday_morning()).await;

        let fetched = h
            .cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 1), date(2024, 3, 5))))
            .await
            .unwrap();

        assert!(!fetched.stale);
        assert_eq!(fetched.data.len(), 2); // Fri 1st and Mon 4th
        let calls = h.provider.calls("AAPL", "prices");
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].window,
            Some((
                Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 5, 5, 0, 0).unwrap(),
            ))
        );
    }

    #[tokio::test]
    async fn test_next_day_fetches_only_the_missing_session() {
        let h = harness(tuesday_morning()).await;
        let wanted = Some(range(date(2024, 3, 1), date(2024, 3, 5)));
        h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        h.clock.set(wednesday_midday());
        let fetched = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        assert_eq!(fetched.data.len(), 3);
        let calls = h.provider.calls("AAPL", "prices");
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].window,
            Some((
                Utc.with_ymd_and_hms(2024, 3, 5, 5, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 6, 5, 0, 0).unwrap(),
            ))
        );
    }

    #[tokio::test]
    async fn test_earlier_start_fetches_only_the_leading_gap() {
        let h = harness(wednesday_midday()).await;
        h.cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 1), date(2024, 3, 5))))
            .await
            .unwrap();

        let fetched = h
            .cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 2, 26), date(2024, 3, 5))))
            .await
            .unwrap();

        assert_eq!(fetched.data.len(), 7);
        let calls = h.provider.calls("AAPL", "prices");
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].window,
            Some((
                Utc.with_ymd_and_hms(2024, 2, 26, 5, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap(),
            ))
        );
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_without_fetching() {
        let h = harness(wednesday_midday()).await;
        let wanted = Some(range(date(2024, 3, 4), date(2024, 3, 5)));
        h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        let again = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        assert_eq!(again.data.len(), 2);
        assert_eq!(h.provider.total_calls("prices"), 1);
    }

    // =========================================================================
    // Coalescing and rate ceiling
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce_into_one_fetch() {
        let h = harness_with(
            MockProvider::with_delay(Duration::from_millis(200)),
            CacheConfig::default(),
            wednesday_midday(),
        )
        .await;
        h.cache.register_symbol(Symbol::new("AAPL", "NMS")).unwrap();
        let wanted = Some(range(date(2024, 3, 5), date(2024, 3, 5)));

        let results =
            join_all((0..8).map(|_| h.cache.get_prices("AAPL", Interval::Day1, wanted))).await;

        assert_eq!(h.provider.total_calls("prices"), 1);
        for result in results {
            let fetched = result.unwrap();
            assert!(!fetched.stale);
            assert_eq!(fetched.data.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_respects_request_rate() {
        let config = CacheConfig {
            orchestrator: OrchestratorConfig {
                max_concurrency: 10,
                requests_per_interval: 2,
                interval_ms: 1000,
                burst: 1,
                ..OrchestratorConfig::default()
            },
            ..CacheConfig::default()
        };
        let h = harness_with(MockProvider::default(), config, wednesday_midday()).await;
        let tickers = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"];
        for ticker in tickers {
            h.cache.register_symbol(Symbol::new(ticker, "NYQ")).unwrap();
        }

        let started = tokio::time::Instant::now();
        let report = h
            .cache
            .refresh_all(
                &tickers,
                &DatasetKind::DailyPrice,
                &SubKey::range(range(date(2024, 3, 5), date(2024, 3, 5))),
            )
            .await;

        assert!(started.elapsed() >= Duration::from_millis(4_500));
        assert_eq!(report.succeeded(), 10);
        assert_eq!(h.provider.total_calls("prices"), 10);
        assert_eq!(
            report.get("A"),
            Some(&Ok(RefreshOutcome::Refreshed { attempts: 1 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_advertised_rate_caps_configured_rate() {
        let provider = MockProvider::advertising(RateLimit {
            requests_per_interval: 1,
            interval: Duration::from_secs(1),
            burst: 1,
            max_concurrency: 2,
        });
        let h = harness_with(provider, unthrottled(), wednesday_midday()).await;
        let tickers = ["A", "B", "C", "D"];
        for ticker in tickers {
            h.cache.register_symbol(Symbol::new(ticker, "NYQ")).unwrap();
        }

        let started = tokio::time::Instant::now();
        let report = h
            .cache
            .refresh_all(
                &tickers,
                &DatasetKind::DailyPrice,
                &SubKey::range(range(date(2024, 3, 5), date(2024, 3, 5))),
            )
            .await;

        assert_eq!(report.succeeded(), 4);
        assert!(started.elapsed() >= Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_short_circuits_fresh_symbols() {
        let h = harness_with(MockProvider::default(), unthrottled(), wednesday_midday()).await;
        let sub_key = SubKey::range(range(date(2024, 3, 5), date(2024, 3, 5)));
        h.cache
            .refresh_all(&["AAPL"], &DatasetKind::DailyPrice, &sub_key)
            .await;

        let report = h
            .cache
            .refresh_all(&["AAPL", "MSFT"], &DatasetKind::DailyPrice, &sub_key)
            .await;

        assert_eq!(report.get("AAPL"), Some(&Ok(RefreshOutcome::AlreadyFresh)));
        assert_eq!(
            report.get("MSFT"),
            Some(&Ok(RefreshOutcome::Refreshed { attempts: 1 }))
        );
        assert_eq!(h.provider.total_calls("prices"), 2);
    }

    // =========================================================================
    // Retries and degradation
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_symbol_backs_off_and_retries() {
        let h = harness_with(MockProvider::default(), unthrottled(), wednesday_midday()).await;
        h.provider.fail_next(
            "AAPL",
            MarketDataError::RateLimited {
                provider: "MOCK".to_string(),
                retry_after: Some(Duration::from_secs(2)),
            },
        );

        let started = tokio::time::Instant::now();
        let report = h
            .cache
            .refresh_all(
                &["AAPL"],
                &DatasetKind::DailyPrice,
                &SubKey::range(range(date(2024, 3, 5), date(2024, 3, 5))),
            )
            .await;

        assert_eq!(
            report.get("AAPL"),
            Some(&Ok(RefreshOutcome::Refreshed { attempts: 2 }))
        );
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_upstream_data_is_not_retried() {
        let h = harness_with(MockProvider::default(), unthrottled(), wednesday_midday()).await;
        h.provider.fail_next(
            "AAPL",
            MarketDataError::ValidationFailed {
                message: "close below low".to_string(),
            },
        );

        let report = h
            .cache
            .refresh_all(
                &["AAPL"],
                &DatasetKind::DailyPrice,
                &SubKey::range(range(date(2024, 3, 5), date(2024, 3, 5))),
            )
            .await;

        assert!(matches!(
            report.get("AAPL"),
            Some(Err(Error::InvalidUpstreamData(_)))
        ));
        assert_eq!(h.provider.calls("AAPL", "prices").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_budget_fails_only_that_symbol() {
        let h = harness_with(MockProvider::default(), unthrottled(), wednesday_midday()).await;
        h.provider.break_ticker("BAD");

        let report = h
            .cache
            .refresh_all(
                &["AAPL", "BAD", "MISSING"],
                &DatasetKind::DailyPrice,
                &SubKey::range(range(date(2024, 3, 5), date(2024, 3, 5))),
            )
            .await;

        assert!(report.get("AAPL").unwrap().is_ok());
        assert!(matches!(
            report.get("BAD"),
            Some(Err(Error::UpstreamUnavailable(_)))
        ));
        assert!(matches!(report.get("MISSING"), Some(Err(Error::NotFound(_)))));
        assert_eq!(h.provider.calls("BAD", "prices").len(), 3);
        assert_eq!(report.failures().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_serves_cached_data_flagged_stale() {
        let h = harness_with(MockProvider::default(), unthrottled(), tuesday_morning()).await;
        let wanted = Some(range(date(2024, 3, 1), date(2024, 3, 5)));
        h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        h.clock.set(wednesday_midday());
        h.provider.break_ticker("AAPL");
        let fetched = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        assert!(fetched.stale);
        assert!(matches!(fetched.error, Some(Error::UpstreamUnavailable(_))));
        assert_eq!(fetched.data.len(), 2);
        assert_eq!(fetched.last_refresh, Some(tuesday_morning()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_miss_with_failing_upstream_is_an_error() {
        let h = harness_with(MockProvider::default(), unthrottled(), wednesday_midday()).await;
        h.provider.break_ticker("AAPL");

        let result = h
            .cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 5), date(2024, 3, 5))))
            .await;

        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_lost_write_races_surface_concurrent_update_failed() {
        let h = harness(wednesday_midday()).await;
        h.substrate.set_conflicts(true);

        let result = h
            .cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 5), date(2024, 3, 5))))
            .await;

        assert!(matches!(result, Err(Error::ConcurrentUpdateFailed(_))));
    }

    // =========================================================================
    // Other datasets
    // =========================================================================

    #[tokio::test]
    async fn test_dividends_are_fetched_once_until_next_ex_date() {
        let h = harness(wednesday_midday()).await;
        let wanted = Some(range(date(2023, 1, 1), date(2024, 3, 6)));

        let first = h.cache.get_dividends("AAPL", wanted).await.unwrap();
        let second = h.cache.get_dividends("AAPL", wanted).await.unwrap();

        assert_eq!(first.data.len(), 5);
        assert_eq!(second.data, first.data);
        assert_eq!(h.provider.total_calls("actions"), 1);
        assert!(h.cache.get_splits("AAPL", wanted).await.unwrap().data.is_empty());
        assert_eq!(h.provider.total_calls("actions"), 2);
    }

    #[tokio::test]
    async fn test_expired_option_chain_is_never_refetched() {
        let h = harness(wednesday_midday()).await;
        let expiry = date(2024, 3, 8);

        let live = h.cache.get_option_chain("AAPL", expiry).await.unwrap();
        assert!(!live.stale);
        assert_eq!(live.data.contracts.len(), 1);

        h.clock.set(Utc.with_ymd_and_hms(2024, 3, 11, 15, 0, 0).unwrap());
        let expired = h.cache.get_option_chain("AAPL", expiry).await.unwrap();

        assert!(expired.stale);
        assert_eq!(expired.data, live.data);
        assert_eq!(h.provider.total_calls("options"), 1);
    }

    #[tokio::test]
    async fn test_cold_expired_option_chain_is_not_found() {
        let h = harness(wednesday_midday()).await;

        let result = h.cache.get_option_chain("AAPL", date(2024, 3, 1)).await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(h.provider.total_calls("options"), 0);
    }

    #[tokio::test]
    async fn test_financials_empty_series_is_cached() {
        let h = harness(wednesday_midday()).await;

        let fetched = h
            .cache
            .get_financials("AAPL", StatementKind::Income, ReportingPeriod::Quarterly, None)
            .await
            .unwrap();

        assert!(fetched.data.is_empty());
        assert_eq!(h.provider.total_calls("financials"), 1);
    }

    // =========================================================================
    // Symbols and housekeeping
    // =========================================================================

    #[tokio::test]
    async fn test_symbol_on_unknown_exchange_is_rejected() {
        let h = harness(wednesday_midday()).await;

        let result = h.cache.get_prices("XYZ", Interval::Day1, None).await;

        assert!(matches!(result, Err(Error::UnknownExchange(_))));
        assert!(matches!(
            h.cache.register_symbol(Symbol::new("ABC", "NOPE")),
            Err(Error::UnknownExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_weekly_bars_are_rejected() {
        let h = harness(wednesday_midday()).await;

        let result = h.cache.get_prices("AAPL", Interval::Week1, None).await;

        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_weekly_bar_gaps_are_rejected() {
        let h = harness(wednesday_midday()).await;

        let result = h
            .cache
            .price_gaps("AAPL", Interval::Week1, range(date(2024, 2, 26), date(2024, 3, 6)))
            .await;

        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert_eq!(h.provider.total_calls("prices"), 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_every_entry_of_a_symbol() {
        let h = harness(wednesday_midday()).await;
        h.cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 4), date(2024, 3, 5))))
            .await
            .unwrap();
        h.cache
            .get_dividends("AAPL", Some(range(date(2023, 1, 1), date(2024, 3, 6))))
            .await
            .unwrap();

        assert_eq!(
            h.cache
                .invalidate("AAPL", Some(&DatasetKind::Split))
                .await
                .unwrap(),
            0
        );
        assert_eq!(h.cache.invalidate("AAPL", None).await.unwrap(), 2);
        assert_eq!(
            h.cache.manifest().await.unwrap().unwrap().schema_version,
            CURRENT_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_price_gaps_list_missing_sessions() {
        let config = CacheConfig {
            freshness: FreshnessPolicy {
                missing_range_merge_threshold: 0,
                ..FreshnessPolicy::default()
            },
            ..unthrottled()
        };
        let h = harness_with(MockProvider::default(), config, wednesday_midday()).await;
        h.cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 4), date(2024, 3, 5))))
            .await
            .unwrap();

        let gaps = h
            .cache
            .price_gaps("AAPL", Interval::Day1, range(date(2024, 2, 26), date(2024, 3, 6)))
            .await
            .unwrap();

        assert_eq!(
            gaps,
            vec![
                range(date(2024, 2, 26), date(2024, 3, 1)),
                range(date(2024, 3, 6), date(2024, 3, 6)),
            ]
        );
    }

    #[tokio::test]
    async fn test_price_gaps_merge_nearby_holes_by_default() {
        let h = harness(wednesday_midday()).await;
        h.cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 4), date(2024, 3, 5))))
            .await
            .unwrap();

        let gaps = h
            .cache
            .price_gaps("AAPL", Interval::Day1, range(date(2024, 2, 26), date(2024, 3, 6)))
            .await
            .unwrap();

        assert_eq!(gaps, vec![range(date(2024, 2, 26), date(2024, 3, 6))]);
    }

    // =========================================================================
    // Coverage across sub-keys
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_follower_with_wider_range_gets_its_own_extension() {
        let h = harness_with(
            MockProvider::with_delay(Duration::from_millis(200)),
            unthrottled(),
            wednesday_midday(),
        )
        .await;
        h.cache.register_symbol(Symbol::new("AAPL", "NMS")).unwrap();

        let (narrow, wide) = tokio::join!(
            h.cache.get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 4), date(2024, 3, 5)))),
            h.cache.get_prices("AAPL", Interval::Day1, Some(range(date(2024, 2, 26), date(2024, 3, 5)))),
        );

        assert_eq!(narrow.unwrap().data.len(), 2);
        let wide = wide.unwrap();
        assert!(!wide.stale);
        assert_eq!(wide.data.len(), 7);
        let calls = h.provider.calls("AAPL", "prices");
        assert_eq!(calls.len(), 2);
        // Only the leading gap before Mon 4th
        assert_eq!(
            calls[1].window,
            Some((
                Utc.with_ymd_and_hms(2024, 2, 26, 5, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 2, 5, 0, 0).unwrap(),
            ))
        );
    }

    #[tokio::test]
    async fn test_intraday_request_wider_than_cached_day_fetches_earlier_days() {
        let h = harness(wednesday_midday()).await;
        let today = h
            .cache
            .get_prices("AAPL", Interval::Min1, None)
            .await
            .unwrap();
        assert_eq!(today.data.len(), 1);

        let wider = h
            .cache
            .get_prices("AAPL", Interval::Min1, Some(range(date(2024, 3, 4), date(2024, 3, 6))))
            .await
            .unwrap();

        assert!(!wider.stale);
        assert_eq!(wider.data.len(), 3);
        let calls = h.provider.calls("AAPL", "prices");
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].window,
            Some((
                Utc.with_ymd_and_hms(2024, 3, 4, 5, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 7, 5, 0, 0).unwrap(),
            ))
        );
    }

    #[tokio::test]
    async fn test_unpublished_session_is_asked_for_again() {
        let h = harness(wednesday_midday()).await;
        let wanted = Some(range(date(2024, 3, 4), date(2024, 3, 5)));
        h.provider.withhold_day(date(2024, 3, 5));

        let early = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();
        assert_eq!(early.data.len(), 1);
        assert_eq!(h.provider.total_calls("prices"), 1);

        h.provider.publish_all();
        let later = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        assert_eq!(later.data.len(), 2);
        let calls = h.provider.calls("AAPL", "prices");
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].window,
            Some((
                Utc.with_ymd_and_hms(2024, 3, 5, 5, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 6, 5, 0, 0).unwrap(),
            ))
        );
    }

    // =========================================================================
    // Damaged and restated entries
    // =========================================================================

    #[tokio::test]
    async fn test_corrupt_entry_is_refetched() {
        let h = harness(wednesday_midday()).await;
        let wanted = Some(range(date(2024, 3, 4), date(2024, 3, 5)));
        h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();
        let key = CacheKey::new("AAPL", DatasetKind::DailyPrice).storage_key();
        h.substrate
            .write(&key, b"not a record".to_vec(), ExpectedVersion::Any)
            .await
            .unwrap();

        let fetched = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();

        assert!(!fetched.stale);
        assert_eq!(fetched.data.len(), 2);
        assert_eq!(h.provider.total_calls("prices"), 2);
    }

    #[tokio::test]
    async fn test_restated_financials_replace_cached_figures() {
        let h = harness(wednesday_midday()).await;
        let statement = |revenue| FinancialStatement {
            period_end: date(2023, 9, 30),
            filed_on: None,
            items: [("TotalRevenue".to_string(), revenue)].into(),
        };
        h.provider.set_statements(vec![statement(dec!(1000))]);
        let first = h
            .cache
            .get_financials("AAPL", StatementKind::Income, ReportingPeriod::Quarterly, None)
            .await
            .unwrap();
        assert_eq!(first.data, vec![statement(dec!(1000))]);

        // A week later the overdue filing is looked for again
        let recheck = Utc.with_ymd_and_hms(2024, 3, 14, 18, 0, 0).unwrap();
        h.clock.set(recheck);
        h.provider.set_statements(vec![statement(dec!(1100))]);
        let restated = h
            .cache
            .get_financials("AAPL", StatementKind::Income, ReportingPeriod::Quarterly, None)
            .await
            .unwrap();

        assert_eq!(restated.data, vec![statement(dec!(1100))]);
        assert_eq!(h.provider.total_calls("financials"), 2);
        let key = CacheKey::new(
            "AAPL",
            DatasetKind::FinancialStatement {
                statement: StatementKind::Income,
                period: ReportingPeriod::Quarterly,
            },
        );
        let stored = h.cache.store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.provenance.replaced_at, Some(recheck));
    }

    // =========================================================================
    // Per-call options
    // =========================================================================

    #[tokio::test]
    async fn test_max_age_refetches_an_otherwise_fresh_entry() {
        let h = harness(wednesday_midday()).await;
        let wanted = range(date(2024, 3, 4), date(2024, 3, 5));
        h.cache.get_prices("AAPL", Interval::Day1, Some(wanted)).await.unwrap();

        h.clock.set(wednesday_midday() + chrono::Duration::hours(2));
        let relaxed = PriceQuery {
            max_age: Some(chrono::Duration::days(1)),
            ..PriceQuery::range(wanted)
        };
        h.cache.get_prices_with("AAPL", Interval::Day1, relaxed).await.unwrap();
        assert_eq!(h.provider.total_calls("prices"), 1);

        let strict = PriceQuery {
            max_age: Some(chrono::Duration::hours(1)),
            ..PriceQuery::range(wanted)
        };
        let fetched = h.cache.get_prices_with("AAPL", Interval::Day1, strict).await.unwrap();
        assert!(!fetched.stale);
        assert_eq!(fetched.data.len(), 2);
        assert_eq!(h.provider.total_calls("prices"), 2);

        // Just refreshed, so the same bound is now met
        h.cache.get_prices_with("AAPL", Interval::Day1, strict).await.unwrap();
        assert_eq!(h.provider.total_calls("prices"), 2);
    }

    #[tokio::test]
    async fn test_new_dividend_readjusts_cached_bars() {
        let h = harness(wednesday_midday()).await;
        h.cache
            .get_dividends("AAPL", Some(range(date(2023, 1, 1), date(2024, 3, 6))))
            .await
            .unwrap();
        let query = PriceQuery {
            adjustment: Adjustment {
                splits: false,
                dividends: true,
            },
            ..PriceQuery::range(range(date(2024, 3, 4), date(2024, 3, 5)))
        };

        let before = h.cache.get_prices_with("AAPL", Interval::Day1, query).await.unwrap();
        let closes: Vec<_> = before.data.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(10.5), dec!(10.5)]);

        // The next quarterly ex-date passes and the provider reports it
        h.provider.announce_dividend(Dividend {
            ex_date: date(2024, 5, 10),
            amount: dec!(0.21),
        });
        h.clock.set(Utc.with_ymd_and_hms(2024, 5, 15, 18, 0, 0).unwrap());
        let after = h.cache.get_prices_with("AAPL", Interval::Day1, query).await.unwrap();

        let closes: Vec<_> = after.data.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(10.29), dec!(10.29)]);
        assert!(!after.stale);
        assert_eq!(h.provider.total_calls("prices"), 1);
        assert_eq!(h.provider.total_calls("actions"), 2);

        // Raw bars are untouched in the store
        let raw = h
            .cache
            .get_prices("AAPL", Interval::Day1, Some(range(date(2024, 3, 4), date(2024, 3, 5))))
            .await
            .unwrap();
        assert!(raw.data.iter().all(|b| b.close == dec!(10.5)));
    }

    #[tokio::test]
    async fn test_verify_reports_and_repairs_restated_bars() {
        let h = harness(wednesday_midday()).await;
        let wanted = Some(range(date(2024, 3, 4), date(2024, 3, 5)));
        h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();
        h.provider.restate_day(date(2024, 3, 5));
        let tolerance = VerifyTolerance::default();

        let found = h
            .cache
            .verify_prices("AAPL", Interval::Day1, tolerance, false)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(
            &found[0],
            BarDiscrepancy::Differs { timestamp, upstream, .. }
                if *timestamp == Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap()
                    && upstream.close == dec!(11)
        ));
        let untouched = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();
        assert_eq!(untouched.data[1].close, dec!(10.5));

        let repaired = h
            .cache
            .verify_prices("AAPL", Interval::Day1, tolerance, true)
            .await
            .unwrap();
        assert_eq!(repaired, found);
        let served = h.cache.get_prices("AAPL", Interval::Day1, wanted).await.unwrap();
        assert_eq!(served.data[1].close, dec!(11));

        let clean = h
            .cache
            .verify_prices("AAPL", Interval::Day1, tolerance, false)
            .await
            .unwrap();
        assert!(clean.is_empty());
        assert_eq!(h.provider.total_calls("prices"), 4);
    }
}
