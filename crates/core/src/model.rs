//! Cache domain model: what is cached, under which key, with which coverage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use quotevault_market_data::{
    BarValidator, Dividend, FinancialStatement, Interval, OptionChain, PriceBar, ReportingPeriod,
    Split, StatementKind, Symbol,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

// =============================================================================
// Dataset kinds and sub-keys
// =============================================================================

/// Which dataset an entry holds. Each kind has its own freshness policy.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetKind {
    IntradayPrice {
        interval: Interval,
    },
    DailyPrice,
    Dividend,
    Split,
    FinancialStatement {
        statement: StatementKind,
        period: ReportingPeriod,
    },
    OptionChain {
        expiry: NaiveDate,
    },
}

impl DatasetKind {
    /// Stable identifier used as the last segment of a storage key.
    pub fn key_segment(&self) -> String {
        match self {
            DatasetKind::IntradayPrice { interval } => format!("intraday:{}", interval),
            DatasetKind::DailyPrice => "daily".to_string(),
            DatasetKind::Dividend => "dividend".to_string(),
            DatasetKind::Split => "split".to_string(),
            DatasetKind::FinancialStatement { statement, period } => {
                format!("financials:{}:{}", statement, period)
            }
            DatasetKind::OptionChain { expiry } => format!("options:{}", expiry),
        }
    }

    /// Kinds whose requests name a date range.
    pub fn is_ranged(&self) -> bool {
        matches!(
            self,
            DatasetKind::IntradayPrice { .. }
                | DatasetKind::DailyPrice
                | DatasetKind::Dividend
                | DatasetKind::Split
        )
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_segment())
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || Error::InvalidRequest(format!("Unknown dataset kind: {}", s));
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["daily"] => Ok(DatasetKind::DailyPrice),
            ["dividend"] => Ok(DatasetKind::Dividend),
            ["split"] => Ok(DatasetKind::Split),
            ["intraday", interval] => Ok(DatasetKind::IntradayPrice {
                interval: interval.parse().map_err(|_| unknown())?,
            }),
            ["financials", statement, period] => Ok(DatasetKind::FinancialStatement {
                statement: parse_statement(statement).ok_or_else(unknown)?,
                period: parse_period(period).ok_or_else(unknown)?,
            }),
            ["options", expiry] => Ok(DatasetKind::OptionChain {
                expiry: expiry.parse().map_err(|_| unknown())?,
            }),
            _ => Err(unknown()),
        }
    }
}

fn parse_statement(s: &str) -> Option<StatementKind> {
    [
        StatementKind::Income,
        StatementKind::BalanceSheet,
        StatementKind::CashFlow,
        StatementKind::Earnings,
    ]
    .into_iter()
    .find(|k| k.as_str() == s)
}

fn parse_period(s: &str) -> Option<ReportingPeriod> {
    [ReportingPeriod::Quarterly, ReportingPeriod::Annual]
        .into_iter()
        .find(|p| p.as_str() == s)
}

/// Inclusive range of calendar dates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRequest(format!(
                "Range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn contains_date(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    /// True when every day of `other` lies inside `self`.
    pub fn covers(&self, other: &DateRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// True when the ranges overlap or sit on consecutive days.
    pub fn touches(&self, other: &DateRange) -> bool {
        self.start <= other.end + Duration::days(1) && other.start <= self.end + Duration::days(1)
    }

    /// Smallest range containing both.
    pub fn hull(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Number of calendar days in the range.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Dataset-specific part of a request.
///
/// Filing and expiry identity live in [`DatasetKind`]; the sub-key carries
/// what the caller asked for on top of that.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SubKey {
    /// Requested dates of a time series or event list.
    Range { range: DateRange },
    /// A statement series, optionally with the issuer's filing cadence.
    Filing { cadence_days: Option<u32> },
    /// One option expiry.
    Expiry { expiry: NaiveDate },
}

impl SubKey {
    pub fn range(range: DateRange) -> Self {
        SubKey::Range { range }
    }

    pub fn requested_range(&self) -> Option<DateRange> {
        match self {
            SubKey::Range { range } => Some(*range),
            _ => None,
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Key prefix of every entry record.
pub const ENTRY_PREFIX: &str = "entry/";

/// Identity of one cache entry, and of one refresh lease.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub ticker: String,
    pub kind: DatasetKind,
}

impl CacheKey {
    pub fn new(ticker: impl Into<String>, kind: DatasetKind) -> Self {
        Self {
            ticker: ticker.into(),
            kind,
        }
    }

    /// Substrate key, e.g. `entry/AAPL/daily`.
    pub fn storage_key(&self) -> String {
        format!("{}{}", symbol_prefix(&self.ticker), self.kind.key_segment())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ticker, self.kind)
    }
}

/// Prefix shared by all storage keys of one ticker.
pub fn symbol_prefix(ticker: &str) -> String {
    format!("{}{}/", ENTRY_PREFIX, ticker.replace('%', "%25").replace('/', "%2F"))
}

// =============================================================================
// Entries
// =============================================================================

/// Cached data, one variant per dataset family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Prices(Vec<PriceBar>),
    Dividends(Vec<Dividend>),
    Splits(Vec<Split>),
    Financials(Vec<FinancialStatement>),
    OptionChain(OptionChain),
}

impl Payload {
    /// Payload-level validity check against the kind it is stored under.
    pub fn validate(&self, kind: &DatasetKind) -> std::result::Result<(), String> {
        match (kind, self) {
            (DatasetKind::IntradayPrice { .. } | DatasetKind::DailyPrice, Payload::Prices(bars)) => {
                BarValidator::new()
                    .check_series(bars)
                    .map_err(|e| e.to_string())
            }
            (DatasetKind::Dividend, Payload::Dividends(dividends)) => {
                strictly_ascending(dividends.iter().map(|d| d.ex_date), "dividend ex-dates")
            }
            (DatasetKind::Split, Payload::Splits(splits)) => {
                if splits.iter().any(|s| s.ratio().is_none()) {
                    return Err("split with zero denominator".to_string());
                }
                strictly_ascending(splits.iter().map(|s| s.ex_date), "split ex-dates")
            }
            (DatasetKind::FinancialStatement { .. }, Payload::Financials(statements)) => {
                strictly_ascending(statements.iter().map(|s| s.period_end), "period ends")
            }
            (DatasetKind::OptionChain { expiry }, Payload::OptionChain(chain)) => {
                if chain.expiry != *expiry {
                    return Err(format!(
                        "chain expiry {} does not match key expiry {}",
                        chain.expiry, expiry
                    ));
                }
                Ok(())
            }
            (kind, _) => Err(format!("payload shape does not match kind {}", kind)),
        }
    }

    /// Number of rows held, for logging.
    pub fn len(&self) -> usize {
        match self {
            Payload::Prices(v) => v.len(),
            Payload::Dividends(v) => v.len(),
            Payload::Splits(v) => v.len(),
            Payload::Financials(v) => v.len(),
            Payload::OptionChain(c) => c.contracts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn strictly_ascending(
    dates: impl Iterator<Item = NaiveDate>,
    what: &str,
) -> std::result::Result<(), String> {
    let dates: Vec<NaiveDate> = dates.collect();
    match dates.windows(2).find(|w| w[0] >= w[1]) {
        Some(pair) => Err(format!("{} out of order: {} then {}", what, pair[0], pair[1])),
        None => Ok(()),
    }
}

/// Where an entry's data came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Provider id, e.g. "YAHOO"
    pub provider: String,
    /// Upstream responses merged into this entry
    pub fetches: u32,
    /// Last time the entry was replaced wholesale by a restatement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_at: Option<DateTime<Utc>>,
}

impl Provenance {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            fetches: 1,
            replaced_at: None,
        }
    }
}

/// One cached record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub symbol: Symbol,
    pub kind: DatasetKind,
    pub sub_key: SubKey,
    pub payload: Payload,
    /// Shape version of the stored record; filled in by the store on read.
    #[serde(skip)]
    pub schema_version: u32,
    pub last_refresh: DateTime<Utc>,
    /// Dates confirmed by upstream responses. Only grows, except on restatement.
    #[serde(default)]
    pub coverage: Option<DateRange>,
    pub provenance: Provenance,
    /// Hard expiry; the entry is stale from this instant on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.symbol.ticker.clone(), self.kind.clone())
    }
}
