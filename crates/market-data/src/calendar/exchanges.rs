//! Bundled exchange session table.
//!
//! Regular hours, extended hours, lunch breaks, weekends and provider data
//! delays keyed by the provider's exchange code. Holidays and early closes
//! are not bundled; callers inject them from their own calendar feed.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use super::{BreakWindow, CalendarSource, SessionTimes};
use crate::errors::{MarketDataError, Result};

/// Wall-clock time of day as (hour, minute).
pub type HourMinute = (u32, u32);

const SAT_SUN: [Weekday; 2] = [Weekday::Sat, Weekday::Sun];
const FRI_SAT: [Weekday; 2] = [Weekday::Fri, Weekday::Sat];

/// Static description of one exchange.
#[derive(Clone, Copy, Debug)]
pub struct ExchangeSpec {
    /// Provider exchange code (e.g. "NMS")
    pub code: &'static str,
    /// ISO 10383 Market Identifier Code
    pub mic: &'static str,
    pub timezone: Tz,
    pub open: HourMinute,
    pub close: HourMinute,
    pub pre_open: Option<HourMinute>,
    pub post_close: Option<HourMinute>,
    pub lunch: Option<(HourMinute, HourMinute)>,
    pub weekend: [Weekday; 2],
    /// Minutes the provider lags behind the exchange feed
    pub data_delay_minutes: i64,
}

const fn regular(
    code: &'static str,
    mic: &'static str,
    timezone: Tz,
    open: HourMinute,
    close: HourMinute,
) -> ExchangeSpec {
    ExchangeSpec {
        code,
        mic,
        timezone,
        open,
        close,
        pre_open: None,
        post_close: None,
        lunch: None,
        weekend: SAT_SUN,
        data_delay_minutes: 0,
    }
}

const fn us(code: &'static str, mic: &'static str) -> ExchangeSpec {
    ExchangeSpec {
        pre_open: Some((4, 0)),
        post_close: Some((20, 0)),
        ..regular(code, mic, chrono_tz::America::New_York, (9, 30), (16, 0))
    }
}

const fn with_lunch(spec: ExchangeSpec, start: HourMinute, end: HourMinute) -> ExchangeSpec {
    ExchangeSpec {
        lunch: Some((start, end)),
        ..spec
    }
}

const fn delayed(spec: ExchangeSpec, minutes: i64) -> ExchangeSpec {
    ExchangeSpec {
        data_delay_minutes: minutes,
        ..spec
    }
}

static EXCHANGES: &[ExchangeSpec] = &[
    // North America
    us("NYQ", "XNYS"),
    us("NMS", "XNAS"),
    us("NGM", "XNAS"),
    us("NCM", "XNAS"),
    us("ASE", "XASE"),
    us("PCX", "ARCX"),
    us("BTS", "BATS"),
    delayed(
        regular("PNK", "OTCM", chrono_tz::America::New_York, (9, 30), (16, 0)),
        15,
    ),
    regular("TOR", "XTSE", chrono_tz::America::Toronto, (9, 30), (16, 0)),
    regular("VAN", "XTSX", chrono_tz::America::Toronto, (9, 30), (16, 0)),
    regular("MEX", "XMEX", chrono_tz::America::Mexico_City, (8, 30), (15, 0)),
    regular("SAO", "BVMF", chrono_tz::America::Sao_Paulo, (10, 0), (17, 0)),
    // Europe
    regular("LSE", "XLON", chrono_tz::Europe::London, (8, 0), (16, 30)),
    regular("GER", "XETR", chrono_tz::Europe::Berlin, (9, 0), (17, 30)),
    regular("FRA", "XFRA", chrono_tz::Europe::Berlin, (8, 0), (20, 0)),
    regular("PAR", "XPAR", chrono_tz::Europe::Paris, (9, 0), (17, 30)),
    regular("AMS", "XAMS", chrono_tz::Europe::Amsterdam, (9, 0), (17, 30)),
    regular("BRU", "XBRU", chrono_tz::Europe::Brussels, (9, 0), (17, 30)),
    regular("MIL", "XMIL", chrono_tz::Europe::Rome, (9, 0), (17, 30)),
    regular("MCE", "XMAD", chrono_tz::Europe::Madrid, (9, 0), (17, 30)),
    regular("EBS", "XSWX", chrono_tz::Europe::Zurich, (9, 0), (17, 30)),
    regular("STO", "XSTO", chrono_tz::Europe::Stockholm, (9, 0), (17, 30)),
    regular("OSL", "XOSL", chrono_tz::Europe::Oslo, (9, 0), (16, 20)),
    regular("CPH", "XCSE", chrono_tz::Europe::Copenhagen, (9, 0), (17, 0)),
    regular("HEL", "XHEL", chrono_tz::Europe::Helsinki, (10, 0), (18, 30)),
    regular("TLV", "XTAE", chrono_tz::Asia::Jerusalem, (9, 59), (17, 25)),
    // Middle East & Africa
    ExchangeSpec {
        weekend: FRI_SAT,
        ..regular("SAU", "XSAU", chrono_tz::Asia::Riyadh, (10, 0), (15, 0))
    },
    delayed(
        regular("JNB", "XJSE", chrono_tz::Africa::Johannesburg, (9, 0), (17, 0)),
        15,
    ),
    // Asia-Pacific
    with_lunch(
        regular("HKG", "XHKG", chrono_tz::Asia::Hong_Kong, (9, 30), (16, 0)),
        (12, 0),
        (13, 0),
    ),
    with_lunch(
        regular("SHH", "XSHG", chrono_tz::Asia::Shanghai, (9, 30), (15, 0)),
        (11, 30),
        (13, 0),
    ),
    with_lunch(
        regular("SHZ", "XSHE", chrono_tz::Asia::Shanghai, (9, 30), (15, 0)),
        (11, 30),
        (13, 0),
    ),
    with_lunch(
        regular("JPX", "XTKS", chrono_tz::Asia::Tokyo, (9, 0), (15, 0)),
        (11, 30),
        (12, 30),
    ),
    with_lunch(
        regular("SES", "XSES", chrono_tz::Asia::Singapore, (9, 0), (17, 0)),
        (12, 0),
        (13, 0),
    ),
    regular("KSC", "XKRX", chrono_tz::Asia::Seoul, (9, 0), (15, 30)),
    regular("NSI", "XNSE", chrono_tz::Asia::Kolkata, (9, 15), (15, 30)),
    regular("BSE", "XBOM", chrono_tz::Asia::Kolkata, (9, 15), (15, 30)),
    regular("ASX", "XASX", chrono_tz::Australia::Sydney, (10, 0), (16, 0)),
    regular("NZE", "XNZE", chrono_tz::Pacific::Auckland, (10, 0), (16, 45)),
];

/// Look up the bundled description of an exchange code.
///
/// # Arguments
/// * `code` - The provider exchange code
///
/// # Returns
/// The exchange description, or None for unknown codes.
pub fn exchange_spec(code: &str) -> Option<&'static ExchangeSpec> {
    EXCHANGES.iter().find(|spec| spec.code == code)
}

/// All bundled exchange codes.
pub fn known_exchanges() -> impl Iterator<Item = &'static str> {
    EXCHANGES.iter().map(|spec| spec.code)
}

/// Converts exchange-local wall-clock time on `date` to UTC.
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant; times
/// skipped by a DST jump are rejected.
pub(crate) fn local_instant(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| MarketDataError::ValidationFailed {
            message: format!("invalid time {:02}:{:02}", hour, minute),
        })?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| MarketDataError::ValidationFailed {
            message: format!("{} does not exist in {}", naive, tz),
        })
}

/// Calendar source backed by the bundled table plus injected holidays.
#[derive(Clone, Debug, Default)]
pub struct StaticCalendarSource {
    holidays: HashMap<String, BTreeSet<NaiveDate>>,
    early_closes: HashMap<String, HashMap<NaiveDate, HourMinute>>,
}

impl StaticCalendarSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_holiday`](Self::add_holiday).
    pub fn with_holidays(
        mut self,
        exchange: &str,
        dates: impl IntoIterator<Item = NaiveDate>,
    ) -> Self {
        for date in dates {
            self.add_holiday(exchange, date);
        }
        self
    }

    pub fn add_holiday(&mut self, exchange: &str, date: NaiveDate) {
        self.holidays
            .entry(exchange.to_string())
            .or_default()
            .insert(date);
    }

    /// Registers a shortened session (e.g. the day after Thanksgiving).
    pub fn add_early_close(&mut self, exchange: &str, date: NaiveDate, close: HourMinute) {
        self.early_closes
            .entry(exchange.to_string())
            .or_default()
            .insert(date, close);
    }

    fn spec(&self, exchange: &str) -> Result<&'static ExchangeSpec> {
        exchange_spec(exchange).ok_or_else(|| MarketDataError::UnknownExchange(exchange.to_string()))
    }

    fn is_holiday(&self, exchange: &str, date: NaiveDate) -> bool {
        self.holidays
            .get(exchange)
            .is_some_and(|dates| dates.contains(&date))
    }
}

impl CalendarSource for StaticCalendarSource {
    fn timezone(&self, exchange: &str) -> Result<Tz> {
        Ok(self.spec(exchange)?.timezone)
    }

    fn session_times(&self, exchange: &str, date: NaiveDate) -> Result<Option<SessionTimes>> {
        let spec = self.spec(exchange)?;
        if spec.weekend.contains(&date.weekday()) || self.is_holiday(exchange, date) {
            return Ok(None);
        }

        let tz = spec.timezone;
        let at = |(h, m): HourMinute| local_instant(tz, date, h, m);

        let close = self
            .early_closes
            .get(exchange)
            .and_then(|closes| closes.get(&date))
            .copied()
            .unwrap_or(spec.close);
        let close = at(close)?;

        let lunch_break = match spec.lunch {
            Some((start, end)) => {
                let start = at(start)?;
                let end = at(end)?;
                // An early close before the break drops the afternoon entirely
                (end < close).then_some(BreakWindow { start, end })
            }
            None => None,
        };
        let close = match (spec.lunch, lunch_break) {
            (Some((start, _)), None) => close.min(at(start)?),
            _ => close,
        };

        Ok(Some(SessionTimes {
            open: at(spec.open)?,
            close,
            pre_open: spec.pre_open.map(at).transpose()?,
            post_close: spec.post_close.map(at).transpose()?,
            lunch_break,
        }))
    }

    fn data_delay(&self, exchange: &str) -> Result<Duration> {
        Ok(Duration::minutes(self.spec(exchange)?.data_delay_minutes))
    }
}
