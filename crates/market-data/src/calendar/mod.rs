//! Exchange trading calendar.
//!
//! Resolves trading sessions for an exchange: whether an instant falls in
//! pre-market, regular or post-market hours, where the neighbouring session
//! boundaries are, and which dates are trading days.
//!
//! ```text
//!   CalendarSource (session times per exchange/date, holidays, timezone)
//!          │
//!          ▼
//!   Calendar (pure lookups, timezone cache)
//!          │
//!          ▼
//!   freshness policies in the cache core
//! ```
//!
//! All answers are pure functions of the source's current snapshot. The
//! only state held here is a cache of exchange timezones, which never change
//! for a given exchange code.

mod exchanges;

pub use exchanges::{exchange_spec, known_exchanges, ExchangeSpec, StaticCalendarSource};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use log::warn;

use crate::errors::{MarketDataError, Result};

/// Furthest a calendar search walks before giving up (covers long holiday runs).
const MAX_SCAN_DAYS: i64 = 30;

/// Which part of the trading day an instant falls in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// No trading: night, weekend, holiday or lunch break.
    Closed,
    PreMarket,
    Regular,
    PostMarket,
}

/// Search direction for [`Calendar::next_session_boundary`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A midday pause in regular trading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Session times of one exchange on one trading date, as UTC instants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTimes {
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
    pub pre_open: Option<DateTime<Utc>>,
    pub post_close: Option<DateTime<Utc>>,
    pub lunch_break: Option<BreakWindow>,
}

impl SessionTimes {
    /// Classifies an instant against this day's sessions.
    pub fn kind_at(&self, instant: DateTime<Utc>) -> SessionKind {
        if instant >= self.open && instant < self.close {
            return match self.lunch_break {
                Some(lunch) if instant >= lunch.start && instant < lunch.end => {
                    SessionKind::Closed
                }
                _ => SessionKind::Regular,
            };
        }
        if let Some(pre_open) = self.pre_open {
            if instant >= pre_open && instant < self.open {
                return SessionKind::PreMarket;
            }
        }
        if let Some(post_close) = self.post_close {
            if instant >= self.close && instant < post_close {
                return SessionKind::PostMarket;
            }
        }
        SessionKind::Closed
    }

    /// Contiguous stretches of regular trading, split by the lunch break.
    pub fn regular_segments(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        match self.lunch_break {
            Some(lunch) => vec![(self.open, lunch.start), (lunch.end, self.close)],
            None => vec![(self.open, self.close)],
        }
    }

    /// Every instant where the session kind changes, in ascending order.
    pub fn boundaries(&self) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(6);
        out.extend(self.pre_open);
        out.push(self.open);
        if let Some(lunch) = self.lunch_break {
            out.push(lunch.start);
            out.push(lunch.end);
        }
        out.push(self.close);
        out.extend(self.post_close);
        out
    }
}

/// Supplier of raw exchange calendar data.
///
/// Implementations must be deterministic for a given snapshot; refreshing the
/// snapshot (new holiday lists) is the implementor's concern.
pub trait CalendarSource: Send + Sync {
    /// IANA timezone of the exchange.
    fn timezone(&self, exchange: &str) -> Result<Tz>;

    /// Session times for `date`, or `None` when the exchange does not trade.
    fn session_times(&self, exchange: &str, date: NaiveDate) -> Result<Option<SessionTimes>>;

    /// How long after a bar closes the provider publishes it.
    fn data_delay(&self, _exchange: &str) -> Result<Duration> {
        Ok(Duration::zero())
    }
}

/// Calendar lookups over a [`CalendarSource`].
pub struct Calendar {
    source: Arc<dyn CalendarSource>,
    timezones: Mutex<HashMap<String, Tz>>,
}

impl Calendar {
    pub fn new(source: Arc<dyn CalendarSource>) -> Self {
        Self {
            source,
            timezones: Mutex::new(HashMap::new()),
        }
    }

    fn lock_timezones(&self) -> MutexGuard<'_, HashMap<String, Tz>> {
        self.timezones.lock().unwrap_or_else(|poisoned| {
            warn!("Calendar timezone cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Exchange timezone, looked up once per exchange and cached.
    pub fn timezone(&self, exchange: &str) -> Result<Tz> {
        if let Some(tz) = self.lock_timezones().get(exchange) {
            return Ok(*tz);
        }
        let tz = self.source.timezone(exchange)?;
        self.lock_timezones().insert(exchange.to_string(), tz);
        Ok(tz)
    }

    /// The exchange-local calendar date of an instant.
    pub fn local_date(&self, exchange: &str, instant: DateTime<Utc>) -> Result<NaiveDate> {
        let tz = self.timezone(exchange)?;
        Ok(instant.with_timezone(&tz).date_naive())
    }

    /// Provider publication delay for bars of this exchange.
    pub fn data_delay(&self, exchange: &str) -> Result<Duration> {
        self.source.data_delay(exchange)
    }

    pub fn session_times(&self, exchange: &str, date: NaiveDate) -> Result<Option<SessionTimes>> {
        self.source.session_times(exchange, date)
    }

    pub fn is_trading_day(&self, exchange: &str, date: NaiveDate) -> Result<bool> {
        Ok(self.session_times(exchange, date)?.is_some())
    }

    /// Session kind at `instant`.
    pub fn session_at(&self, exchange: &str, instant: DateTime<Utc>) -> Result<SessionKind> {
        let date = self.local_date(exchange, instant)?;
        Ok(match self.session_times(exchange, date)? {
            Some(times) => times.kind_at(instant),
            None => SessionKind::Closed,
        })
    }

    /// The regular-trading segment containing `instant`, if trading is live.
    pub fn current_segment(
        &self,
        exchange: &str,
        instant: DateTime<Utc>,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let date = self.local_date(exchange, instant)?;
        Ok(self.session_times(exchange, date)?.and_then(|times| {
            times
                .regular_segments()
                .into_iter()
                .find(|(start, end)| instant >= *start && instant < *end)
        }))
    }

    /// Nearest instant strictly after (forward) or strictly before (backward)
    /// `instant` at which the session kind changes.
    pub fn next_session_boundary(
        &self,
        exchange: &str,
        instant: DateTime<Utc>,
        direction: Direction,
    ) -> Result<DateTime<Utc>> {
        let start = self.local_date(exchange, instant)?;
        for offset in 0..=MAX_SCAN_DAYS {
            let date = match direction {
                Direction::Forward => start + Duration::days(offset),
                Direction::Backward => start - Duration::days(offset),
            };
            let Some(times) = self.session_times(exchange, date)? else {
                continue;
            };
            let boundaries = times.boundaries();
            let found = match direction {
                Direction::Forward => boundaries.into_iter().find(|b| *b > instant),
                Direction::Backward => boundaries.into_iter().rev().find(|b| *b < instant),
            };
            if let Some(boundary) = found {
                return Ok(boundary);
            }
        }
        Err(no_trading_within(exchange, start))
    }

    /// Closest trading date strictly before `date`.
    pub fn previous_trading_day(&self, exchange: &str, date: NaiveDate) -> Result<NaiveDate> {
        for offset in 1..=MAX_SCAN_DAYS {
            let candidate = date - Duration::days(offset);
            if self.is_trading_day(exchange, candidate)? {
                return Ok(candidate);
            }
        }
        Err(no_trading_within(exchange, date))
    }

    /// Closest trading date strictly after `date`.
    pub fn next_trading_day(&self, exchange: &str, date: NaiveDate) -> Result<NaiveDate> {
        for offset in 1..=MAX_SCAN_DAYS {
            let candidate = date + Duration::days(offset);
            if self.is_trading_day(exchange, candidate)? {
                return Ok(candidate);
            }
        }
        Err(no_trading_within(exchange, date))
    }

    /// Trading dates in `[start, end]`, ascending.
    pub fn trading_days(&self, exchange: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut days = Vec::new();
        let mut current = start;
        while current <= end {
            if self.is_trading_day(exchange, current)? {
                days.push(current);
            }
            match current.succ_opt() {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(days)
    }

    /// Latest trading date whose regular close, plus the provider delay, is at
    /// or before `instant`.
    pub fn last_completed_trading_day(
        &self,
        exchange: &str,
        instant: DateTime<Utc>,
    ) -> Result<NaiveDate> {
        let delay = self.data_delay(exchange)?;
        let start = self.local_date(exchange, instant)?;
        for offset in 0..=MAX_SCAN_DAYS {
            let date = start - Duration::days(offset);
            if let Some(times) = self.session_times(exchange, date)? {
                if times.close + delay <= instant {
                    return Ok(date);
                }
            }
        }
        Err(no_trading_within(exchange, start))
    }

    /// End of the most recent regular segment at or before `instant`.
    ///
    /// The start of a lunch break counts as a segment end.
    pub fn last_regular_close(&self, exchange: &str, instant: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let start = self.local_date(exchange, instant)?;
        for offset in 0..=MAX_SCAN_DAYS {
            let date = start - Duration::days(offset);
            let Some(times) = self.session_times(exchange, date)? else {
                continue;
            };
            let latest = times
                .regular_segments()
                .into_iter()
                .map(|(_, end)| end)
                .filter(|end| *end <= instant)
                .max();
            if let Some(end) = latest {
                return Ok(end);
            }
        }
        Err(no_trading_within(exchange, start))
    }

    /// Start of the exchange-local day `date`, as a UTC instant.
    pub fn start_of_day(&self, exchange: &str, date: NaiveDate) -> Result<DateTime<Utc>> {
        let tz = self.timezone(exchange)?;
        exchanges::local_instant(tz, date, 0, 0)
    }
}

fn no_trading_within(exchange: &str, date: NaiveDate) -> MarketDataError {
    MarketDataError::NoDataForRange(format!(
        "{} has no trading session within {} days of {} ({:?})",
        exchange,
        MAX_SCAN_DAYS,
        date,
        date.weekday()
    ))
}
