use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV bar as returned by the provider.
///
/// `timestamp` is the start of the bar interval. Daily bars start at the
/// session open in exchange-local time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Start of the bar interval
    pub timestamp: DateTime<Utc>,

    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,

    /// Close adjusted for dividends and splits, when the provider supplies it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adj_close: Option<Decimal>,

    pub volume: Decimal,
}

impl PriceBar {
    /// Create a full OHLCV bar
    pub fn ohlcv(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            adj_close: None,
            volume,
        }
    }

    /// The trading date this bar belongs to, in the exchange timezone.
    pub fn session_date(&self, tz: Tz) -> NaiveDate {
        self.timestamp.with_timezone(&tz).date_naive()
    }
}
