use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A cash dividend keyed by its ex-date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dividend {
    pub ex_date: NaiveDate,
    /// Amount per share in the listing currency
    pub amount: Decimal,
}

/// A stock split keyed by its ex-date.
///
/// A 4-for-1 split has `numerator = 4`, `denominator = 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub ex_date: NaiveDate,
    pub numerator: Decimal,
    pub denominator: Decimal,
}

impl Split {
    /// Shares held after the split for each share held before.
    pub fn ratio(&self) -> Option<Decimal> {
        if self.denominator.is_zero() {
            None
        } else {
            Some(self.numerator / self.denominator)
        }
    }
}

/// Corporate actions returned by one upstream call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorporateActions {
    pub dividends: Vec<Dividend>,
    pub splits: Vec<Split>,
}
