use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::ExchangeCode;

/// A ticker together with its home exchange.
///
/// Resolved once from the provider and immutable afterwards; the exchange
/// code selects the trading calendar and timezone used for freshness checks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    /// Provider ticker (e.g. "AAPL", "BP.L")
    pub ticker: String,
    /// Provider exchange code (e.g. "NMS", "LSE")
    pub exchange: ExchangeCode,
}

impl Symbol {
    pub fn new(ticker: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            exchange: exchange.into(),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.ticker)
    }
}
