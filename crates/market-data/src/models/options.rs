use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionRight {
    Call,
    Put,
}

/// A single listed contract in a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionContract {
    pub contract_symbol: String,
    pub right: OptionRight,
    pub strike: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_volatility: Option<Decimal>,
    pub open_interest: u64,
    pub volume: u64,
}

/// Calls and puts for one expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionChain {
    pub expiry: NaiveDate,
    pub contracts: Vec<OptionContract>,
}

impl OptionChain {
    pub fn calls(&self) -> impl Iterator<Item = &OptionContract> {
        self.contracts
            .iter()
            .filter(|c| c.right == OptionRight::Call)
    }

    pub fn puts(&self) -> impl Iterator<Item = &OptionContract> {
        self.contracts.iter().filter(|c| c.right == OptionRight::Put)
    }
}
