//! Market data models
//!
//! This module contains the data types exchanged with the upstream provider:
//! - `types` - Type aliases for common identifiers (ProviderId, Mic, Currency, ExchangeCode)
//! - `interval` - Bar intervals (Interval)
//! - `symbol` - Ticker plus home exchange (Symbol)
//! - `price` - OHLCV bars (PriceBar)
//! - `corporate_action` - Dividends and splits
//! - `financials` - Financial statements (FinancialStatement, StatementKind, ReportingPeriod)
//! - `options` - Option chains (OptionChain, OptionContract, OptionRight)

mod corporate_action;
mod financials;
mod interval;
mod options;
mod price;
mod symbol;
mod types;

pub use corporate_action::{CorporateActions, Dividend, Split};
pub use financials::{FinancialStatement, ReportingPeriod, StatementKind};
pub use interval::Interval;
pub use options::{OptionChain, OptionContract, OptionRight};
pub use price::PriceBar;
pub use symbol::Symbol;
pub use types::{Currency, ExchangeCode, Mic, ProviderId};
