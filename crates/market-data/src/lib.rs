//! QuoteVault Market Data Crate
//!
//! This crate holds the upstream-facing vocabulary of the QuoteVault cache:
//! what the provider returns, when exchanges trade, and how hard the provider
//! may be called. It has no persistence of its own.
//!
//! # Overview
//!
//! - Dataset models: price bars, dividends and splits, financial statements,
//!   option chains
//! - Exchange calendar: sessions, lunch breaks, holidays, provider data delay
//! - The `FetchProvider` trait implemented by the network client
//! - Token-bucket rate limiting and bar validation
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |   Cache core     | --> |    Calendar      |  (session arithmetic)
//! +------------------+     +------------------+
//!          |                        |
//!          v                        v
//! +------------------+     +------------------+
//! |   RateLimiter    |     |  CalendarSource  |  (holidays, session times)
//! +------------------+     +------------------+
//!          |
//!          v
//! +------------------+
//! |  FetchProvider   |  (external network client)
//! +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`Symbol`] - Ticker plus home exchange
//! - [`Interval`] - Bar interval
//! - [`PriceBar`] - OHLCV bar
//! - [`Calendar`] - Exchange session lookups
//!
//! # Type Aliases
//!
//! - [`ProviderId`] - Provider identifier (e.g., "YAHOO")
//! - [`Mic`] - Market Identifier Code (ISO 10383)
//! - [`ExchangeCode`] - Provider exchange code (e.g., "NMS")

pub mod calendar;
pub mod errors;
pub mod models;
pub mod provider;
pub mod registry;

// Re-export all public types from models
pub use models::{
    CorporateActions, Currency, Dividend, ExchangeCode, FinancialStatement, Interval, Mic,
    OptionChain, OptionContract, OptionRight, PriceBar, ProviderId, ReportingPeriod, Split,
    StatementKind, Symbol,
};

// Re-export calendar types
pub use calendar::{
    BreakWindow, Calendar, CalendarSource, Direction, SessionKind, SessionTimes,
    StaticCalendarSource,
};

// Re-export provider types
pub use errors::{MarketDataError, RetryClass};
pub use provider::{FetchProvider, ProviderCapabilities, RateLimit};

// Re-export registry types
pub use registry::{BarValidator, RateLimitConfig, RateLimiter};
