//! Upstream provider trait definitions.
//!
//! This module defines the `FetchProvider` trait that the cache calls to
//! fill or extend its entries.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::errors::MarketDataError;
use crate::models::{
    CorporateActions, FinancialStatement, Interval, OptionChain, PriceBar, ReportingPeriod,
    StatementKind, Symbol,
};

use super::capabilities::{ProviderCapabilities, RateLimit};

/// Trait for the upstream financial-data provider.
///
/// Implementations talk to the real service. Every method may fail with
/// [`MarketDataError::SymbolNotFound`], [`MarketDataError::RateLimited`] or
/// [`MarketDataError::Transport`]; the cache decides whether to retry based
/// on [`MarketDataError::retry_class`].
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use quotevault_market_data::provider::{FetchProvider, RateLimit};
///
/// struct MyProvider {
///     api_key: String,
/// }
///
/// #[async_trait]
/// impl FetchProvider for MyProvider {
///     fn id(&self) -> &'static str {
///         "MY_PROVIDER"
///     }
///
///     fn rate_limit(&self) -> RateLimit {
///         RateLimit::default()
///     }
///
///     // ... implement fetch methods
/// }
/// ```
#[async_trait]
pub trait FetchProvider: Send + Sync {
    /// Unique identifier for this provider.
    ///
    /// Should be a constant string like "YAHOO". Used for logging, rate
    /// limiter buckets and entry provenance.
    fn id(&self) -> &'static str;

    /// Describes which datasets this provider can serve.
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    /// Rate limiting configuration advertised by the provider.
    ///
    /// The cache configuration may tighten this further.
    fn rate_limit(&self) -> RateLimit {
        RateLimit::default()
    }

    /// Resolve a bare ticker to its home exchange.
    ///
    /// Default implementation returns `NotSupported`; callers then have to
    /// supply the exchange themselves.
    async fn resolve_symbol(&self, ticker: &str) -> Result<Symbol, MarketDataError> {
        let _ = ticker;
        Err(MarketDataError::NotSupported(format!(
            "{}: symbol resolution",
            self.id()
        )))
    }

    /// Fetch bars for `symbol` with bar starts in `[start, end)`.
    ///
    /// Bars must be ordered by timestamp ascending.
    async fn fetch_prices(
        &self,
        symbol: &Symbol,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<Vec<PriceBar>, MarketDataError>;

    /// Fetch every published statement of one kind and period.
    async fn fetch_financials(
        &self,
        symbol: &Symbol,
        statement: StatementKind,
        period: ReportingPeriod,
    ) -> Result<Vec<FinancialStatement>, MarketDataError>;

    /// Fetch the option chain for one expiry.
    async fn fetch_option_chain(
        &self,
        symbol: &Symbol,
        expiry: NaiveDate,
    ) -> Result<OptionChain, MarketDataError>;

    /// Fetch dividends and splits with ex-dates in `[start, end]`.
    async fn fetch_corporate_actions(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CorporateActions, MarketDataError>;
}
