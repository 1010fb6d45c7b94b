//! Price bar validation.
//!
//! Validates bars from the provider, and bars read back from the cache,
//! to ensure data quality:
//! - OHLC invariants (high >= low, open/close between high/low)
//! - Non-negative values
//! - Strictly ascending timestamps within a series

use log::warn;
use rust_decimal::Decimal;

use crate::errors::MarketDataError;
use crate::models::PriceBar;

/// Validation severity levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationSeverity {
    /// Hard failure - reject the bar.
    Hard,
    /// Soft warning - accept the bar but log a warning.
    Soft,
}

/// Validation result details.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: ValidationSeverity,
    /// Description of the issue.
    pub message: String,
}

/// Bar validator configuration.
#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Whether to reject bars with negative prices.
    pub reject_negative_prices: bool,
    /// Whether to reject bars where high < low.
    pub reject_invalid_ohlc: bool,
    /// Whether to warn on zero volume.
    pub warn_on_zero_volume: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            reject_negative_prices: true,
            reject_invalid_ohlc: true,
            warn_on_zero_volume: false,
        }
    }
}

/// Price bar validator.
///
/// Configuration allows for different validation strictness levels.
#[derive(Clone, Debug, Default)]
pub struct BarValidator {
    config: ValidatorConfig,
}

impl BarValidator {
    /// Create a new validator with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a validator with custom configuration.
    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Collect every issue with a bar, without logging.
    pub fn check(&self, bar: &PriceBar) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.validate_ohlc_invariants(bar, &mut issues);
        self.validate_volume(bar, &mut issues);
        issues
    }

    /// Validate a bar.
    ///
    /// Returns Ok(()) if the bar is valid, or Err with details if invalid.
    /// Warnings are logged but do not cause rejection.
    pub fn validate(&self, bar: &PriceBar) -> Result<(), MarketDataError> {
        let issues = self.check(bar);
        hard_failures(&issues)?;

        for issue in issues.iter().filter(|i| i.severity == ValidationSeverity::Soft) {
            warn!("Bar validation warning for {:?}: {}", bar.timestamp, issue.message);
        }

        Ok(())
    }

    /// Validate all bars in a batch.
    ///
    /// Returns a tuple of (valid_bars, invalid_bars_with_errors).
    pub fn validate_batch(
        &self,
        bars: Vec<PriceBar>,
    ) -> (Vec<PriceBar>, Vec<(PriceBar, MarketDataError)>) {
        let mut valid = Vec::with_capacity(bars.len());
        let mut invalid = Vec::new();

        for bar in bars {
            match self.validate(&bar) {
                Ok(()) => valid.push(bar),
                Err(e) => invalid.push((bar, e)),
            }
        }

        (valid, invalid)
    }

    /// Checks a stored series: every bar passes hard validation and the
    /// timestamps strictly ascend. Nothing is logged.
    pub fn check_series(&self, bars: &[PriceBar]) -> Result<(), MarketDataError> {
        for bar in bars {
            hard_failures(&self.check(bar))?;
        }
        if let Some(pair) = bars.windows(2).find(|w| w[0].timestamp >= w[1].timestamp) {
            return Err(MarketDataError::ValidationFailed {
                message: format!(
                    "Bars out of order: {} then {}",
                    pair[0].timestamp, pair[1].timestamp
                ),
            });
        }
        Ok(())
    }

    /// Validate OHLC invariants.
    ///
    /// - High must be >= Low
    /// - Open must be between Low and High
    /// - Close must be between Low and High
    fn validate_ohlc_invariants(&self, bar: &PriceBar, issues: &mut Vec<ValidationIssue>) {
        let PriceBar {
            open,
            high,
            low,
            close,
            ..
        } = *bar;

        if self.config.reject_invalid_ohlc && high < low {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Hard,
                message: format!("High ({}) is less than Low ({})", high, low),
            });
        }

        if self.config.reject_invalid_ohlc && (open < low || open > high) {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Soft,
                message: format!("Open ({}) is outside High/Low range ({}-{})", open, low, high),
            });
        }

        if self.config.reject_invalid_ohlc && (close < low || close > high) {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Soft,
                message: format!("Close ({}) is outside High/Low range ({}-{})", close, low, high),
            });
        }

        if self.config.reject_negative_prices {
            for (name, value) in [("open", open), ("high", high), ("low", low), ("close", close)] {
                if value < Decimal::ZERO {
                    issues.push(ValidationIssue {
                        severity: ValidationSeverity::Hard,
                        message: format!("Negative {} price: {}", name, value),
                    });
                }
            }
        }
    }

    /// Validate volume data.
    fn validate_volume(&self, bar: &PriceBar, issues: &mut Vec<ValidationIssue>) {
        if bar.volume < Decimal::ZERO {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Hard,
                message: format!("Negative volume: {}", bar.volume),
            });
        }

        if self.config.warn_on_zero_volume && bar.volume == Decimal::ZERO {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Soft,
                message: "Zero volume".to_string(),
            });
        }
    }
}

fn hard_failures(issues: &[ValidationIssue]) -> Result<(), MarketDataError> {
    let errors: Vec<_> = issues
        .iter()
        .filter(|i| i.severity == ValidationSeverity::Hard)
        .map(|i| i.message.as_str())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(MarketDataError::ValidationFailed {
            message: errors.join("; "),
        })
    }
}
