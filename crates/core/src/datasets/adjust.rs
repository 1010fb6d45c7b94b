//! Split and dividend back-adjustment of cached bars.
//!
//! Bars are stored as the provider returned them. Adjustment happens on the
//! way out, from the cached corporate actions, so a newly cached split or
//! dividend re-adjusts every earlier bar without touching the store.

use chrono_tz::Tz;
use log::{debug, warn};
use quotevault_market_data::{Dividend, PriceBar, Split};
use rust_decimal::Decimal;

/// Which corporate actions to fold into served prices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Adjustment {
    /// Scale prices and volume so they are comparable across splits.
    pub splits: bool,
    /// Scale prices down by each later dividend. When off, the
    /// dividend-adjusted close is still reported in `adj_close`.
    pub dividends: bool,
}

impl Adjustment {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            splits: true,
            dividends: true,
        }
    }
}

/// Cumulative split factor for each bar: the product of `1 / ratio` over
/// every split with an ex-date after the bar's session.
fn split_factors(bars: &[PriceBar], splits: &[Split], tz: Tz) -> Vec<Decimal> {
    bars.iter()
        .map(|bar| {
            let session = bar.session_date(tz);
            splits
                .iter()
                .filter(|split| split.ex_date > session)
                .filter_map(|split| match split.ratio() {
                    Some(ratio) if ratio > Decimal::ZERO => Some(Decimal::ONE / ratio),
                    _ => {
                        warn!("Ignoring split on {} with a zero ratio", split.ex_date);
                        None
                    }
                })
                .product()
        })
        .collect()
}

/// Cumulative dividend factor for each bar: the product of
/// `1 - amount / close` over every later dividend, where `close` is the
/// last close before that ex-date. Dividends without a cached close before
/// them, or at least as large as it, are skipped.
fn dividend_factors(bars: &[PriceBar], dividends: &[Dividend], tz: Tz) -> Vec<Decimal> {
    let sessions: Vec<_> = bars.iter().map(|bar| bar.session_date(tz)).collect();
    let mut factors = vec![Decimal::ONE; bars.len()];
    for dividend in dividends {
        let before = sessions.partition_point(|session| *session < dividend.ex_date);
        let Some(prior) = before.checked_sub(1) else {
            debug!("No cached close before the {} ex-date", dividend.ex_date);
            continue;
        };
        let close = bars[prior].close;
        if close <= dividend.amount || close.is_zero() {
            warn!(
                "Dividend of {} on {} is not below the prior close {}; ignored",
                dividend.amount, dividend.ex_date, close
            );
            continue;
        }
        let factor = Decimal::ONE - dividend.amount / close;
        for f in &mut factors[..before] {
            *f *= factor;
        }
    }
    factors
}

/// `bars`, sorted by time, back-adjusted for the given corporate actions.
pub fn adjust_bars(
    bars: &[PriceBar],
    splits: &[Split],
    dividends: &[Dividend],
    tz: Tz,
    adjustment: Adjustment,
) -> Vec<PriceBar> {
    if adjustment == Adjustment::none() && dividends.is_empty() {
        return bars.to_vec();
    }
    let split = if adjustment.splits {
        split_factors(bars, splits, tz)
    } else {
        vec![Decimal::ONE; bars.len()]
    };
    let dividend = dividend_factors(bars, dividends, tz);

    bars.iter()
        .zip(split.iter().zip(&dividend))
        .map(|(bar, (csf, cdf))| {
            let price = if adjustment.dividends { csf * cdf } else { *csf };
            let volume = if csf.is_zero() { bar.volume } else { bar.volume / csf };
            PriceBar {
                timestamp: bar.timestamp,
                open: bar.open * price,
                high: bar.high * price,
                low: bar.low * price,
                close: bar.close * price,
                adj_close: if adjustment.dividends {
                    None
                } else {
                    Some(bar.close * csf * cdf)
                },
                volume: volume.round(),
            }
        })
        .collect()
}
