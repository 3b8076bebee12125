//! Market regime classification
//!
//! A pure function of the close history and the volatility index. The decision
//! table is evaluated top to bottom and the first match wins.

use statrs::statistics::Statistics;

use crate::config::RegimeThresholds;
use crate::Regime;

/// Samples per momentum window
pub const MOMENTUM_WINDOW: usize = 10;

/// History needed before anything other than `Unknown` is reported
pub const MIN_REGIME_SAMPLES: usize = 2 * MOMENTUM_WINDOW;

/// Mean of the last 10 closes relative to the mean of the 10 before them.
///
/// Returns `None` with fewer than 20 samples or a zero baseline.
pub fn momentum(closes: &[f64]) -> Option<f64> {
    if closes.len() < MIN_REGIME_SAMPLES {
        return None;
    }
    let n = closes.len();
    let recent = (&closes[n - MOMENTUM_WINDOW..]).mean();
    let previous = (&closes[n - 2 * MOMENTUM_WINDOW..n - MOMENTUM_WINDOW]).mean();
    if previous == 0.0 {
        return None;
    }
    Some((recent - previous) / previous)
}

/// Classify the market from closes and the current volatility index
pub fn classify(closes: &[f64], volatility: f64, thresholds: &RegimeThresholds) -> Regime {
    let Some(momentum) = momentum(closes) else {
        return Regime::Unknown;
    };

    let calm = volatility < thresholds.volatility_threshold;

    if momentum > thresholds.bull_threshold && calm {
        Regime::Bull
    } else if momentum < thresholds.bear_threshold && calm {
        Regime::Bear
    } else if volatility > thresholds.volatility_threshold {
        Regime::Volatile
    } else {
        Regime::Sideways
    }
}
