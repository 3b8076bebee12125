//! Technical indicators
//!
//! True range and ATR are computed directly; EMA, RSI and MACD are thin
//! wrappers around the `ta` crate. Every function returns `None` when the
//! input is too short to produce a value from a full window.

use itertools::Itertools;
use ta::indicators::{
    ExponentialMovingAverage, MovingAverageConvergenceDivergence, RelativeStrengthIndex,
};
use ta::Next;

use crate::Candle;

/// True range of `bar` given the previous close
pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    let hl = high - low;
    let hc = (high - prev_close).abs();
    let lc = (low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Average True Range over the last `period` bars.
///
/// Needs `period + 1` candles so every true range in the window has a
/// previous close. Returns `None` otherwise.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let window = &candles[candles.len() - (period + 1)..];
    let sum: f64 = window
        .iter()
        .tuple_windows()
        .map(|(prev, bar)| true_range(bar.high, bar.low, prev.close))
        .sum();

    Some(sum / period as f64)
}

/// Fractional change between consecutive values: `(b - a) / a`
pub fn fractional_changes(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .tuple_windows()
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, b)| (b - a) / a)
        .collect()
}

/// Latest Exponential Moving Average value
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mut indicator = ExponentialMovingAverage::new(period).ok()?;
    values.iter().map(|&v| indicator.next(v)).last()
}

/// Latest RSI value
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() <= period {
        return None;
    }
    let mut indicator = RelativeStrengthIndex::new(period).ok()?;
    values.iter().map(|&v| indicator.next(v)).last()
}

/// Latest MACD reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdReading {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Latest MACD line, signal line and histogram
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdReading> {
    if fast == 0 || signal == 0 || slow <= fast || values.len() < slow + signal {
        return None;
    }
    let mut indicator = MovingAverageConvergenceDivergence::new(fast, slow, signal).ok()?;
    values
        .iter()
        .map(|&v| indicator.next(v))
        .last()
        .map(|out| MacdReading {
            macd: out.macd,
            signal: out.signal,
            histogram: out.histogram,
        })
}

/// Last volume divided by the mean of the `period` volumes before it
pub fn volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period + 1 {
        return None;
    }
    let (last, history) = volumes.split_last()?;
    let window = &history[history.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    if mean <= 0.0 {
        return None;
    }
    Some(last / mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

    fn bars(rows: &[(f64, f64, f64)]) -> Vec<Candle> {
        let start = Utc::now();
        rows.iter()
            .enumerate()
            .map(|(i, &(high, low, close))| Candle {
                datetime: start + Duration::minutes(i as i64),
                open: close,
                high,
                low,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        assert_eq!(true_range(12.0, 10.0, 11.0), 2.0);
        assert_eq!(true_range(12.0, 10.0, 15.0), 5.0);
        assert_eq!(true_range(12.0, 10.0, 6.0), 6.0);
    }

    #[test]
    fn test_atr_requires_period_plus_one_bars() {
        let candles = bars(&[(11.0, 9.0, 10.0), (12.0, 10.0, 11.0), (13.0, 11.0, 12.0)]);
        assert_eq!(atr(&candles, 3), None);
        assert_eq!(atr(&candles[..2], 2), None);
        assert!(atr(&candles, 2).is_some());
    }

    #[test]
    fn test_atr_is_mean_of_last_period_ranges() {
        let candles = bars(&[
            (11.0, 9.0, 10.0),
            (12.0, 10.0, 11.0), // TR 2
            (15.0, 11.0, 14.0), // TR 4
            (14.5, 13.5, 14.0), // TR 1
        ]);
        assert_relative_eq!(atr(&candles, 3).unwrap(), 7.0 / 3.0);
        assert_relative_eq!(atr(&candles, 2).unwrap(), 2.5);
    }

    #[test]
    fn test_fractional_changes() {
        let changes = fractional_changes(&[100.0, 110.0, 99.0]);
        assert_eq!(changes.len(), 2);
        assert_relative_eq!(changes[0], 0.1);
        assert_relative_eq!(changes[1], -0.1);
    }

    #[test]
    fn test_ema_and_rsi_need_full_window() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert!(ema(&values, 11).is_none());
        assert!(ema(&values, 5).is_some());
        assert!(rsi(&values, 10).is_none());
        assert!(rsi(&values, 5).unwrap() > 50.0);
    }

    #[test]
    fn test_macd_positive_on_uptrend() {
        let values: Vec<f64> = (0..60).map(|v| 100.0 + v as f64).collect();
        let reading = macd(&values, 12, 26, 9).unwrap();
        assert!(reading.macd > 0.0);
    }

    #[test]
    fn test_volume_ratio() {
        let volumes = [10.0, 10.0, 10.0, 20.0];
        assert_relative_eq!(volume_ratio(&volumes, 3).unwrap(), 2.0);
        assert!(volume_ratio(&volumes, 4).is_none());
    }
}
