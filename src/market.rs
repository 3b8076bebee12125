//! Market observation
//!
//! Keeps a bounded candle history per symbol and derives ATR and a volatility
//! index from it. Nothing here is persisted; the history is rebuilt from the
//! exchange after a restart.

use std::collections::VecDeque;

use statrs::statistics::Statistics;
use tracing::debug;

use crate::indicators::{atr, fractional_changes};
use crate::{Candle, Regime};

/// Default ring-buffer capacity
pub const HISTORY_CAPACITY: usize = 200;

/// Minimum fractional changes before the volatility index updates
pub const MIN_VOLATILITY_SAMPLES: usize = 10;

/// Bounded price history with derived volatility measures
#[derive(Debug, Clone)]
pub struct MarketObservation {
    candles: VecDeque<Candle>,
    capacity: usize,
    atr_period: usize,
    volatility_window: usize,
    volatility_index: f64,
    regime: Regime,
}

impl MarketObservation {
    pub fn new(atr_period: usize, volatility_window: usize) -> Self {
        Self::with_capacity(HISTORY_CAPACITY, atr_period, volatility_window)
    }

    pub fn with_capacity(capacity: usize, atr_period: usize, volatility_window: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            atr_period,
            volatility_window,
            volatility_index: 0.0,
            regime: Regime::Unknown,
        }
    }

    /// Append a candle, evicting the oldest when full.
    ///
    /// A candle whose timestamp equals the newest one replaces it (the exchange
    /// keeps updating the in-progress bar); older candles are ignored.
    pub fn ingest(&mut self, candle: Candle) {
        if !candle.is_valid() {
            debug!(datetime = %candle.datetime, "Skipping invalid candle");
            return;
        }

        match self.candles.back() {
            Some(last) if candle.datetime < last.datetime => return,
            Some(last) if candle.datetime == last.datetime => {
                self.candles.pop_back();
            }
            _ => {}
        }

        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        self.refresh_volatility();
    }

    /// Ingest a batch ordered oldest to newest
    pub fn ingest_all(&mut self, candles: impl IntoIterator<Item = Candle>) {
        for candle in candles {
            self.ingest(candle);
        }
    }

    /// ATR over the configured period, `None` while history is too short
    pub fn atr(&self) -> Option<f64> {
        let (front, back) = self.candles.as_slices();
        if front.is_empty() {
            return atr(back, self.atr_period);
        }
        if back.is_empty() {
            return atr(front, self.atr_period);
        }
        let contiguous: Vec<Candle> = self.candles.iter().cloned().collect();
        atr(&contiguous, self.atr_period)
    }

    /// Root-mean-square of recent fractional close changes
    pub fn volatility_index(&self) -> f64 {
        self.volatility_index
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    pub fn set_regime(&mut self, regime: Regime) {
        self.regime = regime;
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.candles.back().map(|c| c.close)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Change the ATR period and volatility window after a reconfiguration
    pub fn reconfigure(&mut self, atr_period: usize, volatility_window: usize) {
        self.atr_period = atr_period;
        self.volatility_window = volatility_window;
        self.refresh_volatility();
    }

    fn refresh_volatility(&mut self) {
        let take = self.volatility_window + 1;
        let skip = self.candles.len().saturating_sub(take);
        let recent: Vec<f64> = self.candles.iter().skip(skip).map(|c| c.close).collect();
        let changes = fractional_changes(&recent);

        // Keep the previous reading until enough samples exist.
        if changes.len() < MIN_VOLATILITY_SAMPLES {
            return;
        }
        self.volatility_index = changes.quadratic_mean();
    }
}
