//! Entry and DCA signals
//!
//! Simple threshold heuristics; the thresholds are configuration defaults,
//! not tuned parameters.

use crate::config::{DcaConfig, SignalConfig};
use crate::indicators::{ema, macd, rsi, volume_ratio};
use crate::{Position, PositionSide, Regime};

/// Indicator readings behind an entry decision, kept for logging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryContext {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub macd_histogram: f64,
    pub volume_ratio: f64,
}

/// Direction to open, if the trend filters agree and volume confirms
pub fn entry_signal(
    closes: &[f64],
    volumes: &[f64],
    regime: Regime,
    config: &SignalConfig,
) -> Option<(PositionSide, EntryContext)> {
    let ctx = EntryContext {
        ema_fast: ema(closes, config.ema_fast)?,
        ema_slow: ema(closes, config.ema_slow)?,
        rsi: rsi(closes, config.rsi_period)?,
        macd_histogram: macd(closes, config.macd_fast, config.macd_slow, config.macd_signal)?
            .histogram,
        volume_ratio: volume_ratio(volumes, config.volume_period)?,
    };

    if ctx.volume_ratio < config.volume_factor {
        return None;
    }

    let trend = if ctx.ema_fast > ctx.ema_slow && ctx.macd_histogram > 0.0 {
        PositionSide::Long
    } else if ctx.ema_fast < ctx.ema_slow && ctx.macd_histogram < 0.0 {
        PositionSide::Short
    } else {
        return None;
    };

    let allowed = match (regime, trend) {
        (Regime::Volatile | Regime::Unknown, _) => false,
        (Regime::Bull, PositionSide::Short) | (Regime::Bear, PositionSide::Long) => false,
        (_, PositionSide::Short) => config.allow_short,
        (_, PositionSide::Long) => true,
    };
    if !allowed {
        return None;
    }

    let rsi_ok = match trend {
        PositionSide::Long => ctx.rsi < config.rsi_long_max,
        PositionSide::Short => ctx.rsi > config.rsi_short_min,
    };
    rsi_ok.then_some((trend, ctx))
}

/// Size of the next averaging add for `main`, if one is due at `price`
pub fn dca_size(main: &Position, price: f64, regime: Regime, config: &DcaConfig) -> Option<f64> {
    if !config.enabled || main.dca_count >= config.max_count {
        return None;
    }

    let favourable = matches!(
        (regime, main.side),
        (Regime::Sideways, _) | (Regime::Bull, PositionSide::Long) | (Regime::Bear, PositionSide::Short)
    );
    if !favourable {
        return None;
    }

    let next_step = config.trigger_percent * (main.dca_count + 1) as f64;
    if main.profit_percent(price) > -next_step {
        return None;
    }

    Some(main.size * config.size_fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn uptrend(len: usize) -> (Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = (0..len)
            .map(|i| 100.0 + 0.01 * (i * i) as f64)
            .collect();
        let mut volumes = vec![100.0; len];
        volumes[len - 1] = 200.0;
        (closes, volumes)
    }

    fn main_long(entry: f64) -> Position {
        Position {
            id: "main-1".to_string(),
            side: PositionSide::Long,
            entry_price: entry,
            size: 1.0,
            opened_at: Utc::now(),
            stop_loss: None,
            take_profit_percent: None,
            order_id: None,
            protects: None,
            dca_count: 0,
        }
    }

    #[test]
    fn test_no_signal_with_short_history() {
        let (closes, volumes) = uptrend(10);
        assert!(entry_signal(&closes, &volumes, Regime::Bull, &SignalConfig::default()).is_none());
    }

    #[test]
    fn test_long_signal_on_confirmed_uptrend() {
        let (closes, volumes) = uptrend(80);
        let config = SignalConfig {
            rsi_long_max: 101.0,
            ..Default::default()
        };
        let (side, ctx) = entry_signal(&closes, &volumes, Regime::Sideways, &config).unwrap();
        assert_eq!(side, PositionSide::Long);
        assert!(ctx.ema_fast > ctx.ema_slow);
    }

    #[test]
    fn test_volume_must_confirm() {
        let (closes, mut volumes) = uptrend(80);
        *volumes.last_mut().unwrap() = 100.0;
        let config = SignalConfig {
            rsi_long_max: 101.0,
            ..Default::default()
        };
        assert!(entry_signal(&closes, &volumes, Regime::Sideways, &config).is_none());
    }

    #[test]
    fn test_regime_gates_direction() {
        let (closes, volumes) = uptrend(80);
        let config = SignalConfig {
            rsi_long_max: 101.0,
            ..Default::default()
        };
        assert!(entry_signal(&closes, &volumes, Regime::Bear, &config).is_none());
        assert!(entry_signal(&closes, &volumes, Regime::Volatile, &config).is_none());
        assert!(entry_signal(&closes, &volumes, Regime::Unknown, &config).is_none());
    }

    #[test]
    fn test_dca_steps() {
        let config = DcaConfig {
            enabled: true,
            trigger_percent: 3.0,
            size_fraction: 0.5,
            max_count: 2,
        };
        let mut main = main_long(100.0);

        assert_eq!(dca_size(&main, 98.0, Regime::Sideways, &config), None);
        assert_eq!(dca_size(&main, 97.0, Regime::Sideways, &config), Some(0.5));
        assert_eq!(dca_size(&main, 97.0, Regime::Bear, &config), None);

        main.dca_count = 1;
        assert_eq!(dca_size(&main, 97.0, Regime::Sideways, &config), None);
        assert_eq!(dca_size(&main, 94.0, Regime::Sideways, &config), Some(0.5));

        main.dca_count = 2;
        assert_eq!(dca_size(&main, 80.0, Regime::Sideways, &config), None);
    }

    #[test]
    fn test_dca_disabled_by_default() {
        let main = main_long(100.0);
        assert_eq!(dca_size(&main, 50.0, Regime::Sideways, &DcaConfig::default()), None);
    }
}
