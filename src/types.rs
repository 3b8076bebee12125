//! Core data types used across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Flat candle from a single trade price, used by price-only feeds
    pub fn from_price(datetime: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            datetime,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into alerts, orders, trade records and log lines on
/// every tick, so the backing string is shared rather than copied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a held position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The opposite direction; a hedge is always opened on this side
    pub fn inverse(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that opens (or adds to) a position in this direction
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_order_side(self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    /// Signed profit percent of a move from `entry` to `price`.
    ///
    /// `(price - entry) / entry * 100` for long, inverted for short.
    pub fn profit_percent(self, entry: f64, price: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        let raw = (price - entry) / entry * 100.0;
        match self {
            PositionSide::Long => raw,
            PositionSide::Short => -raw,
        }
    }

    /// Price at which a position entered at `entry` shows `percent` profit
    pub fn price_at_profit(self, entry: f64, percent: f64) -> f64 {
        match self {
            PositionSide::Long => entry * (1.0 + percent / 100.0),
            PositionSide::Short => entry * (1.0 - percent / 100.0),
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Exchange order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

/// Exchange order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "Market"),
            OrderType::Limit => write!(f, "Limit"),
        }
    }
}

/// Coarse market-behaviour classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    Volatile,
    #[default]
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Regime::Bull => "BULL",
            Regime::Bear => "BEAR",
            Regime::Sideways => "SIDEWAYS",
            Regime::Volatile => "VOLATILE",
            Regime::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Why a trade was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    HedgeStopLoss,
    MainClosed,
    GridTakeProfit,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::TakeProfit => "take-profit",
            CloseReason::StopLoss => "stop-loss",
            CloseReason::HedgeStopLoss => "hedge-stop-loss",
            CloseReason::MainClosed => "main closed",
            CloseReason::GridTakeProfit => "grid take-profit",
            CloseReason::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

/// An open main or hedge position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size: f64,
    pub opened_at: DateTime<Utc>,
    /// Protective stop; `None` until protection activates, never cleared after
    #[serde(default)]
    pub stop_loss: Option<f64>,
    /// Take-profit threshold in percent
    #[serde(default)]
    pub take_profit_percent: Option<f64>,
    #[serde(default)]
    pub order_id: Option<String>,
    /// Id of the main position this one hedges
    #[serde(default)]
    pub protects: Option<String>,
    #[serde(default)]
    pub dca_count: u32,
}

impl Position {
    pub fn profit_percent(&self, price: f64) -> f64 {
        self.side.profit_percent(self.entry_price, price)
    }

    /// Attach a stop-loss unless one is already set. Returns whether it changed.
    pub fn attach_stop(&mut self, stop: f64) -> bool {
        if self.stop_loss.is_some() {
            return false;
        }
        self.stop_loss = Some(stop);
        true
    }

    /// Whether `price` has crossed the attached stop against this position
    pub fn stop_crossed(&self, price: f64) -> bool {
        match (self.stop_loss, self.side) {
            (Some(stop), PositionSide::Long) => price <= stop,
            (Some(stop), PositionSide::Short) => price >= stop,
            (None, _) => false,
        }
    }
}

/// Which book a trade came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeLeg {
    Main,
    Hedge,
    Grid,
}

/// Completed trade; append-only, never mutated after it is recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub leg: TradeLeg,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub profit_percent: f64,
    pub reason: CloseReason,
}

impl TradeRecord {
    /// Record the close of `position` at `exit_price`
    pub fn from_close(
        symbol: &Symbol,
        leg: TradeLeg,
        position: &Position,
        exit_price: f64,
        closed_at: DateTime<Utc>,
        reason: CloseReason,
    ) -> Self {
        Self {
            symbol: symbol.clone(),
            leg,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            opened_at: position.opened_at,
            closed_at,
            profit_percent: position.profit_percent(exit_price),
            reason,
        }
    }

    pub fn is_win(&self) -> bool {
        self.profit_percent > 0.0
    }

    /// Traded notional over both legs of the round trip
    pub fn volume(&self) -> f64 {
        self.size * (self.entry_price + self.exit_price)
    }
}

/// Projection over the trade log; never the source of truth
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAggregate {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_profit_percent: f64,
    pub best_profit_percent: f64,
    pub worst_profit_percent: f64,
    pub total_volume: f64,
}

impl PerformanceAggregate {
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let total_trades = trades.len();
        let winning_trades = trades.iter().filter(|t| t.is_win()).count();
        let profit_sum: f64 = trades.iter().map(|t| t.profit_percent).sum();

        Self {
            total_trades,
            winning_trades,
            losing_trades: total_trades - winning_trades,
            win_rate: winning_trades as f64 / total_trades as f64 * 100.0,
            avg_profit_percent: profit_sum / total_trades as f64,
            best_profit_percent: trades
                .iter()
                .map(|t| t.profit_percent)
                .fold(f64::NEG_INFINITY, f64::max),
            worst_profit_percent: trades
                .iter()
                .map(|t| t.profit_percent)
                .fold(f64::INFINITY, f64::min),
            total_volume: trades.iter().map(TradeRecord::volume).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn long_at(entry: f64) -> Position {
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
    fn test_candle_validation() {
        let now = Utc::now();
        assert!(Candle::new(now, 10.0, 12.0, 9.0, 11.0, 5.0).is_ok());
        assert!(matches!(
            Candle::new(now, 10.0, 9.0, 12.0, 11.0, 5.0),
            Err(CandleValidationError::HighLessThanLow { .. })
        ));
        assert!(matches!(
            Candle::new(now, 10.0, 12.0, 9.0, 11.0, -1.0),
            Err(CandleValidationError::NegativeVolume(_))
        ));
        assert!(!Candle::from_price(now, 0.0, 1.0).is_valid());
    }

    #[test]
    fn test_profit_percent_sign_convention() {
        assert_relative_eq!(PositionSide::Long.profit_percent(100.0, 110.0), 10.0);
        assert_relative_eq!(PositionSide::Short.profit_percent(100.0, 110.0), -10.0);
        assert_relative_eq!(PositionSide::Short.profit_percent(92.0, 85.0), 7.608695652173913);
    }

    #[test]
    fn test_price_at_profit() {
        assert_relative_eq!(PositionSide::Long.price_at_profit(100.0, 5.0), 105.0);
        assert_relative_eq!(PositionSide::Short.price_at_profit(100.0, 5.0), 95.0);
    }

    #[test]
    fn test_stop_is_one_way() {
        let mut pos = long_at(100.0);
        assert!(pos.attach_stop(110.0));
        assert!(!pos.attach_stop(120.0));
        assert_eq!(pos.stop_loss, Some(110.0));
        assert!(pos.stop_crossed(109.0));
        assert!(!pos.stop_crossed(111.0));
    }

    #[test]
    fn test_performance_aggregate() {
        let symbol = Symbol::new("BTCUSDT");
        let pos = long_at(100.0);
        let now = Utc::now();
        let trades = vec![
            TradeRecord::from_close(&symbol, TradeLeg::Main, &pos, 110.0, now, CloseReason::TakeProfit),
            TradeRecord::from_close(&symbol, TradeLeg::Main, &pos, 95.0, now, CloseReason::StopLoss),
        ];

        let perf = PerformanceAggregate::from_trades(&trades);
        assert_eq!(perf.total_trades, 2);
        assert_eq!(perf.winning_trades, 1);
        assert_relative_eq!(perf.win_rate, 50.0);
        assert_relative_eq!(perf.avg_profit_percent, 2.5);
        assert_relative_eq!(perf.best_profit_percent, 10.0);
        assert_relative_eq!(perf.worst_profit_percent, -5.0);
        assert_relative_eq!(perf.total_volume, 210.0 + 195.0);
    }

    #[test]
    fn test_performance_aggregate_empty() {
        assert_eq!(PerformanceAggregate::from_trades(&[]), PerformanceAggregate::default());
    }
}
