//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials and notification tokens.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::Symbol;

/// Rejected configuration value
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub symbols: Vec<SymbolConfig>,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Credentials and tokens from the environment take precedence over the file
    pub fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var("BYBIT_API_KEY") {
            self.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BYBIT_API_SECRET") {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.notify.telegram_bot_token = Some(token);
        }
        if let Ok(chat_id) = std::env::var("TELEGRAM_CHAT_ID") {
            self.notify.telegram_chat_id = Some(chat_id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(invalid("symbols", "at least one symbol is required"));
        }
        if self.engine.tick_interval_secs == 0 {
            return Err(invalid("engine.tick_interval_secs", "must be > 0"));
        }
        for symbol in &self.symbols {
            symbol.validate()?;
        }
        Ok(())
    }

    pub fn symbol(&self, name: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| s.symbol == name)
    }
}

/// Where market data and fills come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Live,
    #[default]
    Simulated,
}

/// Engine-wide scheduling and storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_secs: u64,
    pub flush_interval_secs: u64,
    pub state_dir: String,
    pub data_source: DataSource,
    /// Candle interval passed to the exchange kline endpoint
    pub candle_interval: String,
    pub candle_limit: u32,
    /// Seed for the simulated price feed
    pub simulation_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tick_interval_secs: 30,
            flush_interval_secs: 300,
            state_dir: "state".to_string(),
            data_source: DataSource::Simulated,
            candle_interval: "5".to_string(),
            candle_limit: 100,
            simulation_seed: None,
        }
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    /// Product category (e.g. "linear", "spot")
    pub category: String,
    pub recv_window_ms: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub rate_limit: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://api.bybit.com".to_string(),
            category: "linear".to_string(),
            recv_window_ms: 5000,
            timeout_ms: 5000,
            max_retries: 2,
            rate_limit: 10,
        }
    }
}

/// Alert delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            telegram_bot_token: None,
            telegram_chat_id: None,
            queue_capacity: 256,
        }
    }
}

/// What the engine runs for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPolicy {
    /// Grid orders only, no directional position
    GridOnly,
    /// Grid (unless disabled) plus a directional main position with hedge protection
    #[default]
    GridWithHedge,
}

/// How grid levels are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridPolicy {
    /// Static spacing around an anchor that trails the price
    Anchored,
    /// ATR-derived spacing scaled by regime
    #[default]
    AtrAdaptive,
    /// No grid; directional trading only
    Disabled,
}

/// Regime classification thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeThresholds {
    /// Momentum above this (fraction) reads as bullish
    pub bull_threshold: f64,
    /// Momentum below this (fraction) reads as bearish
    pub bear_threshold: f64,
    /// Volatility index above this reads as volatile
    pub volatility_threshold: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        RegimeThresholds {
            bull_threshold: 0.01,
            bear_threshold: -0.01,
            volatility_threshold: 0.01,
        }
    }
}

/// Per-regime scaling of grid spacing and level quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeMultipliers {
    pub bull: f64,
    pub bear: f64,
    pub volatile: f64,
    pub sideways: f64,
}

impl Default for RegimeMultipliers {
    fn default() -> Self {
        RegimeMultipliers {
            bull: 1.25,
            bear: 0.9,
            volatile: 1.5,
            sideways: 0.9,
        }
    }
}

/// Entry-signal heuristic parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    /// Longs are skipped above this RSI
    pub rsi_long_max: f64,
    /// Shorts are skipped below this RSI
    pub rsi_short_min: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub volume_period: usize,
    /// Last volume must be at least this multiple of the trailing mean
    pub volume_factor: f64,
    pub allow_short: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            ema_fast: 9,
            ema_slow: 21,
            rsi_period: 14,
            rsi_long_max: 70.0,
            rsi_short_min: 30.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            volume_period: 20,
            volume_factor: 1.2,
            allow_short: true,
        }
    }
}

/// Supplementary buys on dips while a main position is open
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcaConfig {
    pub enabled: bool,
    /// Loss percent per step that triggers the next add
    pub trigger_percent: f64,
    /// Add size as a fraction of the current main size
    pub size_fraction: f64,
    pub max_count: u32,
}

impl Default for DcaConfig {
    fn default() -> Self {
        DcaConfig {
            enabled: false,
            trigger_percent: 3.0,
            size_fraction: 0.5,
            max_count: 2,
        }
    }
}

/// Per-instrument trading configuration
///
/// Immutable during a tick. Changed only through [`SymbolConfig::apply`],
/// after which the engine regenerates the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolConfig {
    pub symbol: String,
    pub policy: StrategyPolicy,
    pub grid_policy: GridPolicy,

    // Sizing
    pub capital: f64,
    pub risk_percent: f64,
    pub leverage: f64,
    pub min_lot: f64,

    // Grid
    pub grid_steps: usize,
    /// Static spacing for the anchored policy (fraction)
    pub grid_spacing: f64,
    pub min_spacing: f64,
    pub max_spacing: f64,
    /// Re-anchor when price drifts this far from the anchor (fraction)
    pub trail_threshold: f64,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub base_investment: f64,
    pub max_position_fraction: f64,
    /// Concurrency cap on live grid orders
    pub max_open_orders: usize,
    /// Deviation from the grid centre that forces a rebalance (fraction)
    pub rebalance_threshold: f64,
    pub rebalance_cooldown_secs: u64,
    pub regime_multipliers: RegimeMultipliers,

    // Regime
    pub regime: RegimeThresholds,
    pub volatility_window: usize,

    // Lifecycle percentages
    pub main_tp_percent: f64,
    pub main_protection_start_percent: f64,
    pub main_protection_percent: f64,
    pub hedge_loss_percent: f64,
    pub hedge_tp_percent: f64,
    pub hedge_protection_percent: f64,

    pub signal: SignalConfig,
    pub dca: DcaConfig,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        SymbolConfig {
            symbol: "BTCUSDT".to_string(),
            policy: StrategyPolicy::GridWithHedge,
            grid_policy: GridPolicy::AtrAdaptive,

            capital: 1000.0,
            risk_percent: 1.0,
            leverage: 5.0,
            min_lot: 0.001,

            grid_steps: 10,
            grid_spacing: 0.005,
            min_spacing: 0.002,
            max_spacing: 0.03,
            trail_threshold: 0.02,
            atr_period: 14,
            atr_multiplier: 2.0,
            base_investment: 500.0,
            max_position_fraction: 0.2,
            max_open_orders: 6,
            rebalance_threshold: 0.03,
            rebalance_cooldown_secs: 300,
            regime_multipliers: RegimeMultipliers::default(),

            regime: RegimeThresholds::default(),
            volatility_window: 20,

            main_tp_percent: 50.0,
            main_protection_start_percent: 20.0,
            main_protection_percent: 10.0,
            hedge_loss_percent: 8.0,
            hedge_tp_percent: 10.0,
            hedge_protection_percent: 5.0,

            signal: SignalConfig::default(),
            dca: DcaConfig::default(),
        }
    }
}

impl SymbolConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }

    pub fn grid_enabled(&self) -> bool {
        self.grid_policy != GridPolicy::Disabled
    }

    pub fn directional_enabled(&self) -> bool {
        self.policy == StrategyPolicy::GridWithHedge
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol", "must not be empty"));
        }
        for (field, value) in [
            ("capital", self.capital),
            ("leverage", self.leverage),
            ("min_lot", self.min_lot),
            ("base_investment", self.base_investment),
            ("atr_multiplier", self.atr_multiplier),
            ("grid_spacing", self.grid_spacing),
            ("min_spacing", self.min_spacing),
            ("max_spacing", self.max_spacing),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(field, format!("must be a positive number, got {}", value)));
            }
        }
        if !(0.0..=100.0).contains(&self.risk_percent) {
            return Err(invalid("risk_percent", "must be within 0..=100"));
        }
        if self.min_spacing > self.max_spacing {
            return Err(invalid(
                "min_spacing",
                format!("{} exceeds max_spacing {}", self.min_spacing, self.max_spacing),
            ));
        }
        if self.grid_steps == 0 {
            return Err(invalid("grid_steps", "must be > 0"));
        }
        if self.atr_period == 0 {
            return Err(invalid("atr_period", "must be > 0"));
        }
        if self.max_open_orders == 0 {
            return Err(invalid("max_open_orders", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.max_position_fraction) {
            return Err(invalid("max_position_fraction", "must be within 0..=1"));
        }
        if self.main_protection_percent > self.main_protection_start_percent {
            return Err(invalid(
                "main_protection_percent",
                "locked-in profit cannot exceed the activation threshold",
            ));
        }
        if self.hedge_protection_percent > self.hedge_tp_percent {
            return Err(invalid(
                "hedge_protection_percent",
                "locked-in profit cannot exceed hedge_tp_percent",
            ));
        }
        if self.signal.ema_fast >= self.signal.ema_slow {
            return Err(invalid("signal.ema_fast", "must be shorter than ema_slow"));
        }
        Ok(())
    }

    /// Merge a partial update into a copy of this config and validate it.
    ///
    /// The symbol name is never changed by an update.
    pub fn apply(&self, update: &SymbolConfigUpdate) -> Result<SymbolConfig, ConfigError> {
        let mut next = self.clone();

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = update.$field {
                    next.$field = value;
                })*
            };
        }

        merge!(
            policy,
            grid_policy,
            capital,
            risk_percent,
            leverage,
            min_lot,
            grid_steps,
            grid_spacing,
            min_spacing,
            max_spacing,
            trail_threshold,
            atr_period,
            atr_multiplier,
            base_investment,
            max_position_fraction,
            max_open_orders,
            rebalance_threshold,
            rebalance_cooldown_secs,
            regime_multipliers,
            regime,
            volatility_window,
            main_tp_percent,
            main_protection_start_percent,
            main_protection_percent,
            hedge_loss_percent,
            hedge_tp_percent,
            hedge_protection_percent,
            signal,
            dca,
        );

        next.validate()?;
        Ok(next)
    }
}

/// Partial reconfiguration; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolConfigUpdate {
    pub policy: Option<StrategyPolicy>,
    pub grid_policy: Option<GridPolicy>,
    pub capital: Option<f64>,
    pub risk_percent: Option<f64>,
    pub leverage: Option<f64>,
    pub min_lot: Option<f64>,
    pub grid_steps: Option<usize>,
    pub grid_spacing: Option<f64>,
    pub min_spacing: Option<f64>,
    pub max_spacing: Option<f64>,
    pub trail_threshold: Option<f64>,
    pub atr_period: Option<usize>,
    pub atr_multiplier: Option<f64>,
    pub base_investment: Option<f64>,
    pub max_position_fraction: Option<f64>,
    pub max_open_orders: Option<usize>,
    pub rebalance_threshold: Option<f64>,
    pub rebalance_cooldown_secs: Option<u64>,
    pub regime_multipliers: Option<RegimeMultipliers>,
    pub regime: Option<RegimeThresholds>,
    pub volatility_window: Option<usize>,
    pub main_tp_percent: Option<f64>,
    pub main_protection_start_percent: Option<f64>,
    pub main_protection_percent: Option<f64>,
    pub hedge_loss_percent: Option<f64>,
    pub hedge_tp_percent: Option<f64>,
    pub hedge_protection_percent: Option<f64>,
    pub signal: Option<SignalConfig>,
    pub dca: Option<DcaConfig>,
}
