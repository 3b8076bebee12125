//! Grid planner
//!
//! Two policies produce a [`GridState`]:
//!
//! - **Anchored**: a static ladder around an anchor price that is moved only
//!   when price drifts further than the trail threshold from it.
//! - **ATR-adaptive**: spacing and span follow ATR, scaled by a per-regime
//!   multiplier, and the grid is rebuilt when the rebalance trigger fires.
//!
//! A grid is never edited level-by-level during regeneration. The planner
//! builds a fresh state and the caller swaps it in with
//! [`GridState::succeed`], which carries any inventory the old grid still
//! held.

use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::config::{GridPolicy, RegimeMultipliers, SymbolConfig};
use crate::{CloseReason, PositionSide, Regime, Symbol, TradeLeg, TradeRecord};

/// Scale applied to ATR/price before clamping the adaptive spacing
pub const ATR_SPACING_FACTOR: f64 = 0.8;

/// Levels nearer the centre than this fraction of spacing are dropped
pub const CENTRE_EXCLUSION: f64 = 0.5;

/// Volatility above this multiple of the regime threshold forces a rebalance
pub const VOLATILITY_REBALANCE_FACTOR: f64 = 1.5;

/// Rebalance when fewer than this share of expected orders are live
pub const MIN_LIVE_ORDER_RATIO: f64 = 0.3;

/// Where a level sits in its buy/sell cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    #[default]
    Idle,
    BuyOpen,
    Holding,
    SellOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub status: LevelStatus,
    /// Actual buy fill, set while the level holds inventory
    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
}

impl GridLevel {
    fn new(index: usize, buy_price: f64, spacing: f64, quantity: f64) -> Self {
        Self {
            index,
            buy_price,
            sell_price: buy_price * (1.0 + spacing),
            quantity,
            status: LevelStatus::Idle,
            fill_price: None,
            filled_at: None,
        }
    }

    pub fn holds_inventory(&self) -> bool {
        matches!(self.status, LevelStatus::Holding | LevelStatus::SellOpen)
    }
}

/// A completed buy-then-sell round trip on one level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundTrip {
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub opened_at: DateTime<Utc>,
}

impl RoundTrip {
    pub fn into_trade(self, symbol: &Symbol, closed_at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            symbol: symbol.clone(),
            leg: TradeLeg::Grid,
            side: PositionSide::Long,
            entry_price: self.entry_price,
            exit_price: self.exit_price,
            size: self.quantity,
            opened_at: self.opened_at,
            closed_at,
            profit_percent: PositionSide::Long.profit_percent(self.entry_price, self.exit_price),
            reason: CloseReason::GridTakeProfit,
        }
    }
}

/// Inventory left over from earlier grids, offered as a single sell
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CarriedInventory {
    pub carried_qty: f64,
    pub carried_cost: f64,
    pub since: Option<DateTime<Utc>>,
    /// Price of the resting carry sell, if one has been placed
    #[serde(default)]
    pub sell_price: Option<f64>,
}

impl CarriedInventory {
    pub fn is_empty(&self) -> bool {
        self.carried_qty <= 0.0
    }

    pub fn average_cost(&self) -> Option<f64> {
        (self.carried_qty > 0.0).then(|| self.carried_cost / self.carried_qty)
    }

    fn add(&mut self, quantity: f64, price: f64, at: DateTime<Utc>) {
        self.carried_qty += quantity;
        self.carried_cost += quantity * price;
        self.since = Some(self.since.map_or(at, |s| s.min(at)));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    pub policy: GridPolicy,
    pub anchor: f64,
    /// Price the grid was built around
    pub center: f64,
    pub spacing: f64,
    /// Closest-to-centre first
    pub levels: Vec<GridLevel>,
    /// Bumped on every regeneration; part of every order tag
    pub generation: u64,
    pub regime: Regime,
    pub last_move: DateTime<Utc>,
    #[serde(default)]
    pub last_rebalance: Option<DateTime<Utc>>,
    #[serde(default)]
    pub carry: CarriedInventory,
}

impl GridState {
    pub fn level(&self, index: usize) -> Option<&GridLevel> {
        self.levels.iter().find(|l| l.index == index)
    }

    fn level_mut(&mut self, index: usize) -> Option<&mut GridLevel> {
        self.levels.iter_mut().find(|l| l.index == index)
    }

    /// Inventory held across all levels plus the carry
    pub fn inventory(&self) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.holds_inventory())
            .map(|l| l.quantity)
            .sum::<f64>()
            + self.carry.carried_qty
    }

    /// Price for the single carry sell: one spacing above the centre
    pub fn carry_sell_price(&self) -> f64 {
        self.center * (1.0 + self.spacing)
    }

    /// Replace `self` with `next`, moving held inventory into the carry.
    ///
    /// Any order the old grid had open is assumed cancelled by the caller.
    pub fn succeed(&self, mut next: GridState) -> GridState {
        let mut carry = self.carry.clone();
        carry.sell_price = None;
        for level in self.levels.iter().filter(|l| l.holds_inventory()) {
            let price = level.fill_price.unwrap_or(level.buy_price);
            let at = level.filled_at.unwrap_or(self.last_move);
            carry.add(level.quantity, price, at);
        }
        next.generation = self.generation + 1;
        next.carry = carry;
        next
    }

    /// A successor with no levels, holding only the carry. Used when the
    /// grid is switched off or cannot be rebuilt yet.
    pub fn retire(&self, now: DateTime<Utc>) -> GridState {
        let mut next = self.clone();
        next.levels.clear();
        next.last_move = now;
        self.succeed(next)
    }

    pub fn mark_buy_open(&mut self, index: usize) {
        if let Some(level) = self.level_mut(index) {
            level.status = LevelStatus::BuyOpen;
        }
    }

    pub fn mark_sell_open(&mut self, index: usize) {
        if let Some(level) = self.level_mut(index) {
            level.status = LevelStatus::SellOpen;
        }
    }

    /// Buy filled: the level now holds inventory awaiting its paired sell
    pub fn on_buy_filled(&mut self, index: usize, price: f64, at: DateTime<Utc>) -> bool {
        match self.level_mut(index) {
            Some(level) if level.status == LevelStatus::BuyOpen => {
                level.status = LevelStatus::Holding;
                level.fill_price = Some(price);
                level.filled_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Sell filled: the level returns to idle and the round trip is reported
    pub fn on_sell_filled(&mut self, index: usize, price: f64, at: DateTime<Utc>) -> Option<RoundTrip> {
        let level = self.level_mut(index)?;
        if level.status != LevelStatus::SellOpen {
            return None;
        }
        let trip = RoundTrip {
            entry_price: level.fill_price.unwrap_or(level.buy_price),
            exit_price: price,
            quantity: level.quantity,
            opened_at: level.filled_at.unwrap_or(at),
        };
        level.status = LevelStatus::Idle;
        level.fill_price = None;
        level.filled_at = None;
        Some(trip)
    }

    /// An order on the level disappeared without filling
    pub fn on_order_cancelled(&mut self, index: usize) {
        if let Some(level) = self.level_mut(index) {
            level.status = match level.status {
                LevelStatus::BuyOpen => LevelStatus::Idle,
                LevelStatus::SellOpen => LevelStatus::Holding,
                other => other,
            };
        }
    }

    /// A level's order finished after filling only `quantity`. What the level
    /// holds afterwards moves to the carry and the level returns to idle; a
    /// partial sell reports the part that was sold.
    pub fn on_partial_fill(
        &mut self,
        index: usize,
        quantity: f64,
        price: f64,
        at: DateTime<Utc>,
    ) -> Option<RoundTrip> {
        let level = self.level_mut(index)?;
        let status = level.status;
        let entry_price = level.fill_price.unwrap_or(level.buy_price);
        let opened_at = level.filled_at.unwrap_or(at);
        let remainder = (level.quantity - quantity).max(0.0);
        match status {
            LevelStatus::BuyOpen => {
                level.status = LevelStatus::Idle;
                self.carry.add(quantity, price, at);
                None
            }
            LevelStatus::SellOpen => {
                level.status = LevelStatus::Idle;
                level.fill_price = None;
                level.filled_at = None;
                if remainder > f64::EPSILON {
                    self.carry.add(remainder, entry_price, opened_at);
                    self.carry.sell_price = None;
                }
                Some(RoundTrip {
                    entry_price,
                    exit_price: price,
                    quantity,
                    opened_at,
                })
            }
            _ => None,
        }
    }

    /// The carry sell finished after filling only `quantity`
    pub fn on_carry_partially_filled(&mut self, quantity: f64, price: f64, at: DateTime<Utc>) -> Option<RoundTrip> {
        let trip = self.release_stale_sell(quantity, price, at);
        self.carry.sell_price = None;
        trip
    }

    pub fn mark_carry_open(&mut self, price: f64) {
        self.carry.sell_price = Some(price);
    }

    /// Carry sell filled; clears the carry and reports the round trip
    pub fn on_carry_filled(&mut self, price: f64, at: DateTime<Utc>) -> Option<RoundTrip> {
        let entry_price = self.carry.average_cost()?;
        let trip = RoundTrip {
            entry_price,
            exit_price: price,
            quantity: self.carry.carried_qty,
            opened_at: self.carry.since.unwrap_or(at),
        };
        self.carry = CarriedInventory::default();
        Some(trip)
    }

    pub fn on_carry_cancelled(&mut self) {
        self.carry.sell_price = None;
    }

    /// A buy from an earlier generation filled after the grid moved on
    pub fn absorb_stale_buy(&mut self, quantity: f64, price: f64, at: DateTime<Utc>) {
        self.carry.add(quantity, price, at);
    }

    /// A sell from an earlier generation filled; its inventory was already
    /// moved into the carry, so it comes out of the carry at average cost.
    pub fn release_stale_sell(&mut self, quantity: f64, price: f64, at: DateTime<Utc>) -> Option<RoundTrip> {
        let entry_price = self.carry.average_cost()?;
        let quantity = quantity.min(self.carry.carried_qty);
        let trip = RoundTrip {
            entry_price,
            exit_price: price,
            quantity,
            opened_at: self.carry.since.unwrap_or(at),
        };
        self.carry.carried_qty -= quantity;
        self.carry.carried_cost -= quantity * entry_price;
        if self.carry.carried_qty <= f64::EPSILON {
            self.carry = CarriedInventory::default();
        }
        Some(trip)
    }
}

/// Why the adaptive grid should be rebuilt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RebalanceTrigger {
    PriceDeviation(f64),
    HighVolatility(f64),
    SparseOrders { live: usize, expected: usize },
}

impl std::fmt::Display for RebalanceTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceDeviation(d) => write!(f, "price deviated {:.2}% from centre", d * 100.0),
            Self::HighVolatility(v) => write!(f, "volatility {:.4} above limit", v),
            Self::SparseOrders { live, expected } => {
                write!(f, "only {} of {} grid orders live", live, expected)
            }
        }
    }
}

/// Regime multiplier applied to spacing and quantity
pub fn regime_multiplier(regime: Regime, multipliers: &RegimeMultipliers) -> f64 {
    match regime {
        Regime::Bull => multipliers.bull,
        Regime::Bear => multipliers.bear,
        Regime::Volatile => multipliers.volatile,
        Regime::Sideways | Regime::Unknown => multipliers.sideways,
    }
}

/// Adaptive spacing: `clamp(ATR/price·0.8, min, max) × regime multiplier`
pub fn adaptive_spacing(atr: f64, price: f64, config: &SymbolConfig, regime: Regime) -> f64 {
    let raw = atr / price * ATR_SPACING_FACTOR;
    raw.clamp(config.min_spacing, config.max_spacing)
        * regime_multiplier(regime, &config.regime_multipliers)
}

/// Per-level quantity, floored at the minimum lot
pub fn level_quantity(price: f64, levels: usize, config: &SymbolConfig, regime: Regime) -> f64 {
    if price <= 0.0 || levels == 0 {
        return config.min_lot;
    }
    let per_level = config.base_investment / levels as f64 / price;
    let cap = config.base_investment * config.max_position_fraction / price;
    let qty = per_level.min(cap) * regime_multiplier(regime, &config.regime_multipliers);
    qty.max(config.min_lot)
}

/// Anchored ladder: `anchor·(1 + (i − ⌊steps/2⌋)·spacing)` for i in 0..steps
pub fn anchored_prices(anchor: f64, steps: usize, spacing: f64) -> Vec<f64> {
    let half = (steps / 2) as f64;
    (0..steps)
        .map(|i| anchor * (1.0 + (i as f64 - half) * spacing))
        .collect()
}

/// Anchored grids move only when price leaves the trail band
pub fn needs_reanchor(grid: Option<&GridState>, price: f64, trail_threshold: f64) -> bool {
    match grid {
        None => true,
        Some(g) if g.anchor <= 0.0 => true,
        Some(g) => (price / g.anchor - 1.0).abs() > trail_threshold,
    }
}

/// Build an anchored grid centred on `price`
pub fn plan_anchored(price: f64, config: &SymbolConfig, regime: Regime, now: DateTime<Utc>) -> GridState {
    let spacing = config.grid_spacing;
    let prices = anchored_prices(price, config.grid_steps, spacing);
    let quantity = level_quantity(price, prices.len(), config, regime);

    let mut levels: Vec<GridLevel> = prices
        .into_iter()
        .enumerate()
        .map(|(i, p)| GridLevel::new(i, p, spacing, quantity))
        .collect();
    sort_closest_first(&mut levels, price);

    GridState {
        policy: GridPolicy::Anchored,
        anchor: price,
        center: price,
        spacing,
        levels,
        generation: 0,
        regime,
        last_move: now,
        last_rebalance: None,
        carry: CarriedInventory::default(),
    }
}

/// Build an ATR-adaptive grid.
///
/// Buy prices are `grid_steps` equal steps across
/// `[price − ATR·mult, price + ATR·mult]`; levels closer to the centre than
/// half a spacing are dropped.
pub fn plan_adaptive(
    price: f64,
    atr: f64,
    config: &SymbolConfig,
    regime: Regime,
    now: DateTime<Utc>,
) -> GridState {
    let spacing = adaptive_spacing(atr, price, config, regime);
    let half_span = atr * config.atr_multiplier;
    let low = price - half_span;
    let steps = config.grid_steps;
    let step = if steps > 1 {
        2.0 * half_span / (steps - 1) as f64
    } else {
        0.0
    };

    let prices: Vec<f64> = (0..steps)
        .map(|i| low + step * i as f64)
        .filter(|p| *p > 0.0)
        .filter(|p| ((p - price) / price).abs() >= spacing * CENTRE_EXCLUSION)
        .collect();
    let quantity = level_quantity(price, prices.len(), config, regime);

    let mut levels: Vec<GridLevel> = prices
        .into_iter()
        .enumerate()
        .map(|(i, p)| GridLevel::new(i, p, spacing, quantity))
        .collect();
    sort_closest_first(&mut levels, price);

    GridState {
        policy: GridPolicy::AtrAdaptive,
        anchor: price,
        center: price,
        spacing,
        levels,
        generation: 0,
        regime,
        last_move: now,
        last_rebalance: Some(now),
        carry: CarriedInventory::default(),
    }
}

fn sort_closest_first(levels: &mut [GridLevel], price: f64) {
    levels.sort_by_key(|l| OrderedFloat((l.buy_price - price).abs()));
}

/// Orders the adaptive grid expects to keep live
pub fn expected_live_orders(grid: &GridState, max_open_orders: usize) -> usize {
    grid.levels.len().min(max_open_orders)
}

/// Evaluate the adaptive rebalance trigger. Returns `None` while the
/// cool-down is running or nothing warrants a rebuild.
pub fn rebalance_trigger(
    grid: &GridState,
    price: f64,
    volatility: f64,
    live_orders: usize,
    config: &SymbolConfig,
    now: DateTime<Utc>,
) -> Option<RebalanceTrigger> {
    let cooldown = Duration::seconds(config.rebalance_cooldown_secs as i64);
    if let Some(last) = grid.last_rebalance {
        if now - last < cooldown {
            return None;
        }
    }

    if grid.center > 0.0 {
        let deviation = (price - grid.center).abs() / grid.center;
        if deviation > config.rebalance_threshold {
            return Some(RebalanceTrigger::PriceDeviation(deviation));
        }
    }

    if volatility > VOLATILITY_REBALANCE_FACTOR * config.regime.volatility_threshold {
        return Some(RebalanceTrigger::HighVolatility(volatility));
    }

    let expected = expected_live_orders(grid, config.max_open_orders);
    if expected > 0 && (live_orders as f64) < MIN_LIVE_ORDER_RATIO * expected as f64 {
        return Some(RebalanceTrigger::SparseOrders {
            live: live_orders,
            expected,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> SymbolConfig {
        SymbolConfig {
            grid_steps: 5,
            grid_spacing: 0.01,
            min_spacing: 0.002,
            max_spacing: 0.03,
            atr_multiplier: 2.0,
            base_investment: 1000.0,
            max_position_fraction: 0.2,
            min_lot: 0.001,
            regime_multipliers: RegimeMultipliers {
                bull: 1.25,
                bear: 0.9,
                volatile: 1.5,
                sideways: 1.0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_anchored_ladder_formula() {
        let prices = anchored_prices(100.0, 5, 0.01);
        let expected = [98.0, 99.0, 100.0, 101.0, 102.0];
        for (p, e) in prices.iter().zip(expected) {
            assert_relative_eq!(*p, e, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_reanchor_only_outside_trail_band() {
        let grid = plan_anchored(100.0, &config(), Regime::Sideways, Utc::now());
        assert!(needs_reanchor(None, 100.0, 0.02));
        assert!(!needs_reanchor(Some(&grid), 101.5, 0.02));
        assert!(needs_reanchor(Some(&grid), 102.5, 0.02));
        assert!(needs_reanchor(Some(&grid), 97.9, 0.02));
    }

    #[test]
    fn test_adaptive_spacing_clamped_then_scaled() {
        let cfg = config();
        // 2/100 * 0.8 = 0.016
        assert_relative_eq!(adaptive_spacing(2.0, 100.0, &cfg, Regime::Sideways), 0.016, epsilon = 1e-12);
        assert_relative_eq!(adaptive_spacing(2.0, 100.0, &cfg, Regime::Bull), 0.02, epsilon = 1e-12);
        // Clamped to max before the multiplier
        assert_relative_eq!(adaptive_spacing(10.0, 100.0, &cfg, Regime::Volatile), 0.045, epsilon = 1e-12);
        // Clamped to min
        assert_relative_eq!(adaptive_spacing(0.01, 100.0, &cfg, Regime::Bear), 0.0018, epsilon = 1e-12);
    }

    #[test]
    fn test_level_quantity_capped_and_floored() {
        let cfg = config();
        // min(1000/5/100, 1000*0.2/100) = min(2, 2)
        assert_relative_eq!(level_quantity(100.0, 5, &cfg, Regime::Sideways), 2.0, epsilon = 1e-12);
        // min(1000/2/100, 2) = 2 (capped)
        assert_relative_eq!(level_quantity(100.0, 2, &cfg, Regime::Sideways), 2.0, epsilon = 1e-12);
        assert_relative_eq!(level_quantity(100.0, 10, &cfg, Regime::Sideways), 1.0, epsilon = 1e-12);
        assert_relative_eq!(level_quantity(1e9, 10, &cfg, Regime::Sideways), 0.001);
    }

    #[test]
    fn test_adaptive_grid_drops_centre_and_sorts_closest_first() {
        let cfg = config();
        let grid = plan_adaptive(100.0, 2.0, &cfg, Regime::Sideways, Utc::now());
        // span 96..104 in 5 steps: 96, 98, 100, 102, 104; 100 is dropped
        assert_eq!(grid.levels.len(), 4);
        assert!(grid.levels.iter().all(|l| (l.buy_price - 100.0).abs() > 1.0));

        let distances: Vec<f64> = grid
            .levels
            .iter()
            .map(|l| (l.buy_price - 100.0).abs())
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));

        for level in &grid.levels {
            assert_relative_eq!(level.sell_price, level.buy_price * (1.0 + grid.spacing), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rebalance_respects_cooldown() {
        let cfg = config();
        let now = Utc::now();
        let grid = plan_adaptive(100.0, 2.0, &cfg, Regime::Sideways, now);
        assert!(rebalance_trigger(&grid, 110.0, 0.0, 4, &cfg, now).is_none());

        let later = now + Duration::seconds(cfg.rebalance_cooldown_secs as i64 + 1);
        assert!(matches!(
            rebalance_trigger(&grid, 110.0, 0.0, 4, &cfg, later),
            Some(RebalanceTrigger::PriceDeviation(_))
        ));
    }

    #[test]
    fn test_rebalance_on_volatility_and_sparse_orders() {
        let cfg = config();
        let now = Utc::now();
        let mut grid = plan_adaptive(100.0, 2.0, &cfg, Regime::Sideways, now);
        grid.last_rebalance = None;

        let high_vol = cfg.regime.volatility_threshold * 2.0;
        assert!(matches!(
            rebalance_trigger(&grid, 100.0, high_vol, 4, &cfg, now),
            Some(RebalanceTrigger::HighVolatility(_))
        ));
        assert!(matches!(
            rebalance_trigger(&grid, 100.0, 0.0, 1, &cfg, now),
            Some(RebalanceTrigger::SparseOrders { live: 1, expected: 4 })
        ));
        assert!(rebalance_trigger(&grid, 100.0, 0.0, 2, &cfg, now).is_none());
    }

    #[test]
    fn test_level_cycle_reports_round_trip() {
        let now = Utc::now();
        let mut grid = plan_anchored(100.0, &config(), Regime::Sideways, now);
        let index = grid.levels[1].index;

        assert!(!grid.on_buy_filled(index, 99.0, now));
        grid.mark_buy_open(index);
        assert!(grid.on_buy_filled(index, 99.0, now));
        assert!(grid.on_sell_filled(index, 100.0, now).is_none());

        grid.mark_sell_open(index);
        let trip = grid.on_sell_filled(index, 100.0, now).unwrap();
        assert_relative_eq!(trip.entry_price, 99.0);
        assert_eq!(grid.level(index).unwrap().status, LevelStatus::Idle);
    }

    #[test]
    fn test_cancelled_sell_returns_to_holding() {
        let now = Utc::now();
        let mut grid = plan_anchored(100.0, &config(), Regime::Sideways, now);
        let index = grid.levels[0].index;
        grid.mark_buy_open(index);
        grid.on_buy_filled(index, 100.0, now);
        grid.mark_sell_open(index);
        grid.on_order_cancelled(index);
        assert_eq!(grid.level(index).unwrap().status, LevelStatus::Holding);
    }

    #[test]
    fn test_succeed_carries_inventory_and_bumps_generation() {
        let cfg = config();
        let now = Utc::now();
        let mut old = plan_anchored(100.0, &cfg, Regime::Sideways, now);
        let a = old.levels[0].index;
        let b = old.levels[1].index;
        for idx in [a, b] {
            old.mark_buy_open(idx);
        }
        old.on_buy_filled(a, 100.0, now);
        old.on_buy_filled(b, 98.0, now);
        let held = old.inventory();

        let next = old.succeed(plan_anchored(95.0, &cfg, Regime::Bear, now));
        assert_eq!(next.generation, old.generation + 1);
        assert_relative_eq!(next.carry.carried_qty, held);
        assert!(next.levels.iter().all(|l| l.status == LevelStatus::Idle));
        let avg = next.carry.average_cost().unwrap();
        assert!(avg > 98.0 && avg < 100.0);
        assert_relative_eq!(next.carry_sell_price(), 95.0 * 1.01, epsilon = 1e-9);
    }

    #[test]
    fn test_stale_fills_flow_through_carry() {
        let now = Utc::now();
        let mut grid = plan_anchored(100.0, &config(), Regime::Sideways, now);
        grid.absorb_stale_buy(2.0, 99.0, now);
        grid.absorb_stale_buy(2.0, 97.0, now);
        assert_relative_eq!(grid.carry.average_cost().unwrap(), 98.0);

        let trip = grid.release_stale_sell(1.0, 101.0, now).unwrap();
        assert_relative_eq!(trip.entry_price, 98.0);
        assert_relative_eq!(grid.carry.carried_qty, 3.0);

        let trip = grid.release_stale_sell(5.0, 101.0, now).unwrap();
        assert_relative_eq!(trip.quantity, 3.0);
        assert!(grid.carry.is_empty());
        assert!(grid.release_stale_sell(1.0, 101.0, now).is_none());
    }

    #[test]
    fn test_retire_clears_levels_and_keeps_inventory() {
        let cfg = config();
        let now = Utc::now();
        let mut grid = plan_anchored(100.0, &cfg, Regime::Sideways, now);
        let idx = grid.levels[0].index;
        let qty = grid.levels[0].quantity;
        grid.mark_buy_open(idx);
        grid.on_buy_filled(idx, 99.0, now);

        let retired = grid.retire(now);
        assert!(retired.levels.is_empty());
        assert_eq!(retired.generation, grid.generation + 1);
        assert_relative_eq!(retired.carry.carried_qty, qty, epsilon = 1e-9);
        assert_relative_eq!(retired.carry.average_cost().unwrap(), 99.0, epsilon = 1e-9);
        assert!(retired.carry.sell_price.is_none());
    }

    #[test]
    fn test_partial_buy_moves_fill_to_carry() {
        let cfg = config();
        let now = Utc::now();
        let mut grid = plan_anchored(100.0, &cfg, Regime::Sideways, now);
        let idx = grid.levels[0].index;
        grid.mark_buy_open(idx);

        assert!(grid.on_partial_fill(idx, 0.3, 99.0, now).is_none());
        assert_eq!(grid.level(idx).unwrap().status, LevelStatus::Idle);
        assert_relative_eq!(grid.carry.carried_qty, 0.3, epsilon = 1e-9);
        assert_relative_eq!(grid.carry.carried_cost, 29.7, epsilon = 1e-9);
    }

    #[test]
    fn test_partial_sell_reports_sold_part_and_carries_rest() {
        let cfg = config();
        let now = Utc::now();
        let mut grid = plan_anchored(100.0, &cfg, Regime::Sideways, now);
        let idx = grid.levels[0].index;
        let qty = grid.levels[0].quantity;
        grid.mark_buy_open(idx);
        grid.on_buy_filled(idx, 99.0, now);
        grid.mark_sell_open(idx);

        let trip = grid.on_partial_fill(idx, qty / 4.0, 100.0, now).unwrap();
        assert_relative_eq!(trip.quantity, qty / 4.0, epsilon = 1e-9);
        assert_relative_eq!(trip.entry_price, 99.0, epsilon = 1e-9);
        assert_eq!(grid.level(idx).unwrap().status, LevelStatus::Idle);
        assert_relative_eq!(grid.carry.carried_qty, qty * 0.75, epsilon = 1e-9);
        assert_relative_eq!(grid.carry.average_cost().unwrap(), 99.0, epsilon = 1e-9);
        assert_relative_eq!(grid.inventory(), qty * 0.75, epsilon = 1e-9);
    }
}
