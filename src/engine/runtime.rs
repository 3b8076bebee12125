//! Per-symbol runtime and its tick pipeline
//!
//! One tick: fetch candles, update the market view and regime, fold order
//! fills into the grid, move or rebuild the grid, place missing grid orders,
//! then run the position lifecycle. The lifecycle waits while a main or hedge
//! order is unconfirmed. Every exchange failure is contained here;
//! the only error a tick returns is a failed candle fetch.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{GridPolicy, SymbolConfig};
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::grid::{self, GridState, LevelStatus};
use crate::lifecycle::{self, PositionBook, Slot, Transition, TransitionError};
use crate::market::MarketObservation;
use crate::notify::{AlertKind, Notifier};
use crate::reconciler::{CancelReport, OrderOutcome, OrderReconciler, OrderTag, Submission};
use crate::regime;
use crate::signal::entry_signal;
use crate::state_manager::SymbolSnapshot;
use crate::{CloseReason, OrderSide, PerformanceAggregate, Regime, Symbol, TradeRecord};

/// Everything a tick borrows from the engine
pub struct TickContext<'a> {
    pub exchange: &'a dyn Exchange,
    pub notifier: &'a Notifier,
    pub candle_interval: &'a str,
    pub candle_limit: u32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickOutcome {
    /// State worth persisting changed
    pub mutated: bool,
    pub price: Option<f64>,
    pub regime: Regime,
}

/// Why a lifecycle transition was not carried out
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("{tag} order {link_id} unconfirmed, resolving on the next poll")]
    Unconfirmed { tag: OrderTag, link_id: String },
    #[error("{0} order still awaiting confirmation")]
    OrderPending(OrderTag),
}

pub struct SymbolRuntime {
    symbol: Symbol,
    config: SymbolConfig,
    market: MarketObservation,
    book: PositionBook,
    grid: Option<GridState>,
    trades: Vec<TradeRecord>,
    reconciler: OrderReconciler,
    /// Transition whose market order was sent but not yet confirmed
    pending: Option<Transition>,
    force_rebalance: bool,
    last_tick: Option<DateTime<Utc>>,
}

impl SymbolRuntime {
    pub fn new(config: SymbolConfig) -> Self {
        let snapshot = SymbolSnapshot::empty(config.symbol());
        Self::from_snapshot(config, snapshot)
    }

    /// Resume from a stored document
    pub fn from_snapshot(config: SymbolConfig, snapshot: SymbolSnapshot) -> Self {
        let symbol = config.symbol();
        Self {
            market: MarketObservation::new(config.atr_period, config.volatility_window),
            reconciler: OrderReconciler::with_live_orders(symbol.clone(), snapshot.live_orders),
            book: snapshot.book,
            grid: snapshot.grid,
            trades: snapshot.trades,
            pending: snapshot.pending_transition,
            force_rebalance: false,
            last_tick: None,
            symbol,
            config,
        }
    }

    pub fn snapshot(&self) -> SymbolSnapshot {
        SymbolSnapshot {
            symbol: self.symbol.clone(),
            book: self.book.clone(),
            grid: self.grid.clone(),
            trades: self.trades.clone(),
            performance: self.performance(),
            live_orders: self.reconciler.snapshot(),
            pending_transition: self.pending.clone(),
            updated_at: None,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn config(&self) -> &SymbolConfig {
        &self.config
    }

    pub fn market(&self) -> &MarketObservation {
        &self.market
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn grid(&self) -> Option<&GridState> {
        self.grid.as_ref()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn reconciler(&self) -> &OrderReconciler {
        &self.reconciler
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    pub fn performance(&self) -> PerformanceAggregate {
        PerformanceAggregate::from_trades(&self.trades)
    }

    /// Rebuild the grid on the next tick regardless of the triggers
    pub fn request_rebalance(&mut self) {
        self.force_rebalance = true;
    }

    /// Swap in a new configuration and re-derive the grid for it.
    ///
    /// Grid orders must already be cancelled. When no grid can be built yet
    /// (no price, or ATR not ready) or the grid is switched off, the old
    /// levels are dropped and held inventory moves to the carry.
    pub fn reconfigure(&mut self, config: SymbolConfig, now: DateTime<Utc>) {
        self.market
            .reconfigure(config.atr_period, config.volatility_window);
        self.config = config;

        let regime = self.market.regime();
        let planned = match (self.config.grid_policy, self.market.last_price()) {
            (GridPolicy::Anchored, Some(price)) => {
                Some(grid::plan_anchored(price, &self.config, regime, now))
            }
            (GridPolicy::AtrAdaptive, Some(price)) => self
                .market
                .atr()
                .map(|atr| grid::plan_adaptive(price, atr, &self.config, regime, now)),
            _ => None,
        };
        let disabled = self.config.grid_policy == GridPolicy::Disabled;
        self.force_rebalance = planned.is_none() && !disabled;

        self.grid = match (self.grid.take(), planned) {
            (Some(old), Some(next)) => Some(old.succeed(next)),
            (None, planned) => planned,
            (Some(old), None) => {
                let retired = old.retire(now);
                (!disabled || !retired.carry.is_empty()).then_some(retired)
            }
        };

        match &self.grid {
            Some(g) => info!(
                "Grid re-derived for {}: {} levels spacing {:.3}% carry {:.6}",
                self.symbol,
                g.levels.len(),
                g.spacing * 100.0,
                g.carry.carried_qty
            ),
            None => info!("Grid cleared for {}", self.symbol),
        }
    }

    pub async fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, ExchangeError> {
        let candles = ctx
            .exchange
            .candles(&self.symbol, ctx.candle_interval, ctx.candle_limit)
            .await?;
        self.market.ingest_all(candles);
        self.last_tick = Some(ctx.now);

        let Some(price) = self.market.last_price() else {
            debug!(symbol = %self.symbol, "No market data yet, skipping tick");
            return Ok(TickOutcome::default());
        };

        let regime = regime::classify(
            &self.market.closes(),
            self.market.volatility_index(),
            &self.config.regime,
        );
        if regime != self.market.regime() {
            info!(symbol = %self.symbol, from = %self.market.regime(), to = %regime, "Regime changed");
        }
        self.market.set_regime(regime);

        let mut mutated = self.reconcile(ctx).await;
        mutated |= self.step_grid(ctx, price).await;
        mutated |= self.step_lifecycle(ctx, price).await;

        Ok(TickOutcome {
            mutated,
            price: Some(price),
            regime,
        })
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    async fn reconcile(&mut self, ctx: &TickContext<'_>) -> bool {
        match self.reconciler.poll(ctx.exchange).await {
            Ok(outcomes) => {
                let changed = !outcomes.is_empty();
                for outcome in outcomes {
                    self.apply_outcome(ctx, outcome);
                }
                changed
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Order poll failed, retrying next tick");
                false
            }
        }
    }

    /// Fold a finished order into the grid or the position book
    fn apply_outcome(&mut self, ctx: &TickContext<'_>, outcome: OrderOutcome) {
        if matches!(outcome.tag(), OrderTag::Main | OrderTag::Hedge) {
            self.settle_position_order(ctx, outcome);
            return;
        }
        let Some(grid) = self.grid.as_mut() else {
            debug!(symbol = %self.symbol, tag = %outcome.tag(), "Outcome with no grid, ignoring");
            return;
        };
        let current = grid.generation;

        let trip = match outcome {
            OrderOutcome::Filled {
                tag,
                price,
                quantity,
                ..
            } => {
                debug!(symbol = %self.symbol, %tag, price, quantity, "Order filled");
                match tag {
                    OrderTag::GridBuy { generation, index } if generation == current => {
                        grid.on_buy_filled(index, price, ctx.now);
                        None
                    }
                    OrderTag::GridBuy { .. } => {
                        grid.absorb_stale_buy(quantity, price, ctx.now);
                        None
                    }
                    OrderTag::GridSell { generation, index } if generation == current => {
                        grid.on_sell_filled(index, price, ctx.now)
                    }
                    OrderTag::Carry { generation } if generation == current => {
                        grid.on_carry_filled(price, ctx.now)
                    }
                    OrderTag::GridSell { .. } | OrderTag::Carry { .. } => {
                        grid.release_stale_sell(quantity, price, ctx.now)
                    }
                    OrderTag::Main | OrderTag::Hedge => None,
                }
            }
            OrderOutcome::PartiallyFilled {
                tag,
                price,
                quantity,
                ..
            } => {
                debug!(symbol = %self.symbol, %tag, price, quantity, "Order partially filled");
                match tag {
                    OrderTag::GridBuy { generation, index } | OrderTag::GridSell { generation, index }
                        if generation == current =>
                    {
                        grid.on_partial_fill(index, quantity, price, ctx.now)
                    }
                    OrderTag::Carry { generation } if generation == current => {
                        grid.on_carry_partially_filled(quantity, price, ctx.now)
                    }
                    OrderTag::GridBuy { .. } => {
                        grid.absorb_stale_buy(quantity, price, ctx.now);
                        None
                    }
                    OrderTag::GridSell { .. } | OrderTag::Carry { .. } => {
                        grid.release_stale_sell(quantity, price, ctx.now)
                    }
                    OrderTag::Main | OrderTag::Hedge => None,
                }
            }
            OrderOutcome::Cancelled { tag, .. } => {
                debug!(symbol = %self.symbol, %tag, "Order cancelled");
                match tag {
                    OrderTag::GridBuy { generation, index }
                    | OrderTag::GridSell { generation, index }
                        if generation == current =>
                    {
                        grid.on_order_cancelled(index)
                    }
                    OrderTag::Carry { generation } if generation == current => {
                        grid.on_carry_cancelled()
                    }
                    _ => {}
                }
                None
            }
        };

        if let Some(trip) = trip {
            let trade = trip.into_trade(&self.symbol, ctx.now);
            info!(
                "Grid round trip: {} {:.6} {:.4} -> {:.4} ({:+.2}%)",
                self.symbol, trade.size, trade.entry_price, trade.exit_price, trade.profit_percent
            );
            ctx.notifier.alert(
                AlertKind::Close,
                &self.symbol,
                vec![
                    format!("grid {:.6} @ {:.4} -> {:.4}", trade.size, trade.entry_price, trade.exit_price),
                    format!("profit {:+.2}%", trade.profit_percent),
                ],
            );
            self.trades.push(trade);
        }
    }

    /// Apply the pending transition once its unconfirmed market order
    /// resolves. A fill is applied at the venue's price; an order that never
    /// executed drops the transition.
    fn settle_position_order(&mut self, ctx: &TickContext<'_>, outcome: OrderOutcome) {
        let Some(transition) = self.pending.take() else {
            warn!(symbol = %self.symbol, tag = %outcome.tag(), "Position order resolved with nothing pending");
            return;
        };

        let (transition, price, order_id) = match outcome {
            OrderOutcome::Filled { price, order_id, .. } => (transition, price, order_id),
            OrderOutcome::PartiallyFilled {
                price,
                order_id,
                quantity,
                ..
            } => {
                warn!(symbol = %self.symbol, ?transition, quantity, "Position order only partially filled");
                ctx.notifier.alert(
                    AlertKind::Warn,
                    &self.symbol,
                    vec![format!("{:?} partially filled: {:.6}", transition, quantity)],
                );
                (resize(transition, quantity), price, order_id)
            }
            OrderOutcome::Cancelled { order_id, .. } => {
                warn!(symbol = %self.symbol, ?transition, %order_id, "Unconfirmed position order did not execute");
                ctx.notifier.alert(
                    AlertKind::Warn,
                    &self.symbol,
                    vec![format!("{:?} not executed", transition)],
                );
                return;
            }
        };

        info!(symbol = %self.symbol, ?transition, price, "Unconfirmed position order filled");
        match self
            .book
            .apply(&self.symbol, &transition, price, Some(order_id), ctx.now)
        {
            Ok(trade) => {
                self.announce(ctx, &transition, price, trade.as_ref());
                if let Some(trade) = trade {
                    self.trades.push(trade);
                }
            }
            Err(e) => {
                error!(symbol = %self.symbol, ?transition, error = %e, "Confirmed fill could not be applied");
            }
        }
    }

    /// Main or hedge order still awaiting confirmation
    fn pending_position_order(&self) -> Option<OrderTag> {
        [OrderTag::Main, OrderTag::Hedge]
            .into_iter()
            .find(|t| self.reconciler.is_live(t))
    }

    /// Cancel every live order, folding the results into the grid
    pub async fn cancel_all_orders(&mut self, ctx: &TickContext<'_>) -> CancelReport {
        let mut report = self.reconciler.cancel_all(ctx.exchange).await;
        for outcome in std::mem::take(&mut report.outcomes) {
            self.apply_outcome(ctx, outcome.clone());
            report.outcomes.push(outcome);
        }
        report
    }

    /// Cancel grid orders only
    pub async fn cancel_grid_orders(&mut self, ctx: &TickContext<'_>) -> CancelReport {
        let mut report = self
            .reconciler
            .cancel_matching(ctx.exchange, OrderTag::is_grid)
            .await;
        for outcome in std::mem::take(&mut report.outcomes) {
            self.apply_outcome(ctx, outcome.clone());
            report.outcomes.push(outcome);
        }
        report
    }

    // =========================================================================
    // Grid
    // =========================================================================

    async fn step_grid(&mut self, ctx: &TickContext<'_>, price: f64) -> bool {
        let regime = self.market.regime();
        let forced = std::mem::take(&mut self.force_rebalance);

        let planned = match self.config.grid_policy {
            GridPolicy::Disabled => return self.step_carry_only(ctx, price).await,
            GridPolicy::Anchored => {
                if forced {
                    Some((grid::plan_anchored(price, &self.config, regime, ctx.now), "forced rebalance".to_string()))
                } else if grid::needs_reanchor(self.grid.as_ref(), price, self.config.trail_threshold) {
                    let reason = match &self.grid {
                        None => "initial grid".to_string(),
                        Some(g) => format!("price left trail band around {:.4}", g.anchor),
                    };
                    Some((grid::plan_anchored(price, &self.config, regime, ctx.now), reason))
                } else {
                    None
                }
            }
            GridPolicy::AtrAdaptive => {
                let Some(atr) = self.market.atr() else {
                    debug!(symbol = %self.symbol, bars = self.market.len(), "ATR not ready, grid deferred");
                    self.force_rebalance = forced;
                    return false;
                };
                let reason = match &self.grid {
                    None => Some("initial grid".to_string()),
                    Some(_) if forced => Some("forced rebalance".to_string()),
                    Some(g) => grid::rebalance_trigger(
                        g,
                        price,
                        self.market.volatility_index(),
                        self.reconciler.grid_order_count(),
                        &self.config,
                        ctx.now,
                    )
                    .map(|t| t.to_string()),
                };
                reason.map(|r| (grid::plan_adaptive(price, atr, &self.config, regime, ctx.now), r))
            }
        };

        let mut mutated = false;
        if let Some((next, reason)) = planned {
            mutated |= self.regenerate_grid(ctx, next, &reason).await;
        }
        mutated |= self.place_grid_orders(ctx, price).await;
        mutated
    }

    /// Grid switched off: drop any levels left over and keep offering the
    /// carried inventory
    async fn step_carry_only(&mut self, ctx: &TickContext<'_>, price: f64) -> bool {
        let mut mutated = false;
        if self.grid.as_ref().is_some_and(|g| !g.levels.is_empty()) {
            let report = self.cancel_grid_orders(ctx).await;
            mutated = !report.outcomes.is_empty();
            if !report.is_complete() {
                warn!(symbol = %self.symbol, failed = report.failed.len(), "Grid teardown deferred, old orders still live");
                return mutated;
            }
            self.grid = self.grid.take().map(|g| g.retire(ctx.now));
            mutated = true;
        }
        mutated | self.place_grid_orders(ctx, price).await
    }

    /// Swap in `next` once every old grid order is gone. If any cancel fails
    /// the old grid stays in place and the rebuild is retried later.
    async fn regenerate_grid(&mut self, ctx: &TickContext<'_>, next: GridState, reason: &str) -> bool {
        let report = self.cancel_grid_orders(ctx).await;
        let cancelled = !report.outcomes.is_empty();

        if !report.is_complete() {
            warn!(
                symbol = %self.symbol,
                failed = report.failed.len(),
                "Grid rebuild aborted, old orders still live"
            );
            ctx.notifier.alert(
                AlertKind::Warn,
                &self.symbol,
                vec![format!(
                    "grid rebuild ({}) aborted: {} cancels failed",
                    reason,
                    report.failed.len()
                )],
            );
            self.force_rebalance = true;
            return cancelled;
        }

        let next = match self.grid.take() {
            Some(old) => old.succeed(next),
            None => next,
        };
        info!(
            "Grid rebuilt for {}: {} | centre {:.4} spacing {:.3}% levels {} carry {:.6}",
            self.symbol,
            reason,
            next.center,
            next.spacing * 100.0,
            next.levels.len(),
            next.carry.carried_qty
        );
        ctx.notifier.alert(
            AlertKind::GridMove,
            &self.symbol,
            vec![
                reason.to_string(),
                format!("centre {:.4} spacing {:.3}%", next.center, next.spacing * 100.0),
                format!("{} levels, generation {}", next.levels.len(), next.generation),
            ],
        );
        self.grid = Some(next);
        true
    }

    /// Place the orders the grid is missing: paired sells for held levels,
    /// buys below price closest-first up to the live-order cap, and the
    /// carry sell.
    async fn place_grid_orders(&mut self, ctx: &TickContext<'_>, price: f64) -> bool {
        let Some(grid) = self.grid.as_ref() else {
            return false;
        };
        let generation = grid.generation;
        let buy_slots = self
            .config
            .max_open_orders
            .saturating_sub(self.reconciler.grid_order_count());

        let mut intents = Vec::new();
        let mut buys = 0;
        for level in &grid.levels {
            let index = level.index;
            match level.status {
                LevelStatus::Holding => intents.push((
                    OrderTag::GridSell { generation, index },
                    OrderRequest::limit(self.symbol.clone(), OrderSide::Sell, level.quantity, level.sell_price, ""),
                )),
                LevelStatus::Idle if level.buy_price < price && buys < buy_slots => {
                    buys += 1;
                    intents.push((
                        OrderTag::GridBuy { generation, index },
                        OrderRequest::limit(self.symbol.clone(), OrderSide::Buy, level.quantity, level.buy_price, ""),
                    ));
                }
                _ => {}
            }
        }
        if !grid.carry.is_empty() && grid.carry.sell_price.is_none() {
            intents.push((
                OrderTag::Carry { generation },
                OrderRequest::limit(
                    self.symbol.clone(),
                    OrderSide::Sell,
                    grid.carry.carried_qty,
                    grid.carry_sell_price(),
                    "",
                ),
            ));
        }

        let mut mutated = false;
        for (tag, request) in intents {
            let limit_price = request.price.unwrap_or(price);
            let quantity = request.quantity;
            match self.reconciler.submit(ctx.exchange, tag, request).await {
                Ok(Submission::Resting { order_id }) => {
                    debug!(symbol = %self.symbol, %tag, %order_id, price = limit_price, "Grid order placed");
                    self.mark_open(tag, limit_price);
                    mutated = true;
                }
                Ok(Submission::Filled { order_id, price: fill }) => {
                    self.mark_open(tag, limit_price);
                    self.apply_outcome(
                        ctx,
                        OrderOutcome::Filled {
                            tag,
                            order_id,
                            price: fill.unwrap_or(limit_price),
                            quantity,
                        },
                    );
                    mutated = true;
                }
                Ok(Submission::Duplicate) => self.mark_open(tag, limit_price),
                Ok(Submission::Unconfirmed { link_id, error }) => {
                    warn!(symbol = %self.symbol, %tag, %link_id, %error, "Grid order unconfirmed, resolving next tick");
                    self.mark_open(tag, limit_price);
                    mutated = true;
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!(symbol = %self.symbol, %tag, error = %e, "Grid placement interrupted, retrying next tick");
                    break;
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, %tag, error = %e, "Grid order rejected");
                    ctx.notifier.alert(
                        AlertKind::Error,
                        &self.symbol,
                        vec![format!("{} rejected: {}", tag, e)],
                    );
                }
            }
        }
        mutated
    }

    fn mark_open(&mut self, tag: OrderTag, price: f64) {
        let Some(grid) = self.grid.as_mut() else {
            return;
        };
        match tag {
            OrderTag::GridBuy { generation, index } if generation == grid.generation => {
                grid.mark_buy_open(index)
            }
            OrderTag::GridSell { generation, index } if generation == grid.generation => {
                grid.mark_sell_open(index)
            }
            OrderTag::Carry { generation } if generation == grid.generation => {
                grid.mark_carry_open(price)
            }
            _ => {}
        }
    }

    // =========================================================================
    // Position lifecycle
    // =========================================================================

    async fn step_lifecycle(&mut self, ctx: &TickContext<'_>, price: f64) -> bool {
        if let Some(tag) = self.pending_position_order() {
            debug!(symbol = %self.symbol, %tag, "Position order awaiting confirmation, lifecycle paused");
            return false;
        }
        if let Some(stale) = self.pending.take() {
            warn!(symbol = %self.symbol, transition = ?stale, "Pending transition has no live order, dropping");
        }

        let directional = self.config.directional_enabled();
        if !directional && self.book.main.is_none() {
            return false;
        }

        let regime = self.market.regime();
        let entry = if directional && self.book.main.is_none() {
            entry_signal(&self.market.closes(), &self.market.volumes(), regime, &self.config.signal).map(
                |(side, signal)| {
                    debug!(
                        symbol = %self.symbol,
                        %side,
                        rsi = signal.rsi,
                        macd_histogram = signal.macd_histogram,
                        volume_ratio = signal.volume_ratio,
                        "Entry signal"
                    );
                    side
                },
            )
        } else {
            None
        };

        let transitions = lifecycle::plan(&self.book, price, regime, entry, &self.config);
        let mut mutated = false;
        for transition in transitions {
            match self.execute(ctx, &transition, price).await {
                Ok(()) => mutated = true,
                Err(e) => {
                    self.report_failure(ctx, &transition, &e);
                    // An unconfirmed order is tracked and must be saved
                    mutated |= matches!(e, ExecutionError::Unconfirmed { .. });
                    // Later transitions assume this one happened
                    break;
                }
            }
        }
        mutated
    }

    /// Send the order a transition needs, then apply it to the book.
    /// The book is only touched once the exchange accepted the order; an
    /// unconfirmed order parks the transition until the next poll.
    async fn execute(
        &mut self,
        ctx: &TickContext<'_>,
        transition: &Transition,
        price: f64,
    ) -> Result<(), ExecutionError> {
        self.book.check(transition)?;

        let (fill_price, order_id) = match transition.order(&self.book) {
            None => (price, None),
            Some((side, quantity)) => {
                let tag = match transition.slot() {
                    Slot::Main => OrderTag::Main,
                    Slot::Hedge => OrderTag::Hedge,
                };
                let request = OrderRequest::market(self.symbol.clone(), side, quantity, "");
                match self.reconciler.submit(ctx.exchange, tag, request).await? {
                    Submission::Filled { order_id, price: fill } => (fill.unwrap_or(price), Some(order_id)),
                    Submission::Resting { order_id } => (price, Some(order_id)),
                    Submission::Unconfirmed { link_id, error } => {
                        warn!(symbol = %self.symbol, ?transition, %link_id, %error, "Position order unconfirmed, book held until it resolves");
                        self.pending = Some(transition.clone());
                        return Err(ExecutionError::Unconfirmed { tag, link_id });
                    }
                    Submission::Duplicate => return Err(ExecutionError::OrderPending(tag)),
                }
            }
        };

        let trade = self
            .book
            .apply(&self.symbol, transition, fill_price, order_id, ctx.now)?;
        self.announce(ctx, transition, fill_price, trade.as_ref());
        if let Some(trade) = trade {
            self.trades.push(trade);
        }
        Ok(())
    }

    fn announce(&self, ctx: &TickContext<'_>, transition: &Transition, price: f64, trade: Option<&TradeRecord>) {
        let symbol = &self.symbol;
        match transition {
            Transition::OpenMain {
                side,
                size,
                below_min_lot,
                ..
            } => {
                info!("Opened {} {} {:.6} @ {:.4}", side, symbol, size, price);
                ctx.notifier.alert(
                    AlertKind::Open,
                    symbol,
                    vec![format!("{} {:.6} @ {:.4}", side, size, price)],
                );
                if *below_min_lot {
                    warn!(%symbol, min_lot = self.config.min_lot, "Entry size below minimum lot, raised");
                    ctx.notifier.alert(
                        AlertKind::Warn,
                        symbol,
                        vec![format!("size below minimum, using min lot {}", self.config.min_lot)],
                    );
                }
            }
            Transition::OpenHedge { side, size } => {
                info!("Hedged {} with {} {:.6} @ {:.4}", symbol, side, size, price);
                ctx.notifier.alert(
                    AlertKind::Hedge,
                    symbol,
                    vec![format!("{} {:.6} @ {:.4}", side, size, price)],
                );
            }
            Transition::AddToMain { size } => {
                info!("DCA add {} {:.6} @ {:.4}", symbol, size, price);
                ctx.notifier.alert(
                    AlertKind::Info,
                    symbol,
                    vec![format!("DCA add {:.6} @ {:.4}", size, price)],
                );
            }
            Transition::AttachStop { slot, stop } => {
                info!("Protective stop on {} {:?} at {:.4}", symbol, slot, stop);
                ctx.notifier.alert(
                    AlertKind::Stop,
                    symbol,
                    vec![format!("{:?} stop attached at {:.4}", slot, stop)],
                );
            }
            Transition::Close { slot, reason } => {
                if let Some(trade) = trade {
                    info!(
                        "Closed {:?} {} @ {:.4} ({:+.2}%) reason: {}",
                        slot, symbol, price, trade.profit_percent, reason
                    );
                    ctx.notifier.alert(
                        AlertKind::Close,
                        symbol,
                        vec![
                            format!("{:?} {} {:.6}", slot, trade.side, trade.size),
                            format!("{:.4} -> {:.4} ({:+.2}%)", trade.entry_price, trade.exit_price, trade.profit_percent),
                            format!("reason: {}", reason),
                        ],
                    );
                }
            }
        }
    }

    fn report_failure(&self, ctx: &TickContext<'_>, transition: &Transition, err: &ExecutionError) {
        match err {
            ExecutionError::Exchange(e) if e.is_transient() => {
                warn!(symbol = %self.symbol, ?transition, error = %e, "Transition deferred, exchange unavailable");
            }
            ExecutionError::Exchange(e) => {
                error!(symbol = %self.symbol, ?transition, error = %e, "Exchange rejected transition order");
                ctx.notifier.alert(
                    AlertKind::Error,
                    &self.symbol,
                    vec![format!("{:?} abandoned: {}", transition, e)],
                );
            }
            ExecutionError::Transition(e) => {
                warn!(symbol = %self.symbol, ?transition, error = %e, "Transition refused");
            }
            ExecutionError::Unconfirmed { .. } => {
                ctx.notifier.alert(
                    AlertKind::Warn,
                    &self.symbol,
                    vec![format!("{:?}: {}", transition, err)],
                );
            }
            ExecutionError::OrderPending(tag) => {
                debug!(symbol = %self.symbol, %tag, ?transition, "Transition waits for pending order");
            }
        }
    }

    /// Close the hedge (if any) then the main at market
    pub async fn close_manually(&mut self, ctx: &TickContext<'_>) -> Result<Vec<TradeRecord>, ExecutionError> {
        if self.book.main.is_none() {
            return Err(TransitionError::NoMain.into());
        }
        if let Some(tag) = self.pending_position_order() {
            return Err(ExecutionError::OrderPending(tag));
        }
        let price = self
            .market
            .last_price()
            .or_else(|| self.book.main.as_ref().map(|m| m.entry_price))
            .unwrap_or_default();

        let before = self.trades.len();
        let mut transitions = Vec::with_capacity(2);
        if self.book.hedge.is_some() {
            transitions.push(Transition::Close {
                slot: Slot::Hedge,
                reason: CloseReason::MainClosed,
            });
        }
        transitions.push(Transition::Close {
            slot: Slot::Main,
            reason: CloseReason::Manual,
        });

        for transition in &transitions {
            if let Err(e) = self.execute(ctx, transition, price).await {
                self.report_failure(ctx, transition, &e);
                return Err(e);
            }
        }
        Ok(self.trades[before..].to_vec())
    }
}

/// The same transition sized to what actually filled
fn resize(transition: Transition, quantity: f64) -> Transition {
    match transition {
        Transition::OpenMain {
            side,
            take_profit_percent,
            below_min_lot,
            ..
        } => Transition::OpenMain {
            side,
            size: quantity,
            take_profit_percent,
            below_min_lot,
        },
        Transition::OpenHedge { side, .. } => Transition::OpenHedge {
            side,
            size: quantity,
        },
        Transition::AddToMain { .. } => Transition::AddToMain { size: quantity },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyPolicy;
    use crate::exchange::SimulatedExchange;

    fn config() -> SymbolConfig {
        SymbolConfig {
            symbol: "SOLUSDT".into(),
            policy: StrategyPolicy::GridOnly,
            grid_policy: GridPolicy::Anchored,
            grid_steps: 6,
            grid_spacing: 0.01,
            trail_threshold: 0.05,
            max_open_orders: 2,
            ..Default::default()
        }
    }

    fn ctx<'a>(ex: &'a SimulatedExchange, notifier: &'a Notifier) -> TickContext<'a> {
        TickContext {
            exchange: ex,
            notifier,
            candle_interval: "5",
            candle_limit: 50,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_tick_builds_grid_and_respects_order_cap() {
        let ex = SimulatedExchange::new(5);
        let notifier = Notifier::disabled();
        let mut rt = SymbolRuntime::new(config());

        let outcome = rt.tick(&ctx(&ex, &notifier)).await.unwrap();
        assert!(outcome.mutated);
        let grid = rt.grid().unwrap();
        assert_eq!(grid.levels.len(), 6);
        assert_eq!(rt.reconciler().grid_order_count(), 2);
        let price = outcome.price.unwrap();
        assert!(rt
            .reconciler()
            .live_orders()
            .all(|o| o.price.unwrap() < price));
    }

    #[tokio::test]
    async fn test_buy_fill_places_paired_sell() {
        let ex = SimulatedExchange::new(5);
        let notifier = Notifier::disabled();
        let mut rt = SymbolRuntime::new(config());
        let outcome = rt.tick(&ctx(&ex, &notifier)).await.unwrap();
        let price = outcome.price.unwrap();

        // Drop just far enough to take the nearest buy level only
        let nearest = rt
            .reconciler()
            .live_orders()
            .filter_map(|o| o.price)
            .fold(0.0, f64::max);
        ex.push_prices(rt.symbol(), &[nearest * 0.999]).unwrap();
        rt.tick(&ctx(&ex, &notifier)).await.unwrap();

        let grid = rt.grid().unwrap();
        assert!(grid.levels.iter().any(|l| l.status == LevelStatus::SellOpen));
        assert!(rt
            .reconciler()
            .live_orders()
            .any(|o| matches!(o.tag, OrderTag::GridSell { .. })));
        assert!(price > nearest);
    }

    #[tokio::test]
    async fn test_snapshot_restores_live_orders() {
        let ex = SimulatedExchange::new(9);
        let notifier = Notifier::disabled();
        let mut rt = SymbolRuntime::new(config());
        rt.tick(&ctx(&ex, &notifier)).await.unwrap();

        let snapshot = rt.snapshot();
        let restored = SymbolRuntime::from_snapshot(config(), snapshot.clone());
        assert_eq!(restored.reconciler().len(), rt.reconciler().len());
        assert_eq!(restored.grid(), rt.grid());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_manual_close_without_position_is_refused() {
        let ex = SimulatedExchange::new(9);
        let notifier = Notifier::disabled();
        let mut rt = SymbolRuntime::new(config());
        let err = rt.close_manually(&ctx(&ex, &notifier)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Transition(TransitionError::NoMain)));
    }
}
