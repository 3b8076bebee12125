//! Engine
//!
//! Owns one [`SymbolRuntime`] per configured symbol and drives them from a
//! single cooperative loop. Symbols tick sequentially; a symbol whose previous
//! tick is still running is skipped. [`EngineHandle`] is the control surface.

pub mod runtime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError, EngineConfig, SymbolConfigUpdate};
use crate::exchange::Exchange;
use crate::grid::GridState;
use crate::notify::{AlertKind, Notifier};
use crate::state_manager::SqliteStateManager;
use crate::{PerformanceAggregate, Position, Regime, Symbol, TradeRecord};

pub use runtime::{ExecutionError, SymbolRuntime, TickContext, TickOutcome};

/// Failures reported by control operations
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("{failed} grid orders could not be cancelled")]
    CancelIncomplete { failed: usize },
    #[error("persistence failed for {0} symbols")]
    Persistence(usize),
}

/// Read-only view of one symbol
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatus {
    pub symbol: Symbol,
    pub state: String,
    pub regime: Regime,
    pub last_price: Option<f64>,
    pub atr: Option<f64>,
    pub volatility_index: f64,
    pub main: Option<Position>,
    pub hedge: Option<Position>,
    pub grid_generation: Option<u64>,
    pub grid_levels: usize,
    pub live_orders: usize,
    pub trades: usize,
    pub last_tick: Option<DateTime<Utc>>,
}

impl SymbolStatus {
    fn from_runtime(rt: &SymbolRuntime) -> Self {
        Self {
            symbol: rt.symbol().clone(),
            state: rt.book().state().to_string(),
            regime: rt.market().regime(),
            last_price: rt.market().last_price(),
            atr: rt.market().atr(),
            volatility_index: rt.market().volatility_index(),
            main: rt.book().main.clone(),
            hedge: rt.book().hedge.clone(),
            grid_generation: rt.grid().map(|g| g.generation),
            grid_levels: rt.grid().map_or(0, |g| g.levels.len()),
            live_orders: rt.reconciler().len(),
            trades: rt.trades().len(),
            last_tick: rt.last_tick(),
        }
    }
}

struct Shared {
    settings: EngineConfig,
    exchange: Arc<dyn Exchange>,
    store: Arc<SqliteStateManager>,
    notifier: Notifier,
    symbols: BTreeMap<Symbol, Arc<Mutex<SymbolRuntime>>>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    stop_signal: Notify,
}

impl Shared {
    fn context(&self) -> TickContext<'_> {
        TickContext {
            exchange: self.exchange.as_ref(),
            notifier: &self.notifier,
            candle_interval: &self.settings.candle_interval,
            candle_limit: self.settings.candle_limit,
            now: Utc::now(),
        }
    }

    fn runtime(&self, symbol: &str) -> Result<&Arc<Mutex<SymbolRuntime>>, ControlError> {
        self.symbols
            .get(&Symbol::new(symbol))
            .ok_or_else(|| ControlError::UnknownSymbol(symbol.to_string()))
    }

    /// Save one symbol; failures are logged and alerted, never propagated
    fn persist(&self, rt: &SymbolRuntime) -> bool {
        match self.store.save_symbol(&rt.snapshot()) {
            Ok(()) => true,
            Err(e) => {
                error!(symbol = %rt.symbol(), "Failed to persist state: {:#}", e);
                self.notifier.alert(
                    AlertKind::Error,
                    rt.symbol(),
                    vec![format!("state not saved: {:#}", e)],
                );
                false
            }
        }
    }

    async fn flush_all(&self) -> usize {
        let mut failed = 0;
        for runtime in self.symbols.values() {
            let rt = runtime.lock().await;
            if !self.persist(&rt) {
                failed += 1;
            }
        }
        debug!(symbols = self.symbols.len(), failed, "State flushed");
        failed
    }
}

pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Build the engine, loading each symbol's stored state.
    ///
    /// A stored document that cannot be read fails startup; a missing one
    /// starts the symbol flat.
    pub fn new(
        config: &Config,
        exchange: Arc<dyn Exchange>,
        store: Arc<SqliteStateManager>,
        notifier: Notifier,
    ) -> Result<Self> {
        let mut symbols = BTreeMap::new();
        for symbol_config in &config.symbols {
            let symbol = symbol_config.symbol();
            let snapshot = store
                .load_or_default(&symbol)
                .with_context(|| format!("Failed to load state for {}", symbol))?;
            info!(
                "Loaded {}: {} | trades {} | live orders {} | grid {}",
                symbol,
                snapshot.book.state(),
                snapshot.trades.len(),
                snapshot.live_orders.len(),
                snapshot
                    .grid
                    .as_ref()
                    .map_or("none".to_string(), |g| format!("gen {}", g.generation))
            );
            let runtime = SymbolRuntime::from_snapshot(symbol_config.clone(), snapshot);
            symbols.insert(symbol, Arc::new(Mutex::new(runtime)));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                settings: config.engine.clone(),
                exchange,
                store,
                notifier,
                symbols,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                stop_signal: Notify::new(),
            }),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Tick every symbol once, in order
    pub async fn tick_all(&self) {
        let shared = &self.shared;
        for (symbol, runtime) in &shared.symbols {
            if shared.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            let Ok(mut rt) = runtime.try_lock() else {
                debug!(%symbol, "Previous tick still in flight, skipping");
                continue;
            };

            let ctx = shared.context();
            match rt.tick(&ctx).await {
                Ok(outcome) => {
                    if outcome.mutated {
                        shared.persist(&rt);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(%symbol, error = %e, "Market data unavailable, retrying next tick");
                }
                Err(e) => {
                    error!(%symbol, error = %e, "Market data request rejected");
                    shared
                        .notifier
                        .alert(AlertKind::Error, symbol, vec![format!("candles: {}", e)]);
                }
            }
        }
    }

    /// Run until `shutdown` resolves or [`EngineHandle::stop`] is called,
    /// then cancel live orders and flush.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let shared = &self.shared;
        shared.running.store(true, Ordering::SeqCst);

        let mut cycle = interval(Duration::from_secs(shared.settings.tick_interval_secs.max(1)));
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = interval(Duration::from_secs(shared.settings.flush_interval_secs.max(1)));
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick of an interval completes immediately
        flush.tick().await;

        tokio::pin!(shutdown);
        info!(
            "Engine started: {} symbols, tick every {}s",
            shared.symbols.len(),
            shared.settings.tick_interval_secs
        );

        loop {
            if shared.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = cycle.tick() => {
                    self.tick_all().await;
                }
                _ = flush.tick() => {
                    shared.flush_all().await;
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = shared.stop_signal.notified() => {
                    info!("Stop requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Cancel every live order, save every symbol and mark the engine stopped
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.stop_requested.store(true, Ordering::SeqCst);
        info!("Initiating graceful shutdown...");

        for (symbol, runtime) in &shared.symbols {
            let mut rt = runtime.lock().await;
            let ctx = shared.context();
            let report = rt.cancel_all_orders(&ctx).await;
            if !report.is_complete() {
                warn!(%symbol, failed = report.failed.len(), "Some orders could not be cancelled");
                shared.notifier.alert(
                    AlertKind::Warn,
                    symbol,
                    vec![format!("{} orders left live at shutdown", report.failed.len())],
                );
            } else if !report.outcomes.is_empty() {
                info!(%symbol, cancelled = report.outcomes.len(), "Cancelled live orders");
            }
            shared.persist(&rt);
        }

        shared.running.store(false, Ordering::SeqCst);
        shared.notifier.send(crate::notify::Alert::new(
            AlertKind::Info,
            None,
            vec!["engine stopped".to_string()],
        ));
        info!("Engine stopped");
    }
}

/// Control surface; cheap to clone
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Ask the driver to stop before its next tick
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.stop_signal.notify_one();
    }

    /// Rebuild the symbol's grid on its next tick
    pub async fn force_rebalance(&self, symbol: &str) -> Result<(), ControlError> {
        let mut rt = self.shared.runtime(symbol)?.lock().await;
        rt.request_rebalance();
        info!(%symbol, "Rebalance requested");
        Ok(())
    }

    /// Save every symbol now
    pub async fn flush(&self) -> Result<(), ControlError> {
        match self.shared.flush_all().await {
            0 => Ok(()),
            failed => Err(ControlError::Persistence(failed)),
        }
    }

    pub async fn status(&self) -> Vec<SymbolStatus> {
        let mut out = Vec::with_capacity(self.shared.symbols.len());
        for runtime in self.shared.symbols.values() {
            out.push(SymbolStatus::from_runtime(&*runtime.lock().await));
        }
        out
    }

    pub async fn symbol_status(&self, symbol: &str) -> Result<SymbolStatus, ControlError> {
        let rt = self.shared.runtime(symbol)?.lock().await;
        Ok(SymbolStatus::from_runtime(&rt))
    }

    pub async fn grid(&self, symbol: &str) -> Result<Option<GridState>, ControlError> {
        let rt = self.shared.runtime(symbol)?.lock().await;
        Ok(rt.grid().cloned())
    }

    pub async fn trades(&self, symbol: &str) -> Result<Vec<TradeRecord>, ControlError> {
        let rt = self.shared.runtime(symbol)?.lock().await;
        Ok(rt.trades().to_vec())
    }

    pub async fn performance(&self, symbol: &str) -> Result<PerformanceAggregate, ControlError> {
        let rt = self.shared.runtime(symbol)?.lock().await;
        Ok(rt.performance())
    }

    /// Apply a partial config update. Grid orders are cancelled first; if any
    /// cancel fails the update is refused and nothing changes. Otherwise the
    /// grid is re-derived for the new parameters before this returns.
    pub async fn update_config(
        &self,
        symbol: &str,
        update: &SymbolConfigUpdate,
    ) -> Result<(), ControlError> {
        let mut rt = self.shared.runtime(symbol)?.lock().await;
        let next = rt.config().apply(update)?;

        let ctx = self.shared.context();
        let report = rt.cancel_grid_orders(&ctx).await;
        if !report.is_complete() {
            self.shared.persist(&rt);
            return Err(ControlError::CancelIncomplete {
                failed: report.failed.len(),
            });
        }

        rt.reconfigure(next, ctx.now);
        info!(%symbol, "Configuration updated");
        self.shared.notifier.alert(
            AlertKind::Info,
            rt.symbol(),
            vec!["configuration updated".to_string()],
        );
        self.shared.persist(&rt);
        Ok(())
    }

    /// Close the symbol's hedge and main at market
    pub async fn close_position(&self, symbol: &str) -> Result<Vec<TradeRecord>, ControlError> {
        let mut rt = self.shared.runtime(symbol)?.lock().await;
        let ctx = self.shared.context();
        let result = rt.close_manually(&ctx).await;
        // A hedge closed before a failed main close still has to be saved
        self.shared.persist(&rt);
        Ok(result?)
    }
}
