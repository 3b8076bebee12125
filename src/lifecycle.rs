//! Position lifecycle
//!
//! `FLAT → OPEN → HEDGED → OPEN → ... → CLOSED (FLAT)`
//!
//! [`plan`] is pure: it looks at the book and the current price and returns
//! the transitions due this tick, in execution order. The engine sends the
//! order each transition needs and calls [`PositionBook::apply`] only after
//! the exchange accepted it, so a failed call leaves the book untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SymbolConfig;
use crate::signal::dca_size;
use crate::{CloseReason, OrderSide, Position, PositionSide, Regime, Symbol, TradeLeg, TradeRecord};

/// Slack for percent thresholds that sit exactly on a round number
const PERCENT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Flat,
    Open,
    Hedged,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Flat => write!(f, "FLAT"),
            LifecycleState::Open => write!(f, "OPEN"),
            LifecycleState::Hedged => write!(f, "HEDGED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Main,
    Hedge,
}

impl Slot {
    fn leg(self) -> TradeLeg {
        match self {
            Slot::Main => TradeLeg::Main,
            Slot::Hedge => TradeLeg::Hedge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    OpenMain {
        side: PositionSide,
        size: f64,
        take_profit_percent: f64,
        /// Computed size was below the minimum lot and was raised to it
        below_min_lot: bool,
    },
    OpenHedge {
        side: PositionSide,
        size: f64,
    },
    /// Averaging add to the main position
    AddToMain {
        size: f64,
    },
    AttachStop {
        slot: Slot,
        stop: f64,
    },
    Close {
        slot: Slot,
        reason: CloseReason,
    },
}

impl Transition {
    /// Market order needed before the transition can be applied
    pub fn order(&self, book: &PositionBook) -> Option<(OrderSide, f64)> {
        match self {
            Transition::OpenMain { side, size, .. } | Transition::OpenHedge { side, size } => {
                Some((side.entry_order_side(), *size))
            }
            Transition::AddToMain { size } => {
                let main = book.main.as_ref()?;
                Some((main.side.entry_order_side(), *size))
            }
            Transition::Close { slot, .. } => {
                let position = book.get(*slot)?;
                Some((position.side.exit_order_side(), position.size))
            }
            Transition::AttachStop { .. } => None,
        }
    }

    /// Which slot the transition touches
    pub fn slot(&self) -> Slot {
        match self {
            Transition::OpenMain { .. } | Transition::AddToMain { .. } => Slot::Main,
            Transition::OpenHedge { .. } => Slot::Hedge,
            Transition::AttachStop { slot, .. } | Transition::Close { slot, .. } => *slot,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("a main position is already open")]
    MainAlreadyOpen,
    #[error("no main position")]
    NoMain,
    #[error("a hedge is already open")]
    HedgeAlreadyOpen,
    #[error("no hedge position")]
    NoHedge,
    #[error("hedge must be closed before its main")]
    HedgeStillOpen,
    #[error("hedge side must be the inverse of the main side")]
    HedgeSameSide,
}

/// Main and hedge slots for one symbol. A hedge never exists without a main.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionBook {
    #[serde(default)]
    pub main: Option<Position>,
    #[serde(default)]
    pub hedge: Option<Position>,
}

impl PositionBook {
    pub fn state(&self) -> LifecycleState {
        match (&self.main, &self.hedge) {
            (None, _) => LifecycleState::Flat,
            (Some(_), None) => LifecycleState::Open,
            (Some(_), Some(_)) => LifecycleState::Hedged,
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&Position> {
        match slot {
            Slot::Main => self.main.as_ref(),
            Slot::Hedge => self.hedge.as_ref(),
        }
    }

    /// Whether `transition` can be applied to the current book
    pub fn check(&self, transition: &Transition) -> Result<(), TransitionError> {
        match transition {
            Transition::OpenMain { .. } if self.main.is_some() => Err(TransitionError::MainAlreadyOpen),
            Transition::OpenMain { .. } => Ok(()),
            Transition::OpenHedge { side, .. } => {
                let main = self.main.as_ref().ok_or(TransitionError::NoMain)?;
                if self.hedge.is_some() {
                    return Err(TransitionError::HedgeAlreadyOpen);
                }
                if *side != main.side.inverse() {
                    return Err(TransitionError::HedgeSameSide);
                }
                Ok(())
            }
            Transition::AddToMain { .. } => self.main.as_ref().map(|_| ()).ok_or(TransitionError::NoMain),
            Transition::AttachStop { slot, .. } => self.require(*slot),
            Transition::Close { slot: Slot::Main, .. } if self.hedge.is_some() => {
                Err(TransitionError::HedgeStillOpen)
            }
            Transition::Close { slot, .. } => self.require(*slot),
        }
    }

    fn require(&self, slot: Slot) -> Result<(), TransitionError> {
        match slot {
            Slot::Main => self.main.as_ref().map(|_| ()).ok_or(TransitionError::NoMain),
            Slot::Hedge => self.hedge.as_ref().map(|_| ()).ok_or(TransitionError::NoHedge),
        }
    }

    /// Apply a transition whose order (if any) has been filled at `fill_price`.
    ///
    /// Returns the trade record for closes. The book is unchanged on error.
    pub fn apply(
        &mut self,
        symbol: &Symbol,
        transition: &Transition,
        fill_price: f64,
        order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, TransitionError> {
        self.check(transition)?;

        match transition {
            Transition::OpenMain {
                side,
                size,
                take_profit_percent,
                ..
            } => {
                self.main = Some(Position {
                    id: format!("main-{}", now.timestamp_millis()),
                    side: *side,
                    entry_price: fill_price,
                    size: *size,
                    opened_at: now,
                    stop_loss: None,
                    take_profit_percent: Some(*take_profit_percent),
                    order_id,
                    protects: None,
                    dca_count: 0,
                });
                Ok(None)
            }
            Transition::OpenHedge { side, size } => {
                let protects = self.main.as_ref().map(|m| m.id.clone());
                self.hedge = Some(Position {
                    id: format!("hedge-{}", now.timestamp_millis()),
                    side: *side,
                    entry_price: fill_price,
                    size: *size,
                    opened_at: now,
                    stop_loss: None,
                    take_profit_percent: None,
                    order_id,
                    protects,
                    dca_count: 0,
                });
                Ok(None)
            }
            Transition::AddToMain { size } => {
                if let Some(main) = self.main.as_mut() {
                    let total = main.size + size;
                    main.entry_price = (main.entry_price * main.size + fill_price * size) / total;
                    main.size = total;
                    main.dca_count += 1;
                }
                Ok(None)
            }
            Transition::AttachStop { slot, stop } => {
                let position = match slot {
                    Slot::Main => self.main.as_mut(),
                    Slot::Hedge => self.hedge.as_mut(),
                };
                if let Some(position) = position {
                    position.attach_stop(*stop);
                }
                Ok(None)
            }
            Transition::Close { slot, reason } => {
                let closed = match slot {
                    Slot::Main => self.main.take(),
                    Slot::Hedge => self.hedge.take(),
                };
                Ok(closed.map(|position| {
                    TradeRecord::from_close(symbol, slot.leg(), &position, fill_price, now, *reason)
                }))
            }
        }
    }
}

/// Entry size: `capital·risk%·leverage/price`, floored at the minimum lot.
///
/// The flag is set when the floor was applied.
pub fn entry_size(price: f64, config: &SymbolConfig) -> (f64, bool) {
    if price <= 0.0 {
        return (config.min_lot, true);
    }
    let size = config.capital * config.risk_percent / 100.0 * config.leverage / price;
    if size < config.min_lot {
        (config.min_lot, true)
    } else {
        (size, false)
    }
}

fn close_main(book: &PositionBook, reason: CloseReason) -> Vec<Transition> {
    let mut out = Vec::with_capacity(2);
    if book.hedge.is_some() {
        out.push(Transition::Close {
            slot: Slot::Hedge,
            reason: CloseReason::MainClosed,
        });
    }
    out.push(Transition::Close {
        slot: Slot::Main,
        reason,
    });
    out
}

/// Transitions due at `price`, in the order they must be executed.
///
/// `entry` is the direction the entry signal asks for, only consulted while
/// flat.
pub fn plan(
    book: &PositionBook,
    price: f64,
    regime: Regime,
    entry: Option<PositionSide>,
    config: &SymbolConfig,
) -> Vec<Transition> {
    let Some(main) = book.main.as_ref() else {
        return entry
            .map(|side| {
                let (size, below_min_lot) = entry_size(price, config);
                vec![Transition::OpenMain {
                    side,
                    size,
                    take_profit_percent: config.main_tp_percent,
                    below_min_lot,
                }]
            })
            .unwrap_or_default();
    };

    let main_profit = main.profit_percent(price);

    // Take-profit ends the tick for this symbol.
    if let Some(tp) = main.take_profit_percent {
        if main_profit >= tp - PERCENT_TOLERANCE {
            return close_main(book, CloseReason::TakeProfit);
        }
    }
    if main.stop_crossed(price) {
        return close_main(book, CloseReason::StopLoss);
    }

    let mut out = Vec::new();

    if let Some(hedge) = book.hedge.as_ref() {
        if hedge.stop_crossed(price) {
            out.push(Transition::Close {
                slot: Slot::Hedge,
                reason: CloseReason::HedgeStopLoss,
            });
        } else if hedge.stop_loss.is_none()
            && hedge.profit_percent(price) >= config.hedge_tp_percent - PERCENT_TOLERANCE
        {
            out.push(Transition::AttachStop {
                slot: Slot::Hedge,
                stop: hedge
                    .side
                    .price_at_profit(hedge.entry_price, config.hedge_protection_percent),
            });
        }
    }

    if main.stop_loss.is_none() && main_profit > config.main_protection_start_percent {
        out.push(Transition::AttachStop {
            slot: Slot::Main,
            stop: main
                .side
                .price_at_profit(main.entry_price, config.main_protection_percent),
        });
    }

    // A hedge closed this tick is only re-evaluated on the next one.
    if book.hedge.is_none() {
        if main_profit <= -(config.hedge_loss_percent - PERCENT_TOLERANCE) {
            out.push(Transition::OpenHedge {
                side: main.side.inverse(),
                size: main.size,
            });
        } else if let Some(size) = dca_size(main, price, regime, &config.dca) {
            out.push(Transition::AddToMain { size });
        }
    }

    out
}
