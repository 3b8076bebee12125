//! Exchange access
//!
//! The engine only talks to the [`Exchange`] trait. Two implementations ship:
//! a signed REST client for a Bybit v5 style venue and a seeded paper venue
//! for the simulated data source.

pub mod auth;
pub mod client;
pub mod simulated;
pub mod types;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Candle, OrderSide, OrderType, Symbol};

pub use client::{ExchangeClient, ExchangeClientConfig};
pub use simulated::SimulatedExchange;

/// Failures from an exchange call.
///
/// `Transport`, `Timeout` and `CircuitOpen` are transient and retried on a
/// later tick. `Rejected` is the venue refusing the request; the action is
/// abandoned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("circuit breaker open, request not sent")]
    CircuitOpen,
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::Timeout | ExchangeError::CircuitOpen
        )
    }

    /// A request failing this way may still have been processed by the venue
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::Timeout)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

/// Order lifecycle as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price; ignored for market orders
    pub price: Option<f64>,
    /// Client order id; unique per submission
    pub link_id: String,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: OrderSide, quantity: f64, link_id: impl Into<String>) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            link_id: link_id.into(),
        }
    }

    pub fn limit(
        symbol: Symbol,
        side: OrderSide,
        quantity: f64,
        price: f64,
        link_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            link_id: link_id.into(),
        }
    }
}

/// Acknowledgement of a submitted order
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: String,
    pub status: OrderStatus,
    /// Average fill price when the venue reports one
    pub avg_price: Option<f64>,
}

/// An order as the venue currently sees it
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub link_id: Option<String>,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_price: Option<f64>,
    pub status: OrderStatus,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Candles ordered oldest to newest
    async fn candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError>;

    /// Orders still resting on the book
    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Order-history lookup for an order that left the open list.
    /// `None` when the venue has no record of it.
    async fn order_status(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError>;

    /// Find an order by the client id it was sent with, open or finished.
    /// Used for orders whose acknowledgement never arrived.
    async fn order_by_link_id(
        &self,
        symbol: &Symbol,
        link_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::Transport("reset".into()).is_transient());
        assert!(ExchangeError::CircuitOpen.is_transient());
        assert!(!ExchangeError::Rejected {
            code: 10001,
            message: "bad qty".into()
        }
        .is_transient());
        assert!(!ExchangeError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn test_unsent_request_is_not_ambiguous() {
        assert!(ExchangeError::Timeout.is_ambiguous());
        assert!(ExchangeError::Transport("reset".into()).is_ambiguous());
        assert!(!ExchangeError::CircuitOpen.is_ambiguous());
        assert!(!ExchangeError::Rejected {
            code: 10001,
            message: "bad qty".into()
        }
        .is_ambiguous());
    }

    #[test]
    fn test_order_request_builders() {
        let sym = Symbol::new("ETHUSDT");
        let m = OrderRequest::market(sym.clone(), OrderSide::Buy, 1.0, "main");
        assert_eq!(m.order_type, OrderType::Market);
        assert!(m.price.is_none());

        let l = OrderRequest::limit(sym, OrderSide::Sell, 0.5, 2000.0, "grid-1-0-sell");
        assert_eq!(l.price, Some(2000.0));
        assert_eq!(l.link_id, "grid-1-0-sell");
    }
}
