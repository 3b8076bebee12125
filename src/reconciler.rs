//! Order reconciliation
//!
//! Tracks the orders a symbol has resting on the venue, keyed by correlation
//! tag. A tag can only be live once, so resubmitting the same intent is a
//! no-op. Each poll compares the live set with the venue's open-order list;
//! orders that left the list are resolved through an order-history lookup.
//!
//! Every submission carries a fresh link id (client order id). When the
//! acknowledgement is lost the order is still tracked, by link id, and the
//! next poll finds out whether it reached the venue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::exchange::{Exchange, ExchangeError, ExchangeOrder, OrderRequest, OrderStatus};
use crate::{OrderSide, OrderType, Symbol};

/// What an order is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OrderTag {
    Main,
    Hedge,
    GridBuy { generation: u64, index: usize },
    GridSell { generation: u64, index: usize },
    /// Single sell offering inventory carried over from earlier grids
    Carry { generation: u64 },
}

impl OrderTag {
    pub fn is_grid(&self) -> bool {
        matches!(
            self,
            OrderTag::GridBuy { .. } | OrderTag::GridSell { .. } | OrderTag::Carry { .. }
        )
    }
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderTag::Main => write!(f, "main"),
            OrderTag::Hedge => write!(f, "hedge"),
            OrderTag::GridBuy { generation, index } => write!(f, "grid-{}-{}-buy", generation, index),
            OrderTag::GridSell { generation, index } => {
                write!(f, "grid-{}-{}-sell", generation, index)
            }
            OrderTag::Carry { generation } => write!(f, "grid-{}-carry", generation),
        }
    }
}

impl FromStr for OrderTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => return Ok(OrderTag::Main),
            "hedge" => return Ok(OrderTag::Hedge),
            _ => {}
        }
        let parts: Vec<&str> = s.split('-').collect();
        let bad = || format!("unrecognised order tag {:?}", s);
        match parts.as_slice() {
            ["grid", generation, "carry"] => Ok(OrderTag::Carry {
                generation: generation.parse().map_err(|_| bad())?,
            }),
            ["grid", generation, index, side] => {
                let generation = generation.parse().map_err(|_| bad())?;
                let index = index.parse().map_err(|_| bad())?;
                match *side {
                    "buy" => Ok(OrderTag::GridBuy { generation, index }),
                    "sell" => Ok(OrderTag::GridSell { generation, index }),
                    _ => Err(bad()),
                }
            }
            _ => Err(bad()),
        }
    }
}

impl TryFrom<String> for OrderTag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrderTag> for String {
    fn from(tag: OrderTag) -> Self {
        tag.to_string()
    }
}

/// An order believed to be resting on the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveOrder {
    pub tag: OrderTag,
    /// Venue id; `None` while the venue has not acknowledged the order
    pub order_id: Option<String>,
    /// Client order id the order was sent with
    #[serde(default)]
    pub link_id: String,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub quantity: f64,
    pub placed_at: DateTime<Utc>,
}

impl LiveOrder {
    pub fn is_confirmed(&self) -> bool {
        self.order_id.is_some()
    }

    fn matches(&self, order: &ExchangeOrder) -> bool {
        match &self.order_id {
            Some(id) => order.order_id == *id,
            None => order.link_id.as_deref() == Some(self.link_id.as_str()),
        }
    }

    /// Venue id when known, the link id otherwise
    fn reference(&self) -> String {
        self.order_id.clone().unwrap_or_else(|| self.link_id.clone())
    }
}

/// Client order id for one submission of `tag`
fn link_id(tag: &OrderTag, at: DateTime<Utc>) -> String {
    format!("{}-{}", tag, at.timestamp_micros())
}

/// How a live order ended
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled {
        tag: OrderTag,
        order_id: String,
        price: f64,
        quantity: f64,
    },
    /// Finished after filling only `quantity`
    PartiallyFilled {
        tag: OrderTag,
        order_id: String,
        price: f64,
        quantity: f64,
    },
    Cancelled {
        tag: OrderTag,
        order_id: String,
    },
}

impl OrderOutcome {
    pub fn tag(&self) -> OrderTag {
        match self {
            OrderOutcome::Filled { tag, .. }
            | OrderOutcome::PartiallyFilled { tag, .. }
            | OrderOutcome::Cancelled { tag, .. } => *tag,
        }
    }
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Filled on acceptance (market orders)
    Filled { order_id: String, price: Option<f64> },
    /// Resting on the book and now tracked
    Resting { order_id: String },
    /// Sent, but the acknowledgement was lost. The order is tracked under its
    /// link id until a poll finds out what became of it.
    Unconfirmed { link_id: String, error: ExchangeError },
    /// The tag was already live; nothing was sent
    Duplicate,
}

/// Outcome of cancelling a batch of orders
#[derive(Debug, Default)]
pub struct CancelReport {
    pub outcomes: Vec<OrderOutcome>,
    /// Orders whose cancel failed and are still tracked as live
    pub failed: Vec<(OrderTag, ExchangeError)>,
}

impl CancelReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What the venue knows about a tracked order
enum Lookup {
    Open { order_id: String },
    Finished(OrderOutcome),
}

#[derive(Debug, Clone)]
pub struct OrderReconciler {
    symbol: Symbol,
    live: BTreeMap<OrderTag, LiveOrder>,
}

impl OrderReconciler {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            live: BTreeMap::new(),
        }
    }

    /// Resume tracking orders persisted before a restart
    pub fn with_live_orders(symbol: Symbol, orders: Vec<LiveOrder>) -> Self {
        let live = orders.into_iter().map(|o| (o.tag, o)).collect();
        Self { symbol, live }
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &LiveOrder> {
        self.live.values()
    }

    pub fn snapshot(&self) -> Vec<LiveOrder> {
        self.live.values().cloned().collect()
    }

    pub fn is_live(&self, tag: &OrderTag) -> bool {
        self.live.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn grid_order_count(&self) -> usize {
        self.live.keys().filter(|t| t.is_grid()).count()
    }

    /// Send `request` under `tag` unless that tag is already live.
    ///
    /// Nothing is tracked when the venue rejects the order or the request
    /// never left. A failure that may have reached the venue is tracked as
    /// unconfirmed.
    pub async fn submit(
        &mut self,
        exchange: &dyn Exchange,
        tag: OrderTag,
        mut request: OrderRequest,
    ) -> Result<Submission, ExchangeError> {
        if self.live.contains_key(&tag) {
            debug!(symbol = %self.symbol, %tag, "Tag already live, skipping submission");
            return Ok(Submission::Duplicate);
        }

        let placed_at = Utc::now();
        request.link_id = link_id(&tag, placed_at);
        let mut order = LiveOrder {
            tag,
            order_id: None,
            link_id: request.link_id.clone(),
            side: request.side,
            price: request.price,
            quantity: request.quantity,
            placed_at,
        };

        let placed = match exchange.place_order(&request).await {
            Ok(placed) => placed,
            Err(error) if error.is_ambiguous() => {
                warn!(symbol = %self.symbol, %tag, link_id = %order.link_id, %error, "Order acknowledgement lost, tracking as unconfirmed");
                self.live.insert(tag, order);
                return Ok(Submission::Unconfirmed {
                    link_id: request.link_id,
                    error,
                });
            }
            Err(error) => return Err(error),
        };

        // Market orders are never left resting, so they are not tracked
        if placed.status == OrderStatus::Filled || request.order_type == OrderType::Market {
            return Ok(Submission::Filled {
                order_id: placed.order_id,
                price: placed.avg_price,
            });
        }

        order.order_id = Some(placed.order_id.clone());
        self.live.insert(tag, order);
        Ok(Submission::Resting {
            order_id: placed.order_id,
        })
    }

    /// Compare the live set with the venue and resolve orders that left it.
    ///
    /// Unconfirmed orders found on the book become confirmed. Orders whose
    /// history lookup fails stay live and are retried next poll.
    pub async fn poll(&mut self, exchange: &dyn Exchange) -> Result<Vec<OrderOutcome>, ExchangeError> {
        if self.live.is_empty() {
            return Ok(Vec::new());
        }

        let open = exchange.open_orders(&self.symbol).await?;
        let mut missing = Vec::new();
        for order in self.live.values_mut() {
            match open.iter().find(|o| order.matches(o)) {
                Some(listed) if !order.is_confirmed() => {
                    debug!(symbol = %self.symbol, tag = %order.tag, order_id = %listed.order_id, "Unconfirmed order found on the book");
                    order.order_id = Some(listed.order_id.clone());
                }
                Some(_) => {}
                None => missing.push(order.clone()),
            }
        }

        let mut outcomes = Vec::new();
        for order in missing {
            match self.lookup(exchange, &order).await {
                Ok(Lookup::Finished(outcome)) => {
                    self.live.remove(&order.tag);
                    outcomes.push(outcome);
                }
                Ok(Lookup::Open { order_id }) => self.confirm(&order.tag, order_id),
                Err(err) => {
                    warn!(symbol = %self.symbol, tag = %order.tag, error = %err, "Order history lookup failed");
                }
            }
        }
        Ok(outcomes)
    }

    fn confirm(&mut self, tag: &OrderTag, order_id: String) {
        if let Some(order) = self.live.get_mut(tag) {
            order.order_id = Some(order_id);
        }
    }

    /// Look an order up in the venue's history, by venue id when it is known
    /// and by link id otherwise.
    async fn lookup(&self, exchange: &dyn Exchange, order: &LiveOrder) -> Result<Lookup, ExchangeError> {
        let found = match &order.order_id {
            Some(id) => exchange.order_status(&self.symbol, id).await?,
            None => exchange.order_by_link_id(&self.symbol, &order.link_id).await?,
        };

        let Some(found) = found else {
            if order.is_confirmed() {
                warn!(symbol = %self.symbol, tag = %order.tag, order_id = %order.reference(), "Order unknown to venue, dropping");
            } else {
                info!(symbol = %self.symbol, tag = %order.tag, link_id = %order.link_id, "Unconfirmed order never reached the venue");
            }
            return Ok(Lookup::Finished(OrderOutcome::Cancelled {
                tag: order.tag,
                order_id: order.reference(),
            }));
        };

        if found.status.is_open() {
            return Ok(Lookup::Open {
                order_id: found.order_id,
            });
        }

        let price = found.avg_price.or(found.price).or(order.price).unwrap_or_default();
        let outcome = if found.status == OrderStatus::Filled {
            OrderOutcome::Filled {
                tag: order.tag,
                price,
                quantity: if found.filled_quantity > 0.0 {
                    found.filled_quantity
                } else {
                    order.quantity
                },
                order_id: found.order_id,
            }
        } else if found.filled_quantity > 0.0 {
            OrderOutcome::PartiallyFilled {
                tag: order.tag,
                price,
                quantity: found.filled_quantity,
                order_id: found.order_id,
            }
        } else {
            OrderOutcome::Cancelled {
                tag: order.tag,
                order_id: found.order_id,
            }
        };
        Ok(Lookup::Finished(outcome))
    }

    /// Cancel one live order.
    ///
    /// The venue's record is consulted afterwards, so fills that happened
    /// before the cancel are reported. A rejected cancel usually means the
    /// order already finished; an order that filled in the meantime comes
    /// back as `Filled`.
    pub async fn cancel(
        &mut self,
        exchange: &dyn Exchange,
        tag: &OrderTag,
    ) -> Result<Option<OrderOutcome>, ExchangeError> {
        let Some(mut order) = self.live.get(tag).cloned() else {
            return Ok(None);
        };

        let order_id = match order.order_id.clone() {
            Some(id) => id,
            None => match self.lookup(exchange, &order).await? {
                Lookup::Open { order_id } => {
                    self.confirm(tag, order_id.clone());
                    order.order_id = Some(order_id.clone());
                    order_id
                }
                Lookup::Finished(outcome) => {
                    self.live.remove(tag);
                    return Ok(Some(outcome));
                }
            },
        };

        match exchange.cancel_order(&self.symbol, &order_id).await {
            Ok(()) => {
                self.live.remove(tag);
                let outcome = match self.lookup(exchange, &order).await {
                    Ok(Lookup::Finished(outcome)) => outcome,
                    Ok(Lookup::Open { .. }) => OrderOutcome::Cancelled {
                        tag: order.tag,
                        order_id,
                    },
                    Err(err) => {
                        warn!(symbol = %self.symbol, %tag, error = %err, "Fill check after cancel failed, assuming no fills");
                        OrderOutcome::Cancelled {
                            tag: order.tag,
                            order_id,
                        }
                    }
                };
                Ok(Some(outcome))
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                debug!(symbol = %self.symbol, %tag, error = %err, "Cancel rejected, checking history");
                match self.lookup(exchange, &order).await? {
                    Lookup::Finished(outcome) => {
                        self.live.remove(tag);
                        Ok(Some(outcome))
                    }
                    Lookup::Open { .. } => Err(err),
                }
            }
        }
    }

    /// Cancel every live order whose tag matches. Failures are reported, not
    /// fatal; those orders stay live.
    pub async fn cancel_matching<F>(&mut self, exchange: &dyn Exchange, pred: F) -> CancelReport
    where
        F: Fn(&OrderTag) -> bool,
    {
        let tags: Vec<OrderTag> = self.live.keys().filter(|t| pred(*t)).copied().collect();
        let mut report = CancelReport::default();
        for tag in tags {
            match self.cancel(exchange, &tag).await {
                Ok(Some(outcome)) => report.outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => report.failed.push((tag, err)),
            }
        }
        report
    }

    pub async fn cancel_all(&mut self, exchange: &dyn Exchange) -> CancelReport {
        self.cancel_matching(exchange, |_| true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PlacedOrder, SimulatedExchange};
    use crate::Candle;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    async fn venue() -> (SimulatedExchange, f64) {
        let ex = SimulatedExchange::new(11);
        let candles = ex.candles(&sym(), "5", 5).await.unwrap();
        let last = candles.last().unwrap().close;
        (ex, last)
    }

    fn grid_buy(price: f64) -> OrderRequest {
        OrderRequest::limit(sym(), OrderSide::Buy, 1.0, price, "")
    }

    #[test]
    fn test_tag_round_trip_through_string() {
        let tags = [
            OrderTag::Main,
            OrderTag::Hedge,
            OrderTag::GridBuy { generation: 3, index: 7 },
            OrderTag::GridSell { generation: 0, index: 12 },
            OrderTag::Carry { generation: 4 },
        ];
        for tag in tags {
            assert_eq!(tag.to_string().parse::<OrderTag>().unwrap(), tag);
        }
        assert!("grid-x-1-buy".parse::<OrderTag>().is_err());
        assert!("main-1".parse::<OrderTag>().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_tag_is_not_resubmitted() {
        let (ex, last) = venue().await;
        let mut rec = OrderReconciler::new(sym());
        let tag = OrderTag::GridBuy { generation: 0, index: 1 };

        let first = rec.submit(&ex, tag, grid_buy(last * 0.9)).await.unwrap();
        assert!(matches!(first, Submission::Resting { .. }));
        let second = rec.submit(&ex, tag, grid_buy(last * 0.9)).await.unwrap();
        assert_eq!(second, Submission::Duplicate);

        assert_eq!(ex.open_orders(&sym()).await.unwrap().len(), 1);
        assert_eq!(rec.len(), 1);
    }

    #[tokio::test]
    async fn test_market_order_is_not_tracked() {
        let (ex, _) = venue().await;
        let mut rec = OrderReconciler::new(sym());
        let req = OrderRequest::market(sym(), OrderSide::Buy, 0.5, "");
        let sub = rec.submit(&ex, OrderTag::Main, req).await.unwrap();
        assert!(matches!(sub, Submission::Filled { price: Some(_), .. }));
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_leaves_nothing_tracked() {
        let (ex, _) = venue().await;
        let mut rec = OrderReconciler::new(sym());
        let bad = OrderRequest::limit(sym(), OrderSide::Buy, 0.0, 1.0, "");
        let err = rec
            .submit(&ex, OrderTag::GridBuy { generation: 0, index: 0 }, bad)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { .. }));
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn test_poll_resolves_fills_from_history() {
        let (ex, last) = venue().await;
        let mut rec = OrderReconciler::new(sym());
        let tag = OrderTag::GridBuy { generation: 0, index: 2 };
        rec.submit(&ex, tag, grid_buy(last * 0.99)).await.unwrap();

        assert!(rec.poll(&ex).await.unwrap().is_empty());

        ex.push_prices(&sym(), &[last * 0.97]).unwrap();
        ex.candles(&sym(), "5", 5).await.unwrap();

        let outcomes = rec.poll(&ex).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            OrderOutcome::Filled { tag: t, price, .. } => {
                assert_eq!(*t, tag);
                assert!((price - last * 0.99).abs() < 1e-9);
            }
            other => panic!("expected fill, got {:?}", other),
        }
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_clears_live_set() {
        let (ex, last) = venue().await;
        let mut rec = OrderReconciler::new(sym());
        for i in 0..3 {
            rec.submit(
                &ex,
                OrderTag::GridBuy { generation: 1, index: i },
                grid_buy(last * (0.9 - i as f64 * 0.01)),
            )
            .await
            .unwrap();
        }
        let report = rec.cancel_all(&ex).await;
        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 3);
        assert!(rec.is_empty());
        assert!(ex.open_orders(&sym()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_fill_reports_fill() {
        let (ex, last) = venue().await;
        let mut rec = OrderReconciler::new(sym());
        let tag = OrderTag::GridBuy { generation: 0, index: 0 };
        rec.submit(&ex, tag, grid_buy(last * 0.99)).await.unwrap();

        ex.push_prices(&sym(), &[last * 0.95]).unwrap();
        ex.candles(&sym(), "5", 5).await.unwrap();

        let outcome = rec.cancel(&ex, &tag).await.unwrap();
        assert!(matches!(outcome, Some(OrderOutcome::Filled { .. })));
        assert!(!rec.is_live(&tag));
    }

    #[test]
    fn test_live_orders_restore() {
        let order = LiveOrder {
            tag: OrderTag::Carry { generation: 2 },
            order_id: Some("x".into()),
            link_id: "grid-2-carry-1".into(),
            side: OrderSide::Sell,
            price: Some(101.0),
            quantity: 0.3,
            placed_at: Utc::now(),
        };
        let json = serde_json::to_string(&order).unwrap();
        assert!(json.contains("\"grid-2-carry\""));
        let back: LiveOrder = serde_json::from_str(&json).unwrap();
        let rec = OrderReconciler::with_live_orders(sym(), vec![back]);
        assert!(rec.is_live(&OrderTag::Carry { generation: 2 }));
        assert_eq!(rec.grid_order_count(), 1);
    }

    #[test]
    fn test_link_ids_are_unique_per_submission() {
        let tag = OrderTag::GridBuy { generation: 3, index: 1 };
        let at = Utc::now();
        let first = link_id(&tag, at);
        let second = link_id(&tag, at + chrono::Duration::microseconds(1));
        assert!(first.starts_with("grid-3-1-buy-"));
        assert_ne!(first, second);
    }

    /// Venue that accepts orders but can drop the acknowledgement, and can
    /// finish an order with a partial fill.
    #[derive(Default)]
    struct Book {
        open: Vec<ExchangeOrder>,
        history: Vec<ExchangeOrder>,
        lose_acks: bool,
        next_id: u64,
    }

    #[derive(Default)]
    struct FlakyVenue {
        book: Mutex<Book>,
    }

    impl FlakyVenue {
        fn lose_acks(&self, lose: bool) {
            self.book.lock().unwrap().lose_acks = lose;
        }

        fn open_count(&self) -> usize {
            self.book.lock().unwrap().open.len()
        }

        /// Fill `quantity` of the resting order at `price`, then cancel the rest
        fn partial_fill_then_cancel(&self, order_id: &str, quantity: f64, price: f64) {
            let mut book = self.book.lock().unwrap();
            let pos = book.open.iter().position(|o| o.order_id == order_id).unwrap();
            let mut order = book.open.remove(pos);
            order.filled_quantity = quantity;
            order.avg_price = Some(price);
            order.status = OrderStatus::Cancelled;
            book.history.push(order);
        }

        fn partial_fill(&self, order_id: &str, quantity: f64, price: f64) {
            let mut book = self.book.lock().unwrap();
            let order = book.open.iter_mut().find(|o| o.order_id == order_id).unwrap();
            order.filled_quantity = quantity;
            order.avg_price = Some(price);
            order.status = OrderStatus::PartiallyFilled;
        }
    }

    #[async_trait]
    impl Exchange for FlakyVenue {
        async fn candles(&self, _: &Symbol, _: &str, _: u32) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError> {
            let mut book = self.book.lock().unwrap();
            book.next_id += 1;
            let order_id = format!("v-{}", book.next_id);
            let mut order = ExchangeOrder {
                order_id: order_id.clone(),
                link_id: Some(request.link_id.clone()),
                side: request.side,
                price: request.price,
                quantity: request.quantity,
                filled_quantity: 0.0,
                avg_price: None,
                status: OrderStatus::New,
            };
            let status = if request.order_type == OrderType::Market {
                order.status = OrderStatus::Filled;
                order.filled_quantity = request.quantity;
                order.avg_price = Some(100.0);
                book.history.push(order);
                OrderStatus::Filled
            } else {
                book.open.push(order);
                OrderStatus::New
            };
            if book.lose_acks {
                return Err(ExchangeError::Timeout);
            }
            Ok(PlacedOrder {
                order_id,
                status,
                avg_price: (status == OrderStatus::Filled).then_some(100.0),
            })
        }

        async fn cancel_order(&self, _: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
            let mut book = self.book.lock().unwrap();
            let Some(pos) = book.open.iter().position(|o| o.order_id == order_id) else {
                return Err(ExchangeError::Rejected {
                    code: 110001,
                    message: "order not exists".into(),
                });
            };
            let mut order = book.open.remove(pos);
            order.status = OrderStatus::Cancelled;
            book.history.push(order);
            Ok(())
        }

        async fn open_orders(&self, _: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(self.book.lock().unwrap().open.clone())
        }

        async fn order_status(&self, _: &Symbol, order_id: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
            let book = self.book.lock().unwrap();
            Ok(book
                .open
                .iter()
                .chain(book.history.iter())
                .find(|o| o.order_id == order_id)
                .cloned())
        }

        async fn order_by_link_id(&self, _: &Symbol, link_id: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
            let book = self.book.lock().unwrap();
            Ok(book
                .open
                .iter()
                .chain(book.history.iter())
                .find(|o| o.link_id.as_deref() == Some(link_id))
                .cloned())
        }
    }

    #[tokio::test]
    async fn test_lost_ack_is_tracked_and_not_resubmitted() {
        let venue = FlakyVenue::default();
        venue.lose_acks(true);
        let mut rec = OrderReconciler::new(sym());
        let tag = OrderTag::GridBuy { generation: 0, index: 0 };

        let sub = rec.submit(&venue, tag, grid_buy(95.0)).await.unwrap();
        assert!(matches!(
            sub,
            Submission::Unconfirmed { error: ExchangeError::Timeout, .. }
        ));
        assert!(rec.is_live(&tag));

        let again = rec.submit(&venue, tag, grid_buy(95.0)).await.unwrap();
        assert_eq!(again, Submission::Duplicate);
        assert_eq!(venue.open_count(), 1);

        // The order is on the book: it becomes confirmed and stays live
        assert!(rec.poll(&venue).await.unwrap().is_empty());
        let live = rec.live_orders().next().unwrap();
        assert_eq!(live.order_id.as_deref(), Some("v-1"));

        let report = rec.cancel_all(&venue).await;
        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(venue.open_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_ack_on_market_order_resolves_as_fill() {
        let venue = FlakyVenue::default();
        venue.lose_acks(true);
        let mut rec = OrderReconciler::new(sym());

        let req = OrderRequest::market(sym(), OrderSide::Buy, 0.5, "");
        let sub = rec.submit(&venue, OrderTag::Main, req).await.unwrap();
        assert!(matches!(sub, Submission::Unconfirmed { .. }));

        let outcomes = rec.poll(&venue).await.unwrap();
        assert_eq!(
            outcomes,
            vec![OrderOutcome::Filled {
                tag: OrderTag::Main,
                order_id: "v-1".into(),
                price: 100.0,
                quantity: 0.5,
            }]
        );
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_order_missing_from_venue_is_dropped() {
        let (ex, last) = venue().await;
        let mut rec = OrderReconciler::with_live_orders(
            sym(),
            vec![LiveOrder {
                tag: OrderTag::Hedge,
                order_id: None,
                link_id: "hedge-1".into(),
                side: OrderSide::Sell,
                price: None,
                quantity: 1.0,
                placed_at: Utc::now(),
            }],
        );
        rec.submit(&ex, OrderTag::GridBuy { generation: 0, index: 0 }, grid_buy(last * 0.9))
            .await
            .unwrap();

        let outcomes = rec.poll(&ex).await.unwrap();
        assert_eq!(
            outcomes,
            vec![OrderOutcome::Cancelled {
                tag: OrderTag::Hedge,
                order_id: "hedge-1".into(),
            }]
        );
        assert_eq!(rec.len(), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_is_not_tracked() {
        struct Closed;

        #[async_trait]
        impl Exchange for Closed {
            async fn candles(&self, _: &Symbol, _: &str, _: u32) -> Result<Vec<Candle>, ExchangeError> {
                Err(ExchangeError::CircuitOpen)
            }
            async fn place_order(&self, _: &OrderRequest) -> Result<PlacedOrder, ExchangeError> {
                Err(ExchangeError::CircuitOpen)
            }
            async fn cancel_order(&self, _: &Symbol, _: &str) -> Result<(), ExchangeError> {
                Err(ExchangeError::CircuitOpen)
            }
            async fn open_orders(&self, _: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
                Err(ExchangeError::CircuitOpen)
            }
            async fn order_status(&self, _: &Symbol, _: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
                Err(ExchangeError::CircuitOpen)
            }
            async fn order_by_link_id(&self, _: &Symbol, _: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
                Err(ExchangeError::CircuitOpen)
            }
        }

        let mut rec = OrderReconciler::new(sym());
        let err = rec.submit(&Closed, OrderTag::Main, grid_buy(1.0)).await.unwrap_err();
        assert_eq!(err, ExchangeError::CircuitOpen);
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_before_cancel_is_reported() {
        let venue = FlakyVenue::default();
        let mut rec = OrderReconciler::new(sym());
        let tag = OrderTag::GridBuy { generation: 1, index: 0 };
        rec.submit(&venue, tag, grid_buy(95.0)).await.unwrap();

        venue.partial_fill("v-1", 0.4, 95.0);
        let outcome = rec.cancel(&venue, &tag).await.unwrap();
        assert_eq!(
            outcome,
            Some(OrderOutcome::PartiallyFilled {
                tag,
                order_id: "v-1".into(),
                price: 95.0,
                quantity: 0.4,
            })
        );
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn test_poll_reports_partially_filled_cancel() {
        let venue = FlakyVenue::default();
        let mut rec = OrderReconciler::new(sym());
        let tag = OrderTag::GridSell { generation: 2, index: 3 };
        let req = OrderRequest::limit(sym(), OrderSide::Sell, 1.0, 105.0, "");
        rec.submit(&venue, tag, req).await.unwrap();

        venue.partial_fill_then_cancel("v-1", 0.25, 105.0);
        let outcomes = rec.poll(&venue).await.unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [OrderOutcome::PartiallyFilled { quantity, .. }] if *quantity == 0.25
        ));
    }
}
