//! Paper venue for the simulated data source
//!
//! Each `candles` call advances a seeded random walk by one bar. Market orders
//! fill immediately at the last close; limit orders fill at their limit price
//! once a later bar trades through it. Prices can be scripted with
//! [`SimulatedExchange::push_prices`] to replay a fixed path.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{Exchange, ExchangeError, ExchangeOrder, OrderRequest, OrderStatus, PlacedOrder};
use crate::{Candle, OrderSide, OrderType, Symbol};

const DEFAULT_START_PRICE: f64 = 100.0;

/// Per-bar return range of the walk
const BAR_VOLATILITY: f64 = 0.004;

#[derive(Debug)]
struct Feed {
    bars: VecDeque<Candle>,
    scripted: VecDeque<f64>,
    interval: Duration,
}

#[derive(Debug)]
struct Venue {
    rng: StdRng,
    feeds: HashMap<Symbol, Feed>,
    start_prices: HashMap<Symbol, f64>,
    open: Vec<(Symbol, ExchangeOrder)>,
    history: HashMap<String, ExchangeOrder>,
    next_id: u64,
}

impl Venue {
    fn next_bar(&mut self, prev: &Candle, interval: Duration, scripted: Option<f64>) -> Candle {
        let open = prev.close;
        let close = scripted
            .unwrap_or_else(|| open * (1.0 + self.rng.gen_range(-BAR_VOLATILITY..=BAR_VOLATILITY)));
        let wick = self.rng.gen_range(0.0..=BAR_VOLATILITY / 2.0);
        Candle {
            datetime: prev.datetime + interval,
            open,
            high: open.max(close) * (1.0 + wick),
            low: open.min(close) * (1.0 - wick),
            close,
            volume: self.rng.gen_range(50.0..150.0),
        }
    }

    fn seed_feed(&mut self, symbol: &Symbol, interval: Duration, warmup: usize) -> Feed {
        let start = self
            .start_prices
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_START_PRICE);
        let first_time = Utc::now() - interval * (warmup as i32);
        let mut bars = VecDeque::with_capacity(warmup + 1);
        let mut prev = Candle::from_price(first_time, start, 100.0);
        bars.push_back(prev.clone());
        for _ in 1..warmup {
            prev = self.next_bar(&prev, interval, None);
            bars.push_back(prev.clone());
        }
        Feed {
            bars,
            scripted: VecDeque::new(),
            interval,
        }
    }

    /// Advance `symbol` by one bar and fill any limit orders it crossed
    fn advance(&mut self, symbol: &Symbol, interval: Duration, keep: usize) {
        if !self.feeds.contains_key(symbol) {
            let feed = self.seed_feed(symbol, interval, keep.max(1));
            self.feeds.insert(symbol.clone(), feed);
            return;
        }

        let Some(feed) = self.feeds.get_mut(symbol) else {
            return;
        };
        let Some(prev) = feed.bars.back().cloned() else {
            return;
        };
        let scripted = feed.scripted.pop_front();
        let feed_interval = feed.interval;

        let bar = self.next_bar(&prev, feed_interval, scripted);
        self.cross_limits(symbol, &bar);

        if let Some(feed) = self.feeds.get_mut(symbol) {
            feed.bars.push_back(bar);
            while feed.bars.len() > keep.max(1) {
                feed.bars.pop_front();
            }
        }
    }

    fn cross_limits(&mut self, symbol: &Symbol, bar: &Candle) {
        let (filled, still_open): (Vec<_>, Vec<_>) =
            self.open.drain(..).partition(|(sym, order)| {
                sym == symbol
                    && match (order.side, order.price) {
                        (OrderSide::Buy, Some(p)) => bar.low <= p,
                        (OrderSide::Sell, Some(p)) => bar.high >= p,
                        (_, None) => true,
                    }
            });
        self.open = still_open;
        for (_, mut order) in filled {
            order.status = OrderStatus::Filled;
            order.filled_quantity = order.quantity;
            order.avg_price = order.price.or(Some(bar.close));
            self.history.insert(order.order_id.clone(), order);
        }
    }

    fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        self.feeds.get(symbol)?.bars.back().map(|c| c.close)
    }
}

/// Seeded paper venue
#[derive(Debug)]
pub struct SimulatedExchange {
    venue: Mutex<Venue>,
}

impl SimulatedExchange {
    pub fn new(seed: u64) -> Self {
        Self {
            venue: Mutex::new(Venue {
                rng: StdRng::seed_from_u64(seed),
                feeds: HashMap::new(),
                start_prices: HashMap::new(),
                open: Vec::new(),
                history: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Starting price for a symbol's walk; must be set before its first bar
    pub fn with_start_price(self, symbol: &Symbol, price: f64) -> Self {
        if let Ok(mut venue) = self.venue.lock() {
            venue.start_prices.insert(symbol.clone(), price);
        }
        self
    }

    /// Queue closes for the next bars of `symbol`, in order
    pub fn push_prices(&self, symbol: &Symbol, prices: &[f64]) -> Result<(), ExchangeError> {
        let mut venue = self.lock()?;
        if let Some(feed) = venue.feeds.get_mut(symbol) {
            feed.scripted.extend(prices.iter().copied());
            return Ok(());
        }
        Err(ExchangeError::Rejected {
            code: 10001,
            message: format!("no feed for {} yet", symbol),
        })
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        self.venue.lock().ok()?.last_price(symbol)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Venue>, ExchangeError> {
        self.venue
            .lock()
            .map_err(|_| ExchangeError::Transport("simulated venue state poisoned".to_string()))
    }
}

/// Interval string to bar length: minutes as a number, or D/W/M
fn interval_duration(interval: &str) -> Duration {
    match interval {
        "D" => Duration::days(1),
        "W" => Duration::weeks(1),
        "M" => Duration::days(30),
        minutes => Duration::minutes(minutes.parse::<i64>().unwrap_or(1).max(1)),
    }
}

#[async_trait]
impl Exchange for SimulatedExchange {
    async fn candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut venue = self.lock()?;
        let keep = limit.max(1) as usize;
        venue.advance(symbol, interval_duration(interval), keep);
        let bars = venue
            .feeds
            .get(symbol)
            .map(|f| f.bars.iter().cloned().collect())
            .unwrap_or_default();
        Ok(bars)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError> {
        if request.quantity <= 0.0 {
            return Err(ExchangeError::Rejected {
                code: 10001,
                message: "qty must be positive".to_string(),
            });
        }

        let mut venue = self.lock()?;
        let last = venue
            .last_price(&request.symbol)
            .ok_or_else(|| ExchangeError::Rejected {
                code: 10001,
                message: format!("no market data for {}", request.symbol),
            })?;

        let order_id = format!("sim-{}", venue.next_id);
        venue.next_id += 1;

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

        match request.order_type {
            OrderType::Market => {
                order.status = OrderStatus::Filled;
                order.filled_quantity = request.quantity;
                order.avg_price = Some(last);
                venue.history.insert(order_id.clone(), order);
                Ok(PlacedOrder {
                    order_id,
                    status: OrderStatus::Filled,
                    avg_price: Some(last),
                })
            }
            OrderType::Limit => {
                if request.price.map_or(true, |p| p <= 0.0) {
                    return Err(ExchangeError::Rejected {
                        code: 10001,
                        message: "limit order needs a positive price".to_string(),
                    });
                }
                venue.open.push((request.symbol.clone(), order));
                Ok(PlacedOrder {
                    order_id,
                    status: OrderStatus::New,
                    avg_price: None,
                })
            }
        }
    }

    async fn cancel_order(&self, _symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let mut venue = self.lock()?;
        let Some(pos) = venue.open.iter().position(|(_, o)| o.order_id == order_id) else {
            return Err(ExchangeError::Rejected {
                code: 110001,
                message: "order not exists or too late to cancel".to_string(),
            });
        };
        let (_, mut order) = venue.open.remove(pos);
        order.status = OrderStatus::Cancelled;
        venue.history.insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let venue = self.lock()?;
        Ok(venue
            .open
            .iter()
            .filter(|(sym, _)| sym == symbol)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn order_status(
        &self,
        _symbol: &Symbol,
        order_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let venue = self.lock()?;
        if let Some((_, order)) = venue.open.iter().find(|(_, o)| o.order_id == order_id) {
            return Ok(Some(order.clone()));
        }
        Ok(venue.history.get(order_id).cloned())
    }

    async fn order_by_link_id(
        &self,
        symbol: &Symbol,
        link_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let venue = self.lock()?;
        let open = venue
            .open
            .iter()
            .filter(|(sym, _)| sym == symbol)
            .map(|(_, o)| o);
        Ok(open
            .chain(venue.history.values())
            .find(|o| o.link_id.as_deref() == Some(link_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    #[tokio::test]
    async fn test_first_call_returns_warmup_history() {
        let ex = SimulatedExchange::new(7).with_start_price(&sym(), 50_000.0);
        let candles = ex.candles(&sym(), "5", 50).await.unwrap();
        assert_eq!(candles.len(), 50);
        assert_eq!(candles[0].close, 50_000.0);
        assert!(candles.windows(2).all(|w| w[0].datetime < w[1].datetime));
        assert!(candles.iter().all(Candle::is_valid));
    }

    #[tokio::test]
    async fn test_same_seed_same_path() {
        let a = SimulatedExchange::new(42);
        let b = SimulatedExchange::new(42);
        let ca = a.candles(&sym(), "1", 30).await.unwrap();
        let cb = b.candles(&sym(), "1", 30).await.unwrap();
        let closes_a: Vec<f64> = ca.iter().map(|c| c.close).collect();
        let closes_b: Vec<f64> = cb.iter().map(|c| c.close).collect();
        assert_eq!(closes_a, closes_b);
    }

    #[tokio::test]
    async fn test_scripted_prices_drive_the_feed() {
        let ex = SimulatedExchange::new(1);
        ex.candles(&sym(), "5", 10).await.unwrap();
        ex.push_prices(&sym(), &[120.0, 90.0]).unwrap();

        ex.candles(&sym(), "5", 10).await.unwrap();
        assert_eq!(ex.last_price(&sym()), Some(120.0));
        let candles = ex.candles(&sym(), "5", 10).await.unwrap();
        assert_eq!(candles.len(), 10);
        assert_eq!(ex.last_price(&sym()), Some(90.0));
    }

    #[tokio::test]
    async fn test_market_fills_at_last_close() {
        let ex = SimulatedExchange::new(3);
        ex.candles(&sym(), "5", 5).await.unwrap();
        let last = ex.last_price(&sym()).unwrap();

        let placed = ex
            .place_order(&OrderRequest::market(sym(), OrderSide::Buy, 1.0, "main"))
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Filled);
        assert_eq!(placed.avg_price, Some(last));
    }

    #[tokio::test]
    async fn test_limit_fills_when_crossed() {
        let ex = SimulatedExchange::new(3);
        ex.candles(&sym(), "5", 5).await.unwrap();
        let last = ex.last_price(&sym()).unwrap();
        let buy_at = last * 0.95;

        let placed = ex
            .place_order(&OrderRequest::limit(sym(), OrderSide::Buy, 1.0, buy_at, "grid-0-0-buy"))
            .await
            .unwrap();
        assert_eq!(ex.open_orders(&sym()).await.unwrap().len(), 1);

        ex.push_prices(&sym(), &[last * 0.94]).unwrap();
        ex.candles(&sym(), "5", 5).await.unwrap();

        assert!(ex.open_orders(&sym()).await.unwrap().is_empty());
        let status = ex.order_status(&sym(), &placed.order_id).await.unwrap().unwrap();
        assert_eq!(status.status, OrderStatus::Filled);
        assert_eq!(status.avg_price, Some(buy_at));

        let by_link = ex.order_by_link_id(&sym(), "grid-0-0-buy").await.unwrap().unwrap();
        assert_eq!(by_link.order_id, placed.order_id);
        assert!(ex.order_by_link_id(&sym(), "grid-0-1-buy").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_rejected() {
        let ex = SimulatedExchange::new(3);
        let err = ex.cancel_order(&sym(), "nope").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: 110001, .. }));
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(interval_duration("5"), Duration::minutes(5));
        assert_eq!(interval_duration("D"), Duration::days(1));
        assert_eq!(interval_duration("garbage"), Duration::minutes(1));
    }
}
