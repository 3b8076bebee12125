//! Signed REST client
//!
//! - Retries with exponential backoff, for transport failures only. Order
//!   creation is never retried: a lost acknowledgement is resolved by the
//!   reconciler through the order's link id instead.
//! - Token-bucket rate limiting
//! - Circuit breaker in front of every request
//!
//! Application errors (`retCode != 0`) are returned immediately; resending a
//! rejected order would only be rejected again.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::auth::{
    Credentials, HEADER_API_KEY, HEADER_RECV_WINDOW, HEADER_SIGN, HEADER_TIMESTAMP,
};
use super::types::{
    side_str, CancelOrderBody, CreateOrderBody, CreateOrderResult, Envelope, KlineResult,
    OrderListResult,
};
use super::{Exchange, ExchangeError, ExchangeOrder, OrderRequest, OrderStatus, PlacedOrder};
use crate::common::{BreakerSettings, CircuitBreaker, RateLimiter};
use crate::config::ExchangeConfig;
use crate::{Candle, OrderType, Symbol};

#[derive(Debug, Clone)]
pub struct ExchangeClientConfig {
    pub base_url: String,
    pub category: String,
    pub recv_window_ms: u64,
    pub timeout: Duration,
    pub max_retries: u32,
    pub requests_per_second: usize,
    pub breaker: BreakerSettings,
}

impl Default for ExchangeClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bybit.com".to_string(),
            category: "linear".to_string(),
            recv_window_ms: 5000,
            timeout: Duration::from_secs(5),
            max_retries: 2,
            requests_per_second: 10,
            breaker: BreakerSettings::default(),
        }
    }
}

impl From<&ExchangeConfig> for ExchangeClientConfig {
    fn from(cfg: &ExchangeConfig) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            category: cfg.category.clone(),
            recv_window_ms: cfg.recv_window_ms,
            timeout: Duration::from_millis(cfg.timeout_ms),
            max_retries: cfg.max_retries,
            requests_per_second: cfg.rate_limit as usize,
            breaker: BreakerSettings::default(),
        }
    }
}

#[derive(Clone)]
pub struct ExchangeClient {
    credentials: Option<Credentials>,
    http: Client,
    config: ExchangeClientConfig,
    breaker: Arc<Mutex<CircuitBreaker>>,
    limiter: RateLimiter,
}

impl ExchangeClient {
    /// Build a client. Without credentials only public endpoints work.
    pub fn new(
        credentials: Option<Credentials>,
        config: ExchangeClientConfig,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(Self {
            credentials,
            http,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(config.breaker.clone()))),
            limiter: RateLimiter::per_second(config.requests_per_second),
            config,
        })
    }

    pub fn from_config(cfg: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let credentials = match (&cfg.api_key, &cfg.api_secret) {
            (Some(key), Some(secret)) => Some(Credentials::new(key, secret)),
            _ => None,
        };
        Self::new(credentials, ExchangeClientConfig::from(cfg))
    }

    async fn with_retry<F, Fut, T>(&self, what: &str, retries: u32, op: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        if !self.breaker.lock().await.allow_request() {
            return Err(ExchangeError::CircuitOpen);
        }

        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            match op().await {
                Ok(value) => {
                    self.breaker.lock().await.on_success();
                    return Ok(value);
                }
                // The venue answered; it is reachable.
                Err(err) if !err.is_transient() => {
                    self.breaker.lock().await.on_success();
                    return Err(err);
                }
                Err(err) if attempt < retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(250 * 2u64.pow(attempt - 1));
                    warn!(request = what, attempt, error = %err, "Request failed, retrying in {:?}", delay);
                    sleep(delay).await;
                }
                Err(err) => {
                    self.breaker.lock().await.on_failure();
                    return Err(err);
                }
            }
        }
    }

    fn signed(&self, builder: RequestBuilder, payload: &str) -> Result<RequestBuilder, ExchangeError> {
        let creds = self.credentials.as_ref().ok_or_else(|| ExchangeError::Rejected {
            code: -1,
            message: "API credentials not configured".to_string(),
        })?;
        let timestamp = Utc::now().timestamp_millis();
        let signature = creds.signature(timestamp, self.config.recv_window_ms, payload);
        Ok(builder
            .header(HEADER_API_KEY, creds.api_key())
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_RECV_WINDOW, self.config.recv_window_ms.to_string())
            .header(HEADER_SIGN, signature))
    }

    async fn decode<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ExchangeError> {
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::Transport(format!("HTTP {}: {}", status, text)));
        }
        let envelope: Envelope<T> =
            serde_json::from_str(&text).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        envelope.into_result()
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.config.base_url, path);
        Self::decode(self.http.get(url).query(query)).await
    }

    async fn private_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}{}?{}", self.config.base_url, path, query_string);
        let builder = self.signed(self.http.get(url), &query_string)?;
        Self::decode(builder).await
    }

    async fn private_post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let json = serde_json::to_string(body).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        let url = format!("{}{}", self.config.base_url, path);
        let builder = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .body(json.clone());
        Self::decode(self.signed(builder, &json)?).await
    }

    async fn order_list(&self, path: &str, query: Vec<(&str, String)>) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let result: OrderListResult = self
            .with_retry(path, self.config.max_retries, || self.private_get(path, &query))
            .await?;
        result.list.into_iter().map(|o| o.into_order()).collect()
    }
}

/// Quantities and prices go over the wire as plain decimal strings
fn fmt_decimal(value: f64) -> String {
    let s = format!("{:.8}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[async_trait]
impl Exchange for ExchangeClient {
    async fn candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let query = [
            ("category", self.config.category.clone()),
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let result: KlineResult = self
            .with_retry("kline", self.config.max_retries, || {
                self.public_get("/v5/market/kline", &query)
            })
            .await?;
        let candles = result.into_candles()?;
        debug!(symbol = %symbol, count = candles.len(), "Fetched candles");
        Ok(candles)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError> {
        let (order_type, price, tif) = match request.order_type {
            OrderType::Market => ("Market", None, None),
            OrderType::Limit => ("Limit", request.price.map(fmt_decimal), Some("GTC")),
        };
        let body = CreateOrderBody {
            category: &self.config.category,
            symbol: request.symbol.as_str(),
            side: side_str(request.side),
            order_type,
            qty: fmt_decimal(request.quantity),
            price,
            time_in_force: tif,
            order_link_id: &request.link_id,
        };

        let result: CreateOrderResult = self
            .with_retry("order/create", 0, || self.private_post("/v5/order/create", &body))
            .await?;
        debug!(order_id = %result.order_id, link_id = %result.order_link_id, "Order accepted");

        Ok(PlacedOrder {
            order_id: result.order_id,
            status: OrderStatus::New,
            avg_price: None,
        })
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let body = CancelOrderBody {
            category: &self.config.category,
            symbol: symbol.as_str(),
            order_id,
        };
        let _: serde_json::Value = self
            .with_retry("order/cancel", self.config.max_retries, || {
                self.private_post("/v5/order/cancel", &body)
            })
            .await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.order_list(
            "/v5/order/realtime",
            vec![
                ("category", self.config.category.clone()),
                ("symbol", symbol.to_string()),
            ],
        )
        .await
    }

    async fn order_status(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let orders = self
            .order_list(
                "/v5/order/history",
                vec![
                    ("category", self.config.category.clone()),
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(orders.into_iter().find(|o| o.order_id == order_id))
    }

    async fn order_by_link_id(
        &self,
        symbol: &Symbol,
        link_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        // The realtime list also returns recently closed orders when queried by id
        for path in ["/v5/order/realtime", "/v5/order/history"] {
            let orders = self
                .order_list(
                    path,
                    vec![
                        ("category", self.config.category.clone()),
                        ("symbol", symbol.to_string()),
                        ("orderLinkId", link_id.to_string()),
                    ],
                )
                .await?;
            if let Some(order) = orders
                .into_iter()
                .find(|o| o.link_id.as_deref() == Some(link_id))
            {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }
}
