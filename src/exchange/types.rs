//! Wire types for the v5 REST API
//!
//! Every response is wrapped in an envelope whose `retCode` is 0 on success.
//! Numbers arrive as strings.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ExchangeError, ExchangeOrder, OrderStatus};
use crate::{Candle, OrderSide};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    /// The result, or the application error the venue reported
    pub fn into_result(self) -> Result<T, ExchangeError> {
        if self.ret_code != 0 {
            return Err(ExchangeError::Rejected {
                code: self.ret_code,
                message: self.ret_msg,
            });
        }
        self.result
            .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))
    }
}

/// `list` rows are `[startTime, open, high, low, close, volume, turnover]`,
/// newest first
#[derive(Debug, Deserialize)]
pub struct KlineResult {
    #[serde(default)]
    pub list: Vec<Vec<String>>,
}

impl KlineResult {
    /// Parse rows and return them oldest first
    pub fn into_candles(self) -> Result<Vec<Candle>, ExchangeError> {
        let mut candles = self
            .list
            .iter()
            .map(|row| parse_kline_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        candles.reverse();
        Ok(candles)
    }
}

fn parse_kline_row(row: &[String]) -> Result<Candle, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::Decode(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    let start_ms: i64 = parse_num(&row[0], "startTime")?;
    let datetime = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .ok_or_else(|| ExchangeError::Decode(format!("bad kline timestamp {}", start_ms)))?;

    Ok(Candle {
        datetime,
        open: parse_num(&row[1], "open")?,
        high: parse_num(&row[2], "high")?,
        low: parse_num(&row[3], "low")?,
        close: parse_num(&row[4], "close")?,
        volume: parse_num(&row[5], "volume")?,
    })
}

fn parse_num<T: std::str::FromStr>(value: &str, field: &str) -> Result<T, ExchangeError> {
    value
        .parse()
        .map_err(|_| ExchangeError::Decode(format!("{} is not a number: {:?}", field, value)))
}

fn parse_opt(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| *v > 0.0)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderBody<'a> {
    pub category: &'a str,
    pub symbol: &'a str,
    pub side: &'static str,
    pub order_type: &'static str,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<&'static str>,
    pub order_link_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderBody<'a> {
    pub category: &'a str,
    pub symbol: &'a str,
    pub order_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResult {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderListResult {
    #[serde(default)]
    pub list: Vec<WireOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub side: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub avg_price: String,
    pub order_status: String,
}

impl WireOrder {
    pub fn into_order(self) -> Result<ExchangeOrder, ExchangeError> {
        let side = match self.side.as_str() {
            "Buy" => OrderSide::Buy,
            "Sell" => OrderSide::Sell,
            other => return Err(ExchangeError::Decode(format!("unknown side {:?}", other))),
        };
        Ok(ExchangeOrder {
            status: parse_status(&self.order_status),
            side,
            price: parse_opt(&self.price),
            quantity: parse_num(&self.qty, "qty")?,
            filled_quantity: parse_opt(&self.cum_exec_qty).unwrap_or(0.0),
            avg_price: parse_opt(&self.avg_price),
            link_id: (!self.order_link_id.is_empty()).then_some(self.order_link_id),
            order_id: self.order_id,
        })
    }
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "New" | "Created" | "Untriggered" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Rejected" => OrderStatus::Rejected,
        // "PartiallyFilledCanceled" keeps its fills in cumExecQty
        _ => OrderStatus::Cancelled,
    }
}

pub fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}
