//! Operator alerts
//!
//! Alerts are queued on a bounded channel and delivered by a background task,
//! so trading never waits on delivery. A full queue drops the alert with a
//! warning. Every alert is logged; it is also posted to Telegram when a bot
//! token and chat id are configured.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NotifyConfig;
use crate::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Open,
    Close,
    Hedge,
    Stop,
    Warn,
    Error,
    GridMove,
    Info,
}

impl AlertKind {
    fn label(self) -> &'static str {
        match self {
            AlertKind::Open => "OPEN",
            AlertKind::Close => "CLOSE",
            AlertKind::Hedge => "HEDGE",
            AlertKind::Stop => "STOP",
            AlertKind::Warn => "WARN",
            AlertKind::Error => "ERROR",
            AlertKind::GridMove => "GRID",
            AlertKind::Info => "INFO",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub symbol: Option<Symbol>,
    pub lines: Vec<String>,
}

impl Alert {
    pub fn new(kind: AlertKind, symbol: Option<&Symbol>, lines: Vec<String>) -> Self {
        Self {
            kind,
            symbol: symbol.cloned(),
            lines,
        }
    }

    /// Plain-text rendering used for both the log line and the chat message
    pub fn render(&self) -> String {
        let header = match &self.symbol {
            Some(symbol) => format!("[{}] {}", self.kind.label(), symbol),
            None => format!("[{}]", self.kind.label()),
        };
        std::iter::once(header)
            .chain(self.lines.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Cheap, cloneable sending side
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<Alert>>,
}

impl Notifier {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(config: &NotifyConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let sink = TelegramSink::from_config(config);
        let handle = tokio::spawn(deliver(rx, sink));
        (Self { tx: Some(tx) }, handle)
    }

    /// Hand alerts to the caller instead of a delivery task
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that drops everything; alerts are still logged
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue `alert` without waiting
    pub fn send(&self, alert: Alert) {
        let Some(tx) = &self.tx else {
            debug!("{}", alert.render());
            return;
        };
        match tx.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!(kind = ?alert.kind, "Alert queue full, dropping alert");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Alert delivery task has stopped");
            }
        }
    }

    pub fn alert(&self, kind: AlertKind, symbol: &Symbol, lines: Vec<String>) {
        self.send(Alert::new(kind, Some(symbol), lines));
    }
}

#[derive(Debug)]
struct TelegramSink {
    http: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramSink {
    fn from_config(config: &NotifyConfig) -> Option<Self> {
        let token = config.telegram_bot_token.as_deref()?.trim();
        let chat_id = config.telegram_chat_id.as_deref()?.trim();
        if token.is_empty() || chat_id.is_empty() {
            return None;
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .ok()?;
        Some(Self {
            http,
            url: format!("https://api.telegram.org/bot{}/sendMessage", token),
            chat_id: chat_id.to_string(),
        })
    }

    async fn post(&self, text: &str) -> Result<(), reqwest::Error> {
        self.http
            .post(&self.url)
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

async fn deliver(mut rx: mpsc::Receiver<Alert>, sink: Option<TelegramSink>) {
    while let Some(alert) = rx.recv().await {
        let text = alert.render();
        match alert.kind {
            AlertKind::Error => error!("{}", text),
            AlertKind::Warn => warn!("{}", text),
            _ => info!("{}", text),
        }
        if let Some(sink) = &sink {
            if let Err(e) = sink.post(&text).await {
                warn!("Telegram delivery failed: {}", e);
            }
        }
    }
    debug!("Alert channel closed, delivery task exiting");
}
