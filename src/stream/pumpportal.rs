//! PumpPortal WebSocket feed
//!
//! PumpPortal provides a free WebSocket API for real-time pump.fun data.
//! The client keeps a durable subscription set: whatever was subscribed is
//! replayed after every reconnect, and changes made while connected are
//! forwarded immediately.
//!
//! WebSocket endpoint: wss://pumpportal.fun/api/data
//! Documentation: https://pumpportal.fun/data-api/real-time

use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::stream::event::RawFeedRecord;

/// Subscription methods
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMessage {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl SubscriptionMessage {
    pub fn subscribe_new_tokens() -> Self {
        Self {
            method: "subscribeNewToken".to_string(),
            keys: None,
        }
    }

    pub fn subscribe_token_trades(mints: Vec<String>) -> Self {
        Self {
            method: "subscribeTokenTrade".to_string(),
            keys: Some(mints),
        }
    }

    pub fn unsubscribe_token_trades(mints: Vec<String>) -> Self {
        Self {
            method: "unsubscribeTokenTrade".to_string(),
            keys: Some(mints),
        }
    }
}

/// Where feed records go once received
#[async_trait]
pub trait FeedSink: Send + Sync {
    async fn deliver(&self, record: RawFeedRecord) -> Result<()>;

    /// A message that could not even be parsed
    fn malformed(&self, detail: &str);
}

/// Subscription changes requested by the engine
#[async_trait]
pub trait SubscriptionControl: Send + Sync {
    async fn subscribe_new_tokens(&self) -> Result<()>;
    async fn subscribe_token_trades(&self, mint: &str) -> Result<()>;
    async fn unsubscribe_token_trades(&self, mint: &str) -> Result<()>;
}

/// Durable record of what we are subscribed to
#[derive(Debug)]
pub struct SubscriptionSet {
    new_tokens: AtomicBool,
    mints: DashSet<String>,
    commands: mpsc::UnboundedSender<SubscriptionMessage>,
}

impl SubscriptionSet {
    /// The receiver feeds live changes to a connected client. Dropping it
    /// leaves a set that only records (used for replay).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SubscriptionMessage>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let set = Arc::new(Self {
            new_tokens: AtomicBool::new(false),
            mints: DashSet::new(),
            commands,
        });
        (set, rx)
    }

    pub fn is_subscribed(&self, mint: &str) -> bool {
        self.mints.contains(mint)
    }

    pub fn len(&self) -> usize {
        self.mints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mints.is_empty()
    }

    /// Messages that rebuild the full subscription state on a new connection
    pub fn replay_messages(&self) -> Vec<SubscriptionMessage> {
        let mut messages = Vec::new();
        if self.new_tokens.load(Ordering::Relaxed) {
            messages.push(SubscriptionMessage::subscribe_new_tokens());
        }
        let mut mints: Vec<String> = self.mints.iter().map(|m| m.key().clone()).collect();
        if !mints.is_empty() {
            mints.sort();
            messages.push(SubscriptionMessage::subscribe_token_trades(mints));
        }
        messages
    }

    fn forward(&self, message: SubscriptionMessage) {
        if self.commands.send(message).is_err() {
            trace!("No live connection for subscription change");
        }
    }
}

#[async_trait]
impl SubscriptionControl for SubscriptionSet {
    async fn subscribe_new_tokens(&self) -> Result<()> {
        if !self.new_tokens.swap(true, Ordering::Relaxed) {
            self.forward(SubscriptionMessage::subscribe_new_tokens());
        }
        Ok(())
    }

    async fn subscribe_token_trades(&self, mint: &str) -> Result<()> {
        if self.mints.insert(mint.to_string()) {
            debug!(mint = %mint, "Subscribing to token trades");
            self.forward(SubscriptionMessage::subscribe_token_trades(vec![mint.to_string()]));
        }
        Ok(())
    }

    async fn unsubscribe_token_trades(&self, mint: &str) -> Result<()> {
        if self.mints.remove(mint).is_some() {
            debug!(mint = %mint, "Unsubscribing from token trades");
            self.forward(SubscriptionMessage::unsubscribe_token_trades(vec![mint.to_string()]));
        }
        Ok(())
    }
}

/// PumpPortal WebSocket client
pub struct PumpPortalClient {
    config: FeedConfig,
    subscriptions: Arc<SubscriptionSet>,
    commands: mpsc::UnboundedReceiver<SubscriptionMessage>,
    sink: Arc<dyn FeedSink>,
    cancel: CancellationToken,
}

enum StreamEnd {
    Cancelled,
    Disconnected,
}

impl PumpPortalClient {
    pub fn new(
        config: FeedConfig,
        subscriptions: Arc<SubscriptionSet>,
        commands: mpsc::UnboundedReceiver<SubscriptionMessage>,
        sink: Arc<dyn FeedSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            subscriptions,
            commands,
            sink,
            cancel,
        }
    }

    /// Stream until cancelled. Fails once `max_reconnect_attempts`
    /// consecutive connection attempts have failed (0 = retry forever).
    pub async fn run(mut self) -> Result<()> {
        info!("Starting PumpPortal WebSocket client, URL: {}", self.config.ws_url);
        let mut reconnect_attempts = 0u32;

        loop {
            match self.connect_and_stream().await {
                Ok(StreamEnd::Cancelled) => {
                    info!("PumpPortal client shutting down");
                    return Ok(());
                }
                Ok(StreamEnd::Disconnected) => {
                    reconnect_attempts = 0;
                }
                Err(e) => {
                    error!("PumpPortal WebSocket error: {}", e);
                    reconnect_attempts += 1;
                    if self.config.max_reconnect_attempts > 0
                        && reconnect_attempts >= self.config.max_reconnect_attempts
                    {
                        error!(
                            "Max reconnect attempts ({}) reached",
                            self.config.max_reconnect_attempts
                        );
                        return Err(Error::FeedConnection(
                            "max reconnect attempts reached".to_string(),
                        ));
                    }
                }
            }

            let delay = Duration::from_millis(self.config.reconnect_delay_ms);
            warn!("Reconnecting in {:?}...", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
        }
    }

    async fn connect_and_stream(&mut self) -> Result<StreamEnd> {
        let url = url::Url::parse(&self.config.ws_url)
            .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {}", e)))?;

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            connected = connect_async(url) => connected,
        };
        let (ws_stream, _) =
            connected.map_err(|e| {
                Error::FeedConnection(format!("WebSocket connect failed: {}", e))
            })?;
        info!("Connected to PumpPortal WebSocket");

        let (mut write, mut read) = ws_stream.split();

        // live changes queued while disconnected are covered by the replay
        while self.commands.try_recv().is_ok() {}
        for message in self.subscriptions.replay_messages() {
            let json = serde_json::to_string(&message)?;
            write
                .send(Message::Text(json))
                .await
                .map_err(|e| Error::FeedConnection(format!("Failed to subscribe: {}", e)))?;
        }
        info!(mints = self.subscriptions.len(), "Subscriptions replayed");

        let mut ping_timer =
            tokio::time::interval(Duration::from_secs(self.config.ping_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamEnd::Cancelled);
                }

                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        error!("Failed to send ping: {}", e);
                        return Ok(StreamEnd::Disconnected);
                    }
                    trace!("Sent ping");
                }

                Some(command) = self.commands.recv() => {
                    let json = serde_json::to_string(&command)?;
                    if let Err(e) = write.send(Message::Text(json)).await {
                        error!("Failed to send subscription change: {}", e);
                        return Ok(StreamEnd::Disconnected);
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text).await?,
                        Some(Ok(Message::Pong(_))) => trace!("Received pong"),
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by server");
                            return Ok(StreamEnd::Disconnected);
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            return Ok(StreamEnd::Disconnected);
                        }
                        None => {
                            info!("WebSocket stream ended");
                            return Ok(StreamEnd::Disconnected);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_message(&self, text: &str) -> Result<()> {
        match parse_message(text) {
            Ok(Some(record)) => self.sink.deliver(record).await,
            Ok(None) => {
                debug!("Non-event message: {}", &text[..text.len().min(100)]);
                Ok(())
            }
            Err(e) => {
                self.sink.malformed(&e.to_string());
                Ok(())
            }
        }
    }
}

/// Parse one feed message. Control messages (subscription acks) yield
/// `None`; records missing a timestamp are stamped with the receive time.
pub fn parse_message(text: &str) -> Result<Option<RawFeedRecord>> {
    let mut record: RawFeedRecord =
        serde_json::from_str(text)
            .map_err(|e| Error::MalformedEvent(format!("invalid JSON: {}", e)))?;
    if record.tx_type.is_none() && record.mint.is_none() {
        return Ok(None);
    }
    if record.timestamp.is_none() {
        record.timestamp = Some(chrono::Utc::now().timestamp_millis());
    }
    Ok(Some(record))
}
