//! Typed outbound event bus
//!
//! One broadcast channel carries everything observers may care about. Sending
//! never blocks; a subscriber that falls behind loses the oldest messages.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::position::position::{PartialExit, Position};
use crate::safety::missed::MissedOpportunity;
use crate::token::state::TokenState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BotEvent {
    #[serde(rename_all = "camelCase")]
    TokenAdded {
        mint: String,
        symbol: String,
        name: String,
        market_cap_sol: f64,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    TokenStateChanged {
        mint: String,
        from: TokenState,
        to: TokenState,
        reason: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    PriceUpdate {
        mint: String,
        price: f64,
        market_cap_sol: f64,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    PumpDetected {
        mint: String,
        price_change_pct: f64,
        volume_increase: f64,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    DrawdownDetected {
        mint: String,
        drawdown_pct: f64,
        timestamp: i64,
    },
    PositionOpened {
        position: Position,
    },
    PartialExit {
        mint: String,
        exit: PartialExit,
    },
    PositionClosed {
        position: Position,
    },
    MissedOpportunity {
        opportunity: Box<MissedOpportunity>,
    },
    #[serde(rename_all = "camelCase")]
    BalanceUpdated {
        balance_sol: f64,
        change_sol: f64,
    },
    Error {
        kind: String,
        context: String,
    },
}

impl BotEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BotEvent::TokenAdded { .. } => "tokenAdded",
            BotEvent::TokenStateChanged { .. } => "tokenStateChanged",
            BotEvent::PriceUpdate { .. } => "priceUpdate",
            BotEvent::PumpDetected { .. } => "pumpDetected",
            BotEvent::DrawdownDetected { .. } => "drawdownDetected",
            BotEvent::PositionOpened { .. } => "positionOpened",
            BotEvent::PartialExit { .. } => "partialExit",
            BotEvent::PositionClosed { .. } => "positionClosed",
            BotEvent::MissedOpportunity { .. } => "missedOpportunity",
            BotEvent::BalanceUpdated { .. } => "balanceUpdated",
            BotEvent::Error { .. } => "error",
        }
    }

    pub fn error(err: &crate::error::Error, context: impl Into<String>) -> Self {
        BotEvent::Error {
            kind: err.kind().to_string(),
            context: context.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BotEvent) {
        let name = event.name();
        // Err only means nobody is listening
        if self.tx.send(event).is_err() {
            trace!(event = name, "No subscribers for event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(BotEvent::BalanceUpdated {
            balance_sol: 9.5,
            change_sol: -0.5,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "balanceUpdated");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        for _ in 0..10 {
            bus.publish(BotEvent::Error {
                kind: "Io".into(),
                context: "test".into(),
            });
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let event = BotEvent::TokenStateChanged {
            mint: "m".into(),
            from: TokenState::Drawdown,
            to: TokenState::Recovery,
            reason: "recovered 12.0% from trough".into(),
            timestamp: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tokenStateChanged""#));
        assert!(json.contains(r#""to":"RECOVERY""#));
    }
}
