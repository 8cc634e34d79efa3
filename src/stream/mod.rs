//! Stream module - feed ingestion
//!
//! Supports:
//! - PumpPortal WebSocket (live)
//! - NDJSON files (replay / backtest)

pub mod backpressure;
pub mod event;
pub mod pumpportal;
pub mod replay;

pub use backpressure::{BackpressureChannel, PrioritizedEvent};
pub use event::{CreateEvent, FeedEvent, RawFeedRecord, TradeEvent, TradeSide};
pub use pumpportal::{FeedSink, PumpPortalClient, SubscriptionControl, SubscriptionSet};
pub use replay::{ReplaySource, ReplayStats};
