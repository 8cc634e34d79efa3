//! Trading analytics
//!
//! Closed-position results, pipeline counters and capped latency samples.
//! Everything lives in one serializable snapshot so it can be persisted and
//! restored as a unit.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::position::position::Position;

/// Latency samples kept per histogram, oldest evicted first
pub const LATENCY_SAMPLE_CAP: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    samples: VecDeque<u64>,
}

impl LatencyHistogram {
    pub fn record(&mut self, millis: u64) {
        if self.samples.len() == LATENCY_SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    /// Nearest-rank percentile, `p` in [0, 100]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    PumpDetection,
    TradeExecution,
    FeedEndToEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    MalformedEvents,
    DroppedEvents,
    DuplicateEvents,
    TokensAdmitted,
    SafetyPasses,
    SafetyFailures,
    MissedOpportunities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub total_trades: u64,
    pub profitable_trades: u64,
    pub unprofitable_trades: u64,
    pub total_pnl_sol: f64,
    pub total_pnl_usd: f64,
    pub largest_win_sol: f64,
    pub largest_loss_sol: f64,
    pub total_time_in_position_ms: i64,

    pub malformed_events: u64,
    pub dropped_events: u64,
    pub duplicate_events: u64,
    pub tokens_admitted: u64,
    pub safety_passes: u64,
    pub safety_failures: u64,
    pub missed_opportunities: u64,

    pub pump_detection_latency: LatencyHistogram,
    pub trade_execution_latency: LatencyHistogram,
    pub feed_latency: LatencyHistogram,
}

impl AnalyticsSnapshot {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        (self.profitable_trades as f64 / self.total_trades as f64) * 100.0
    }

    pub fn average_time_in_position_ms(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.total_time_in_position_ms as f64 / self.total_trades as f64
    }
}

#[derive(Debug, Default)]
pub struct Analytics {
    inner: Mutex<AnalyticsSnapshot>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: AnalyticsSnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AnalyticsSnapshot> {
        // counters stay usable even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.lock().clone()
    }

    pub fn restore(&self, snapshot: AnalyticsSnapshot) {
        *self.lock() = snapshot;
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        let mut s = self.lock();
        let slot = match counter {
            Counter::MalformedEvents => &mut s.malformed_events,
            Counter::DroppedEvents => &mut s.dropped_events,
            Counter::DuplicateEvents => &mut s.duplicate_events,
            Counter::TokensAdmitted => &mut s.tokens_admitted,
            Counter::SafetyPasses => &mut s.safety_passes,
            Counter::SafetyFailures => &mut s.safety_failures,
            Counter::MissedOpportunities => &mut s.missed_opportunities,
        };
        *slot += n;
    }

    pub fn record_latency(&self, kind: Latency, millis: u64) {
        let mut s = self.lock();
        match kind {
            Latency::PumpDetection => s.pump_detection_latency.record(millis),
            Latency::TradeExecution => s.trade_execution_latency.record(millis),
            Latency::FeedEndToEnd => s.feed_latency.record(millis),
        }
    }

    /// Fold a closed position into the totals
    pub fn record_position_closed(&self, position: &Position) {
        let mut s = self.lock();
        let pnl = position.realized_pnl_sol;
        s.total_trades += 1;
        if pnl > 0.0 {
            s.profitable_trades += 1;
            s.largest_win_sol = s.largest_win_sol.max(pnl);
        } else {
            s.unprofitable_trades += 1;
            s.largest_loss_sol = s.largest_loss_sol.min(pnl);
        }
        s.total_pnl_sol += pnl;
        s.total_pnl_usd += position.realized_pnl_usd;
        if let Some(closed_at) = position.closed_at {
            s.total_time_in_position_ms += (closed_at - position.entry_time).max(0);
        }
    }
}
