//! Rolling price/volume metrics and pump detection
//!
//! All derived figures are functions of `price_history` / the volume log, so a
//! full recompute always agrees with the incrementally maintained values.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{MetricsConfig, PumpDetectionConfig};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const RAW_HORIZON_MS: i64 = 30 * 60 * 1000;
const BUCKET_MS: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct VolumeEntry {
    timestamp: i64,
    sol: f64,
    is_buy: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total_sol: f64,
    pub buy_sol: f64,
    pub sell_sol: f64,
    pub trade_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeWindow {
    OneMinute,
    FiveMinutes,
    ThirtyMinutes,
    Day,
}

impl VolumeWindow {
    pub const ALL: [VolumeWindow; 4] = [
        VolumeWindow::OneMinute,
        VolumeWindow::FiveMinutes,
        VolumeWindow::ThirtyMinutes,
        VolumeWindow::Day,
    ];

    pub fn duration_ms(&self) -> i64 {
        match self {
            VolumeWindow::OneMinute => 60_000,
            VolumeWindow::FiveMinutes => 300_000,
            VolumeWindow::ThirtyMinutes => 1_800_000,
            VolumeWindow::Day => DAY_MS,
        }
    }
}

impl VolumeStats {
    fn add(&mut self, sol: f64, is_buy: bool) {
        self.total_sol += sol;
        if is_buy {
            self.buy_sol += sol;
        } else {
            self.sell_sol += sol;
        }
        self.trade_count += 1;
    }

    fn merge(&mut self, other: &VolumeStats) {
        self.total_sol += other.total_sol;
        self.buy_sol += other.buy_sol;
        self.sell_sol += other.sell_sol;
        self.trade_count += other.trade_count;
    }
}

/// Trades older than the raw horizon, summed per minute
#[derive(Debug, Clone, Copy, PartialEq)]
struct VolumeBucket {
    start: i64,
    stats: VolumeStats,
}

/// Trade log backing every volume window.
///
/// Trades of the last 30 minutes are kept one by one, so the 1m/5m/30m
/// windows and spike buckets are exact. Older trades are folded into
/// one-minute buckets that count toward a range by their start minute; the
/// 24h window is therefore exact to the minute and never loses volume. When
/// more than `max_entries` recent trades pile up, the oldest are folded early.
#[derive(Debug, Clone)]
pub struct VolumeTracker {
    entries: VecDeque<VolumeEntry>,
    buckets: VecDeque<VolumeBucket>,
    max_entries: usize,
}

impl VolumeTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            buckets: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn record(&mut self, timestamp: i64, sol: f64, is_buy: bool) {
        self.entries.push_back(VolumeEntry {
            timestamp,
            sol,
            is_buy,
        });
        while self.entries.len() > self.max_entries {
            self.fold_oldest();
        }
    }

    fn fold_oldest(&mut self) {
        let Some(entry) = self.entries.pop_front() else {
            return;
        };
        let start = entry.timestamp.div_euclid(BUCKET_MS) * BUCKET_MS;
        match self.buckets.back_mut() {
            // per-mint timestamps never go backwards, so the back bucket is the newest
            Some(bucket) if bucket.start >= start => {
                bucket.stats.add(entry.sol, entry.is_buy)
            }
            _ => {
                let mut stats = VolumeStats::default();
                stats.add(entry.sol, entry.is_buy);
                self.buckets.push_back(VolumeBucket { start, stats });
            }
        }
    }

    /// Fold trades past the raw horizon and drop what left the widest window
    pub fn prune(&mut self, now: i64) {
        while self
            .entries
            .front()
            .is_some_and(|e| e.timestamp < now - RAW_HORIZON_MS)
        {
            self.fold_oldest();
        }
        while self.buckets.front().is_some_and(|b| b.start < now - DAY_MS) {
            self.buckets.pop_front();
        }
    }

    /// Trades with `start <= timestamp <= end`
    pub fn stats_between(&self, start: i64, end: i64) -> VolumeStats {
        let mut stats = VolumeStats::default();
        for entry in self.entries.iter().rev() {
            if entry.timestamp > end {
                continue;
            }
            if entry.timestamp < start {
                break;
            }
            stats.add(entry.sol, entry.is_buy);
        }
        for bucket in self.buckets.iter().rev() {
            if bucket.start > end {
                continue;
            }
            if bucket.start < start {
                break;
            }
            stats.merge(&bucket.stats);
        }
        stats
    }

    pub fn stats(&self, window: VolumeWindow, now: i64) -> VolumeStats {
        self.stats_between(now - window.duration_ms(), now)
    }

    pub fn volume_in(&self, duration_ms: i64, now: i64) -> f64 {
        self.stats_between(now - duration_ms, now).total_sol
    }

    /// Trades still held individually
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.buckets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpike {
    pub timestamp: i64,
    pub volume: f64,
    /// Percent price change across the spike bucket
    pub price_change: f64,
    /// Bucket volume over moving-average volume
    pub volume_increase: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpMetrics {
    pub price_acceleration: f64,
    pub highest_gain_rate: f64,
    pub pump_count: u32,
    pub last_pump_time: Option<i64>,
    pub last_pump_price: Option<f64>,
    pub volume_spikes: VecDeque<VolumeSpike>,
    pub market_cap_gain_rate: f64,
}

impl PumpMetrics {
    pub fn latest_spike(&self) -> Option<&VolumeSpike> {
        self.volume_spikes.back()
    }

    /// Pumps (spikes with rising price) since `since`
    pub fn pumps_since(&self, since: i64) -> u32 {
        self.volume_spikes
            .iter()
            .filter(|s| s.timestamp >= since && s.price_change > 0.0)
            .count() as u32
    }
}

fn slope(a: &PricePoint, b: &PricePoint) -> f64 {
    let dt = (b.timestamp - a.timestamp) as f64 / 1000.0;
    if dt <= 0.0 {
        0.0
    } else {
        (b.price - a.price) / dt
    }
}

/// Tail slope minus head slope over the last `window` samples
pub fn price_acceleration(history: &VecDeque<PricePoint>, window: usize) -> f64 {
    let n = history.len().min(window);
    if n < 4 {
        return 0.0;
    }
    let samples: Vec<&PricePoint> = history.iter().skip(history.len() - n).collect();
    let half = n / 2;
    let head = slope(samples[0], samples[half - 1]);
    let tail = slope(samples[n - half], samples[n - 1]);
    tail - head
}

/// Slope across the last `window` samples, SOL per second
pub fn price_velocity(history: &VecDeque<PricePoint>, window: usize) -> f64 {
    let n = history.len().min(window);
    if n < 2 {
        return 0.0;
    }
    let first = &history[history.len() - n];
    let last = &history[history.len() - 1];
    slope(first, last)
}

/// Sample standard deviation of log returns over the last `lookback` returns
pub fn volatility(history: &VecDeque<PricePoint>, lookback: usize) -> f64 {
    let take = (lookback + 1).min(history.len());
    let start = history.len() - take;
    let returns: Vec<f64> = history
        .iter()
        .skip(start)
        .zip(history.iter().skip(start + 1))
        .filter(|(a, b)| a.price > 0.0 && b.price > 0.0)
        .map(|(a, b)| (b.price / a.price).ln())
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    variance.sqrt()
}

/// Per-token metric state
#[derive(Debug, Clone)]
pub struct TokenMetrics {
    pub price_history: VecDeque<PricePoint>,
    pub volume: VolumeTracker,
    pub pump: PumpMetrics,
    pub volatility: f64,
    created_at: i64,
    initial_price: f64,
    initial_market_cap: f64,
    config: MetricsConfig,
}

impl TokenMetrics {
    pub fn new(
        created_at: i64,
        initial_price: f64,
        initial_market_cap: f64,
        config: &MetricsConfig,
    ) -> Self {
        let mut price_history = VecDeque::with_capacity(config.price_history_size);
        price_history.push_back(PricePoint {
            timestamp: created_at,
            price: initial_price,
        });
        Self {
            price_history,
            volume: VolumeTracker::new(config.max_volume_entries),
            pump: PumpMetrics::default(),
            volatility: 0.0,
            created_at,
            initial_price,
            initial_market_cap,
            config: config.clone(),
        }
    }

    /// Fold one trade into the metrics. Returns the spike when it marks a pump.
    pub fn record_trade(
        &mut self,
        timestamp: i64,
        price: f64,
        market_cap_sol: f64,
        volume_sol: f64,
        is_buy: bool,
        pump_config: &PumpDetectionConfig,
    ) -> Option<VolumeSpike> {
        self.price_history.push_back(PricePoint { timestamp, price });
        while self.price_history.len() > self.config.price_history_size {
            self.price_history.pop_front();
        }

        self.volume.record(timestamp, volume_sol, is_buy);
        self.volume.prune(timestamp);

        self.pump.price_acceleration =
            price_acceleration(&self.price_history, self.config.acceleration_window);
        self.volatility = volatility(&self.price_history, self.config.volatility_lookback);

        let elapsed_secs = (timestamp - self.created_at) as f64 / 1000.0;
        if elapsed_secs > 0.0 {
            if self.initial_price > 0.0 {
                let rate = (price / self.initial_price - 1.0) * 100.0 / elapsed_secs;
                if rate > self.pump.highest_gain_rate {
                    self.pump.highest_gain_rate = rate;
                }
            }
            if self.initial_market_cap > 0.0 {
                self.pump.market_cap_gain_rate =
                    (market_cap_sol / self.initial_market_cap - 1.0) * 100.0 / elapsed_secs;
            }
        }

        self.detect_spike(timestamp, price, pump_config)
    }

    fn detect_spike(
        &mut self,
        now: i64,
        price: f64,
        pump_config: &PumpDetectionConfig,
    ) -> Option<VolumeSpike> {
        let bucket = pump_config.spike_bucket_ms;
        let buckets = pump_config.moving_average_buckets.max(1) as i64;

        if let Some(last) = self.pump.latest_spike() {
            if now - last.timestamp < bucket {
                return None;
            }
        }

        let current = self.volume.stats_between(now - bucket + 1, now).total_sol;
        let average = self
            .volume
            .stats_between(now - bucket * (buckets + 1) + 1, now - bucket)
            .total_sol
            / buckets as f64;
        if average <= 0.0 {
            return None;
        }
        let volume_increase = current / average;
        if volume_increase < pump_config.min_volume_spike {
            return None;
        }

        let reference = self
            .price_history
            .iter()
            .rev()
            .find(|p| p.timestamp <= now - bucket)
            .or_else(|| self.price_history.front())
            .map(|p| p.price)
            .unwrap_or(price);
        let price_change = if reference > 0.0 {
            (price - reference) / reference * 100.0
        } else {
            0.0
        };

        let spike = VolumeSpike {
            timestamp: now,
            volume: current,
            price_change,
            volume_increase,
        };
        self.pump.volume_spikes.push_back(spike);
        while self.pump.volume_spikes.len() > self.config.max_volume_spikes.max(1) {
            self.pump.volume_spikes.pop_front();
        }

        if price_change > 0.0 {
            self.pump.pump_count += 1;
            self.pump.last_pump_time = Some(now);
            self.pump.last_pump_price = Some(price);
            Some(spike)
        } else {
            None
        }
    }

    pub fn price_velocity(&self) -> f64 {
        price_velocity(&self.price_history, self.config.acceleration_window)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}
