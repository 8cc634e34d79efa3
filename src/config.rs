//! Configuration loading and validation
//!
//! Every numeric field carries its unit in the name suffix (`_sol`, `_usd`,
//! `_pct`, `_ms`, `_secs`). Ratios without a suffix are fractions in `[0, 1]`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wallet: WalletConfig,
    pub thresholds: ThresholdsConfig,
    pub safety: SafetyConfig,
    pub position: PositionConfig,
    pub exit_strategies: ExitStrategiesConfig,
    pub transaction: TransactionConfig,
    pub position_manager: PositionManagerConfig,
    pub feed: FeedConfig,
    pub backpressure: BackpressureConfig,
    pub registry: RegistryConfig,
    pub metrics: MetricsConfig,
    pub missed_opportunity: MissedOpportunityConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub price: PriceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Starting balance of the simulated wallet
    pub initial_balance_sol: f64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            initial_balance_sol: 10.0,
        }
    }
}

/// Market-cap and price thresholds driving the token lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// Tokens created above this market cap are ignored; NEW -> HEATING_UP at or above it
    pub heating_up_usd: f64,
    /// HEATING_UP -> FIRST_PUMP
    pub first_pump_usd: f64,
    /// Drop from local peak that counts as a drawdown
    pub pump_drawdown_pct: f64,
    /// Rise from local trough that counts as a recovery
    pub recovery_pct: f64,
    /// Market cap at or below which a token is considered dead
    pub dead_usd: f64,
    /// Consecutive samples at or below `dead_usd` before DEAD
    pub dead_samples: u32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            heating_up_usd: 9_000.0,
            first_pump_usd: 15_000.0,
            pump_drawdown_pct: 15.0,
            recovery_pct: 10.0,
            dead_usd: 3_000.0,
            dead_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    pub min_token_age_seconds: u64,
    pub min_liquidity_sol: f64,
    pub min_holders: u32,
    /// Fraction of total supply held by the top 3 holders
    pub max_top_holder_concentration: f64,
    pub creator_sell_window_ms: i64,
    /// Creator sell volume in the window as a percentage of vSol
    pub max_creator_sell_liquidity_pct: f64,
    pub post_pump_window_ms: i64,
    pub max_post_pump_drop_pct: f64,
    /// Minimum time between evaluations after a failure
    pub retry_cooldown_ms: i64,
    /// A token that gained more than this since its last failure is not re-evaluated
    pub retry_max_gain_pct: f64,
    pub pump_detection: PumpDetectionConfig,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_token_age_seconds: 60,
            min_liquidity_sol: 10.0,
            min_holders: 25,
            max_top_holder_concentration: 0.35,
            creator_sell_window_ms: 300_000,
            max_creator_sell_liquidity_pct: 10.0,
            post_pump_window_ms: 120_000,
            max_post_pump_drop_pct: 30.0,
            retry_cooldown_ms: 5_000,
            retry_max_gain_pct: 20.0,
            pump_detection: PumpDetectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpDetectionConfig {
    /// Difference between tail and head price slopes (SOL/token per second)
    pub min_price_acceleration: f64,
    /// Spike bucket volume over moving-average bucket volume
    pub min_volume_spike: f64,
    /// Spike price change (%) per unit of volume increase
    pub min_price_volume_correlation: f64,
    /// Percent gain per second since creation
    pub min_gain_rate: f64,
    /// Standard deviation of log returns
    pub max_price_volatility: f64,
    pub large_token_mc_usd: f64,
    pub min_mc_gain_rate: f64,
    pub min_pump_count: u32,
    pub pump_window_ms: i64,
    /// Width of the bucket compared against the moving average
    pub spike_bucket_ms: i64,
    /// Number of preceding buckets in the moving average
    pub moving_average_buckets: u32,
}

impl Default for PumpDetectionConfig {
    fn default() -> Self {
        Self {
            min_price_acceleration: 0.0,
            min_volume_spike: 3.0,
            min_price_volume_correlation: 1.0,
            min_gain_rate: 0.5,
            max_price_volatility: 0.25,
            large_token_mc_usd: 50_000.0,
            min_mc_gain_rate: 0.2,
            min_pump_count: 2,
            pump_window_ms: 300_000,
            spike_bucket_ms: 10_000,
            moving_average_buckets: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub position_size_market_cap_ratio: f64,
    pub min_position_size_sol: f64,
    pub max_position_size_sol: f64,
    pub volatility_scaling: bool,
    pub volatility_scaling_factor: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            position_size_market_cap_ratio: 0.01,
            min_position_size_sol: 0.1,
            max_position_size_sol: 1.0,
            volatility_scaling: true,
            volatility_scaling_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitStrategiesConfig {
    pub stop_loss: StopLossConfig,
    pub trailing_stop: TrailingStopConfig,
    pub take_profit: TakeProfitConfig,
    pub volume_based: VolumeExitConfig,
    pub time_based: TimeExitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLossConfig {
    pub enabled: bool,
    pub percentage: f64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percentage: 25.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Peak ROI at which the trail arms
    pub activation_pct: f64,
    pub base_pct: f64,
    /// Added distance per unit of volatility
    pub volatility_multiplier: f64,
    pub min_pct: f64,
    pub max_pct: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_pct: 10.0,
            base_pct: 5.0,
            volatility_multiplier: 50.0,
            min_pct: 3.0,
            max_pct: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TakeProfitTier {
    pub threshold_pct: f64,
    /// Fraction of the original position size
    pub portion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitConfig {
    pub enabled: bool,
    pub tiers: Vec<TakeProfitTier>,
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: vec![
                TakeProfitTier {
                    threshold_pct: 20.0,
                    portion: 0.3,
                },
                TakeProfitTier {
                    threshold_pct: 50.0,
                    portion: 0.3,
                },
                TakeProfitTier {
                    threshold_pct: 100.0,
                    portion: 0.4,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeExitConfig {
    pub enabled: bool,
    pub measurement_period_ms: i64,
    pub min_peak_volume_sol: f64,
    /// Exit when current volume falls below this percentage of the peak
    pub volume_drop_threshold_pct: f64,
}

impl Default for VolumeExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            measurement_period_ms: 300_000,
            min_peak_volume_sol: 10.0,
            volume_drop_threshold_pct: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeExitConfig {
    pub enabled: bool,
    pub max_hold_time_secs: u64,
    /// ROI above which the hold time is extended
    pub extension_threshold_pct: f64,
    pub extension_time_secs: u64,
}

impl Default for TimeExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hold_time_secs: 1_800,
            extension_threshold_pct: 10.0,
            extension_time_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub simulation_mode: SimulationModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationModeConfig {
    /// When false, delay is zero and execution happens at the quoted price
    pub enabled: bool,
    pub min_network_delay_ms: u64,
    pub max_network_delay_ms: u64,
    pub congestion_probability: f64,
    pub congestion_multiplier: f64,
    pub avg_block_time_secs: f64,
    pub min_time_between_tx_ms: u64,
    pub slippage_base_pct: f64,
    pub volume_multiplier: f64,
    pub volatility_multiplier: f64,
    /// Fixed RNG seed for reproducible backtests
    pub seed: Option<u64>,
}

impl Default for SimulationModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_network_delay_ms: 50,
            max_network_delay_ms: 250,
            congestion_probability: 0.3,
            congestion_multiplier: 2.5,
            avg_block_time_secs: 0.4,
            min_time_between_tx_ms: 1_000,
            slippage_base_pct: 0.5,
            volume_multiplier: 2.0,
            volatility_multiplier: 0.5,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionManagerConfig {
    /// Minimum event time between a close and the next open
    pub cooldown_after_close_ms: i64,
    /// Enqueue a snapshot on every open / exit
    pub snapshot_on_transition: bool,
}

impl Default for PositionManagerConfig {
    fn default() -> Self {
        Self {
            cooldown_after_close_ms: 30_000,
            snapshot_on_transition: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub ws_url: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_pumpportal_ws_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            drop_policy: default_drop_policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    OldestNonPriority,
    Newest,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Terminal tokens quiet for this long are removed
    pub sweep_interval_ms: i64,
    /// Queue depth of each per-mint worker
    pub token_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 120_000,
            token_channel_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub price_history_size: usize,
    pub volatility_lookback: usize,
    pub acceleration_window: usize,
    /// Recent trades kept one by one before older ones fold into minute buckets
    pub max_volume_entries: usize,
    pub max_volume_spikes: usize,
    pub max_trades_per_holder: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            price_history_size: 500,
            volatility_lookback: 20,
            acceleration_window: 10,
            max_volume_entries: 50_000,
            max_volume_spikes: 64,
            max_trades_per_holder: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MissedOpportunityConfig {
    pub enabled: bool,
    pub significant_gain_pct: f64,
    pub max_time_to_peak_ms: i64,
    pub min_profit_sol: f64,
    pub tracking_window_ms: i64,
}

impl Default for MissedOpportunityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            significant_gain_pct: 50.0,
            max_time_to_peak_ms: 300_000,
            min_profit_sol: 0.1,
            tracking_window_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub dir: String,
    pub snapshot_interval_ms: u64,
    pub initial_retry_ms: u64,
    pub max_retry_elapsed_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "data".to_string(),
            snapshot_interval_ms: 30_000,
            initial_retry_ms: 100,
            max_retry_elapsed_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// Log to this file instead of stdout
    pub file: Option<String>,
    pub max_file_bytes: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            file: None,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub shutdown_deadline_ms: u64,
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shutdown_deadline_ms: 5_000,
            event_bus_capacity: 4_096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    /// Used until the first successful refresh
    pub sol_usd: f64,
    /// JSON endpoint returning `{"solana": {"usd": <price>}}`
    pub refresh_url: Option<String>,
    pub refresh_interval_secs: u64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            sol_usd: 150.0,
            refresh_url: None,
            refresh_interval_secs: 60,
        }
    }
}

// Default value functions
fn default_pumpportal_ws_url() -> String {
    "wss://pumpportal.fun/api/data".into()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    10000
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::OldestNonPriority
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix TRADER_)
            .add_source(
                config::Environment::with_prefix("TRADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.wallet.initial_balance_sol < 0.0 {
            anyhow::bail!("wallet.initial_balance_sol cannot be negative");
        }

        let t = &self.thresholds;
        if t.heating_up_usd <= 0.0 || t.first_pump_usd < t.heating_up_usd {
            anyhow::bail!("thresholds: require 0 < heating_up_usd <= first_pump_usd");
        }
        if t.dead_usd >= t.heating_up_usd {
            anyhow::bail!("thresholds.dead_usd must be below heating_up_usd");
        }
        for (name, pct) in [
            ("pump_drawdown_pct", t.pump_drawdown_pct),
            ("recovery_pct", t.recovery_pct),
        ] {
            if pct <= 0.0 || pct >= 100.0 {
                anyhow::bail!("thresholds.{} must be between 0 and 100", name);
            }
        }
        if t.dead_samples == 0 {
            anyhow::bail!("thresholds.dead_samples must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.safety.max_top_holder_concentration) {
            anyhow::bail!("safety.max_top_holder_concentration must be a fraction in [0, 1]");
        }

        let p = &self.position;
        if p.min_position_size_sol <= 0.0 || p.max_position_size_sol < p.min_position_size_sol {
            anyhow::bail!("position: require 0 < min_position_size_sol <= max_position_size_sol");
        }
        if p.position_size_market_cap_ratio <= 0.0 {
            anyhow::bail!("position.position_size_market_cap_ratio must be positive");
        }

        let exits = &self.exit_strategies;
        if exits.stop_loss.enabled
            && (exits.stop_loss.percentage <= 0.0 || exits.stop_loss.percentage >= 100.0)
        {
            anyhow::bail!("exit_strategies.stop_loss.percentage must be between 0 and 100");
        }
        let trail = &exits.trailing_stop;
        if trail.enabled && (trail.min_pct <= 0.0 || trail.max_pct < trail.min_pct) {
            anyhow::bail!("exit_strategies.trailing_stop: require 0 < min_pct <= max_pct");
        }
        let mut previous = f64::NEG_INFINITY;
        let mut portion_sum = 0.0;
        for tier in &exits.take_profit.tiers {
            if tier.threshold_pct <= previous {
                anyhow::bail!("exit_strategies.take_profit.tiers must have increasing thresholds");
            }
            if tier.portion <= 0.0 || tier.portion > 1.0 {
                anyhow::bail!("exit_strategies.take_profit tier portion must be in (0, 1]");
            }
            previous = tier.threshold_pct;
            portion_sum += tier.portion;
        }
        if portion_sum > 1.0 + 1e-9 {
            anyhow::bail!("exit_strategies.take_profit portions sum to more than 1");
        }
        if exits.volume_based.enabled && exits.volume_based.measurement_period_ms <= 0 {
            anyhow::bail!("exit_strategies.volume_based.measurement_period_ms must be positive");
        }

        let sim = &self.transaction.simulation_mode;
        if sim.min_network_delay_ms > sim.max_network_delay_ms {
            anyhow::bail!("simulation_mode: min_network_delay_ms exceeds max_network_delay_ms");
        }
        if !(0.0..=1.0).contains(&sim.congestion_probability) {
            anyhow::bail!("simulation_mode.congestion_probability must be in [0, 1]");
        }

        if self.backpressure.channel_capacity == 0 || self.registry.token_channel_capacity == 0 {
            anyhow::bail!("queue capacities must be positive");
        }
        if self.metrics.price_history_size < 2 || self.metrics.acceleration_window < 4 {
            anyhow::bail!("metrics: price_history_size >= 2 and acceleration_window >= 4 required");
        }
        if self.safety.pump_detection.spike_bucket_ms <= 0
            || self.safety.pump_detection.moving_average_buckets == 0
        {
            anyhow::bail!("safety.pump_detection bucket settings must be positive");
        }
        if self.price.sol_usd <= 0.0 {
            anyhow::bail!("price.sol_usd must be positive");
        }

        // Warn about backpressure policy
        if self.backpressure.drop_policy == DropPolicy::Block {
            tracing::warn!(
                "Backpressure drop_policy is 'block', the feed reader stalls when the queue is full"
            );
        }

        Ok(())
    }

    /// Short human-readable summary
    pub fn summary(&self) -> String {
        format!(
            r#"Configuration:
  Wallet:
    initial_balance: {} SOL
  Thresholds:
    heating_up: ${}  first_pump: ${}  dead: ${} x{}
    drawdown: {}%  recovery: {}%
  Safety:
    enabled: {}
    min_age: {}s  min_liquidity: {} SOL  min_holders: {}
    max_top3_concentration: {}
  Position:
    size: {} x market cap, clamp [{}, {}] SOL
  Exits:
    stop_loss: {} ({}%)
    trailing: {} (activation {}%, base {}%)
    take_profit tiers: {}
    volume: {}  time: {} ({}s)
  Simulation:
    enabled: {}  delay: {}-{}ms  seed: {}
  Feed:
    ws_url: {}
  Persistence:
    enabled: {}  dir: {}
"#,
            self.wallet.initial_balance_sol,
            self.thresholds.heating_up_usd,
            self.thresholds.first_pump_usd,
            self.thresholds.dead_usd,
            self.thresholds.dead_samples,
            self.thresholds.pump_drawdown_pct,
            self.thresholds.recovery_pct,
            self.safety.enabled,
            self.safety.min_token_age_seconds,
            self.safety.min_liquidity_sol,
            self.safety.min_holders,
            self.safety.max_top_holder_concentration,
            self.position.position_size_market_cap_ratio,
            self.position.min_position_size_sol,
            self.position.max_position_size_sol,
            self.exit_strategies.stop_loss.enabled,
            self.exit_strategies.stop_loss.percentage,
            self.exit_strategies.trailing_stop.enabled,
            self.exit_strategies.trailing_stop.activation_pct,
            self.exit_strategies.trailing_stop.base_pct,
            self.exit_strategies.take_profit.tiers.len(),
            self.exit_strategies.volume_based.enabled,
            self.exit_strategies.time_based.enabled,
            self.exit_strategies.time_based.max_hold_time_secs,
            self.transaction.simulation_mode.enabled,
            self.transaction.simulation_mode.min_network_delay_ms,
            self.transaction.simulation_mode.max_network_delay_ms,
            self.transaction
                .simulation_mode
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(random)".into()),
            mask_url(&self.feed.ws_url),
            self.persistence.enabled,
            self.persistence.dir,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

/// Shared, swappable configuration.
///
/// Readers take a cheap `Arc` snapshot per operation; `apply` validates and
/// swaps the whole document at once.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current configuration snapshot
    pub fn current(&self) -> Arc<Config> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validate and install `config`, returning the previous value
    pub fn apply(&self, config: Config) -> crate::error::Result<Arc<Config>> {
        config
            .validate()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        let mut guard = self
            .inner
            .write()
            .map_err(|_| crate::error::Error::Internal("config lock poisoned".into()))?;
        let previous = std::mem::replace(&mut *guard, Arc::new(config));
        tracing::info!("Configuration replaced");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.safety.min_holders, 25);
        assert_eq!(config.exit_strategies.take_profit.tiers.len(), 3);
        assert_eq!(config.transaction.simulation_mode.congestion_probability, 0.3);
    }

    #[test]
    fn test_drop_policy_deserialize() {
        let json = r#""oldest_non_priority""#;
        let policy: DropPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy, DropPolicy::OldestNonPriority);
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(mask_url("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn test_rejects_inconsistent_thresholds() {
        let mut config = Config::default();
        config.thresholds.first_pump_usd = config.thresholds.heating_up_usd - 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.exit_strategies.take_profit.tiers[1].threshold_pct = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file_with_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader.toml");
        std::fs::write(
            &path,
            r#"
[wallet]
initial_balance_sol = 3.5

[safety]
min_holders = 40

[exit_strategies.stop_loss]
percentage = 12.5
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.wallet.initial_balance_sol, 3.5);
        assert_eq!(config.safety.min_holders, 40);
        assert_eq!(config.exit_strategies.stop_loss.percentage, 12.5);
        // untouched groups keep defaults
        assert_eq!(config.safety.min_token_age_seconds, 60);
        assert!(config.exit_strategies.trailing_stop.enabled);
    }

    #[test]
    fn test_handle_apply_returns_previous() {
        let handle = ConfigHandle::new(Config::default());
        let mut next = Config::default();
        next.safety.min_holders = 10;

        let previous = handle.apply(next).unwrap();
        assert_eq!(previous.safety.min_holders, 25);
        assert_eq!(handle.current().safety.min_holders, 10);

        let mut bad = Config::default();
        bad.position.min_position_size_sol = 0.0;
        assert!(handle.apply(bad).is_err());
        assert_eq!(handle.current().safety.min_holders, 10);
    }
}
