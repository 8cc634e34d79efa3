//! Transaction simulation
//!
//! Synthetic latency and slippage standing in for on-chain execution. A fixed
//! seed makes every delay reproducible for backtests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SimulationModeConfig;
use crate::error::{Error, Result};
use crate::stream::event::TradeSide;

/// Execution price and the total slippage applied to it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Execution {
    pub price: f64,
    /// Signed fraction: positive for buys, negative for sells
    pub slippage: f64,
}

pub struct TxSimulator {
    config: SimulationModeConfig,
    rng: Mutex<StdRng>,
    last_tx_time: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl TxSimulator {
    pub fn new(config: SimulationModeConfig, cancel: CancellationToken) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            last_tx_time: Mutex::new(None),
            cancel,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn network_delay_ms(&self, rng: &mut StdRng) -> f64 {
        let min = self.config.min_network_delay_ms as f64;
        let max = (self.config.max_network_delay_ms as f64).max(min);
        let mut delay = if max > min { rng.gen_range(min..=max) } else { min };
        if rng.gen_bool(self.config.congestion_probability.clamp(0.0, 1.0)) {
            delay *= self.config.congestion_multiplier;
        }
        delay
    }

    /// Total delay for a transaction submitted at `now`
    async fn compute_delay(&self, now: Instant) -> Duration {
        let network_ms = {
            let mut rng = self.rng.lock().await;
            self.network_delay_ms(&mut rng)
        };
        let block_ms = self.config.avg_block_time_secs * 1000.0;

        let cooldown_ms = match *self.last_tx_time.lock().await {
            Some(last) => {
                let since = now.saturating_duration_since(last).as_millis() as f64;
                (self.config.min_time_between_tx_ms as f64 - since).max(0.0)
            }
            None => 0.0,
        };

        Duration::from_secs_f64((network_ms + block_ms + cooldown_ms).max(0.0) / 1000.0)
    }

    /// Suspend for a simulated confirmation delay. Returns the delay taken,
    /// or `SimulatorCancelled` if shutdown interrupts the wait.
    pub async fn simulate_delay(&self) -> Result<Duration> {
        if !self.config.enabled {
            return Ok(Duration::ZERO);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::SimulatorCancelled);
        }

        let delay = self.compute_delay(Instant::now()).await;
        debug!(delay_ms = delay.as_millis() as u64, "Simulating transaction delay");

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::SimulatorCancelled),
            _ = tokio::time::sleep(delay) => {
                *self.last_tx_time.lock().await = Some(Instant::now());
                Ok(delay)
            }
        }
    }

    /// Price impact for a trade of `size_sol` against `reference_volume_sol`
    pub fn apply_impact(
        &self,
        size_sol: f64,
        price: f64,
        reference_volume_sol: f64,
        side: TradeSide,
    ) -> Execution {
        if !self.config.enabled {
            return Execution { price, slippage: 0.0 };
        }

        let base = self.config.slippage_base_pct / 100.0;
        let denominator = reference_volume_sol.max(size_sol);
        let volume_impact = if denominator > 0.0 {
            size_sol / denominator * self.config.volume_multiplier / 100.0
        } else {
            0.0
        };

        let magnitude = (base + volume_impact) * self.config.volatility_multiplier;
        let slippage = if side.is_buy() { magnitude } else { -magnitude };

        Execution {
            price: price * (1.0 + slippage),
            slippage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SimulationModeConfig {
        SimulationModeConfig {
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_impact_formula() {
        let sim = TxSimulator::new(seeded(), CancellationToken::new());

        // base 0.5%, size equals the reference volume: 2% impact, x0.5
        let buy = sim.apply_impact(1.0, 2.0, 1.0, TradeSide::Buy);
        assert!((buy.slippage - 0.0125).abs() < 1e-12);
        assert!((buy.price - 2.025).abs() < 1e-12);

        let sell = sim.apply_impact(1.0, 2.0, 1.0, TradeSide::Sell);
        assert!((sell.price - 1.975).abs() < 1e-12);

        // deep volume leaves mostly the base slippage
        let deep = sim.apply_impact(1.0, 1.0, 100.0, TradeSide::Buy);
        assert!((deep.slippage - 0.0026).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_disabled_is_identity() {
        let config = SimulationModeConfig {
            enabled: false,
            ..Default::default()
        };
        let sim = TxSimulator::new(config, CancellationToken::new());
        assert_eq!(sim.simulate_delay().await.unwrap(), Duration::ZERO);
        assert_eq!(
            sim.apply_impact(1.0, 3.0, 0.0, TradeSide::Buy),
            Execution {
                price: 3.0,
                slippage: 0.0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_bounds_and_cooldown() {
        let sim = TxSimulator::new(seeded(), CancellationToken::new());

        let first = sim.simulate_delay().await.unwrap();
        assert!(first >= Duration::from_millis(450), "{:?}", first);
        assert!(first <= Duration::from_millis(1_025), "{:?}", first);

        // back to back: the 1s spacing is added on top
        let second = sim.simulate_delay().await.unwrap();
        assert!(second >= Duration::from_millis(1_450), "{:?}", second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_is_reproducible() {
        let a = TxSimulator::new(seeded(), CancellationToken::new());
        let b = TxSimulator::new(seeded(), CancellationToken::new());
        assert_eq!(a.simulate_delay().await.unwrap(), b.simulate_delay().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_delay() {
        let cancel = CancellationToken::new();
        let sim = std::sync::Arc::new(TxSimulator::new(seeded(), cancel.clone()));

        let task = {
            let sim = sim.clone();
            tokio::spawn(async move { sim.simulate_delay().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(Error::SimulatorCancelled)));
        assert!(matches!(sim.simulate_delay().await, Err(Error::SimulatorCancelled)));
    }
}
