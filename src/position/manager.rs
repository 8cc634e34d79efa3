//! Position management
//!
//! Owns the single active position. Opens it through the transaction
//! simulator, feeds it price updates, executes exit decisions and keeps the
//! wallet, analytics and snapshots in step.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::events::{BotEvent, EventBus};
use crate::position::position::{PartialExit, Position};
use crate::stats::analytics::{Analytics, Latency};
use crate::stats::persistence::{PositionsSnapshot, Snapshot, SnapshotHandle};
use crate::stream::event::TradeSide;
use crate::strategy::exit_manager::ExitEngine;
use crate::strategy::sizing::PositionSizer;
use crate::strategy::types::{ExitDecision, ExitReason, MarketContext};
use crate::trading::simulation::TxSimulator;
use crate::wallet::Wallet;

/// What the engine knows when it asks for an entry
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub mint: String,
    pub symbol: String,
    pub price: f64,
    pub market_cap_sol: f64,
    pub volatility: f64,
    /// Recent SOL volume used for the price impact
    pub reference_volume_sol: f64,
    pub timestamp: i64,
}

/// Result of an executed exit
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Partial(PartialExit),
    /// The last exit closed the position
    Closed(Box<Position>),
}

#[derive(Debug, Default)]
struct Slot {
    position: Option<Position>,
    last_closed_at: Option<i64>,
    /// An exit is waiting out its simulated delay
    exiting: bool,
}

pub struct PositionManager {
    slot: Mutex<Slot>,
    config: ConfigHandle,
    wallet: Arc<Wallet>,
    simulator: Arc<TxSimulator>,
    analytics: Arc<Analytics>,
    events: EventBus,
    snapshots: Option<SnapshotHandle>,
}

impl PositionManager {
    pub fn new(
        config: ConfigHandle,
        wallet: Arc<Wallet>,
        simulator: Arc<TxSimulator>,
        analytics: Arc<Analytics>,
        events: EventBus,
        snapshots: Option<SnapshotHandle>,
    ) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            config,
            wallet,
            simulator,
            analytics,
            events,
            snapshots,
        }
    }

    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    /// Clone of the active (pending or open) position
    pub async fn active_position(&self) -> Option<Position> {
        self.slot.lock().await.position.clone()
    }

    pub async fn active_mint(&self) -> Option<String> {
        self.slot.lock().await.position.as_ref().map(|p| p.mint.clone())
    }

    /// No active position and the post-close cooldown has passed
    pub async fn can_open(&self, now: i64) -> bool {
        let slot = self.slot.lock().await;
        let cooldown_ms = self.config.current().position_manager.cooldown_after_close_ms;
        Self::slot_allows_open(&slot, now, cooldown_ms)
    }

    fn slot_allows_open(slot: &Slot, now: i64, cooldown_ms: i64) -> bool {
        if slot.position.is_some() {
            return false;
        }
        match slot.last_closed_at {
            Some(closed_at) => now - closed_at >= cooldown_ms,
            None => true,
        }
    }

    /// Size, simulate and open a position. On any failure (including a
    /// cancelled delay) nothing is debited and no position remains.
    pub async fn open_position(&self, request: OpenRequest) -> Result<Position> {
        let config = self.config.current();
        let started = Instant::now();

        let size = {
            let mut slot = self.slot.lock().await;
            let cooldown_ms = config.position_manager.cooldown_after_close_ms;
            if !Self::slot_allows_open(&slot, request.timestamp, cooldown_ms) {
                return Err(Error::IllegalPositionState(format!(
                    "cannot open {}: a position is active or cooling down",
                    request.mint
                )));
            }
            let size = PositionSizer::new(&config.position)
                .calculate_size(request.market_cap_sol, request.volatility);
            slot.position = Some(Position::pending(
                &request.mint,
                &request.symbol,
                size,
                request.price,
                request.timestamp,
            ));
            size
        };

        match self.fill_entry(&request, size).await {
            Ok(position) => {
                self.analytics
                    .record_latency(Latency::TradeExecution, started.elapsed().as_millis() as u64);
                info!(
                    mint = %position.mint,
                    symbol = %position.symbol,
                    size_sol = format!("{:.4}", position.size),
                    entry_price = position.entry_price,
                    "Position opened"
                );
                self.events.publish(BotEvent::PositionOpened {
                    position: position.clone(),
                });
                self.persist(position.entry_time).await;
                Ok(position)
            }
            Err(e) => {
                self.slot.lock().await.position = None;
                match &e {
                    Error::SimulatorCancelled => {
                        info!(mint = %request.mint, "Entry abandoned on shutdown")
                    }
                    Error::InsufficientBalance { .. } => {
                        warn!(mint = %request.mint, "Entry skipped: {}", e)
                    }
                    _ => error!(mint = %request.mint, "Entry failed: {}", e),
                }
                Err(e)
            }
        }
    }

    async fn fill_entry(&self, request: &OpenRequest, size: f64) -> Result<Position> {
        let delay = self.simulator.simulate_delay().await?;
        let execution = self
            .simulator
            .apply_impact(size, request.price, request.reference_volume_sol, TradeSide::Buy);

        self.wallet.debit(size).await?;

        let mut slot = self.slot.lock().await;
        let Some(position) = slot.position.as_mut() else {
            // slot was cleared underneath us; give the SOL back
            self.wallet.credit(size).await?;
            return Err(Error::IllegalPositionState("pending position vanished".to_string()));
        };
        let filled_at = request.timestamp + delay.as_millis() as i64;
        if let Err(e) = position.open(execution.price, execution.slippage * 100.0, filled_at) {
            self.wallet.credit(size).await?;
            return Err(e);
        }
        Ok(position.clone())
    }

    /// Apply a market update to the open position and execute whatever the
    /// exit engine decides. Updates for other mints are ignored.
    pub async fn on_market_update(
        &self,
        mint: &str,
        market: MarketContext,
        sol_usd: f64,
    ) -> Result<Option<ExitOutcome>> {
        let config = self.config.current();
        let decision = {
            let mut slot = self.slot.lock().await;
            if slot.exiting {
                return Ok(None);
            }
            let Some(position) = slot.position.as_mut() else {
                return Ok(None);
            };
            if position.mint != mint || !position.is_open() {
                return Ok(None);
            }
            position.update_price(market.price, market.timestamp)?;
            position.observe_volume(market.volume_sol);

            let engine = ExitEngine::new(&config.exit_strategies);
            let Some(decision) = engine.evaluate(position, &market) else {
                return Ok(None);
            };
            slot.exiting = true;
            decision
        };

        self.execute_exit(mint, decision, market, sol_usd).await.map(Some)
    }

    /// Sell everything that is left, regardless of the exit strategies.
    /// Returns `None` when `mint` has no open position.
    pub async fn force_exit(
        &self,
        mint: &str,
        market: MarketContext,
        reason: ExitReason,
        sol_usd: f64,
    ) -> Result<Option<ExitOutcome>> {
        {
            let mut slot = self.slot.lock().await;
            if slot.exiting {
                return Ok(None);
            }
            let Some(position) = slot.position.as_mut() else {
                return Ok(None);
            };
            if position.mint != mint || !position.is_open() {
                return Ok(None);
            }
            position.update_price(market.price, market.timestamp)?;
            slot.exiting = true;
        }
        warn!(mint = %mint, reason = %reason, "Forcing full exit");

        self.execute_exit(mint, ExitDecision::full(reason), market, sol_usd)
            .await
            .map(Some)
    }

    /// Wait out the simulated delay without holding the slot, then fill.
    /// The caller has set `slot.exiting`.
    async fn execute_exit(
        &self,
        mint: &str,
        decision: ExitDecision,
        market: MarketContext,
        sol_usd: f64,
    ) -> Result<ExitOutcome> {
        let delay = match self.simulator.simulate_delay().await {
            Ok(delay) => delay,
            Err(e) => {
                self.slot.lock().await.exiting = false;
                return Err(e);
            }
        };

        let mut slot = self.slot.lock().await;
        slot.exiting = false;
        let Some(position) = slot.position.as_mut().filter(|p| p.mint == mint && p.is_open()) else {
            return Err(Error::IllegalPositionState(format!(
                "position for {} vanished during exit",
                mint
            )));
        };
        let portion = decision.portion.min(position.remaining_size);
        let exit_value = portion * position.size * market.price / position.entry_price;
        let execution = self
            .simulator
            .apply_impact(exit_value, market.price, market.volume_sol, TradeSide::Sell);
        let exit_time = market.timestamp + delay.as_millis() as i64;

        let exit = position.apply_exit(
            decision.portion,
            execution.price,
            decision.reason,
            exit_time,
            sol_usd,
        )?;
        self.wallet.credit(exit.proceeds_sol).await?;

        info!(
            mint = %mint,
            reason = %exit.reason,
            portion = format!("{:.2}", exit.portion),
            pnl_sol = format!("{:.4}", exit.realized_pnl_sol),
            "Exit executed"
        );

        let outcome = if position.is_closed() {
            let closed = position.clone();
            slot.position = None;
            slot.last_closed_at = closed.closed_at;
            self.analytics.record_position_closed(&closed);
            info!(
                mint = %mint,
                reason = ?closed.close_reason.map(|r| r.code()),
                realized_pnl_sol = format!("{:.4}", closed.realized_pnl_sol),
                "Position closed"
            );
            self.events.publish(BotEvent::PositionClosed {
                position: closed.clone(),
            });
            ExitOutcome::Closed(Box::new(closed))
        } else {
            // the closing exit is reported through PositionClosed
            self.events.publish(BotEvent::PartialExit {
                mint: mint.to_string(),
                exit: exit.clone(),
            });
            ExitOutcome::Partial(exit)
        };
        drop(slot);

        self.persist(exit_time).await;
        Ok(outcome)
    }

    /// Current state for the snapshot files
    pub async fn positions_snapshot(&self, now: i64) -> PositionsSnapshot {
        let (position, last_closed_at) = {
            let slot = self.slot.lock().await;
            // a pending entry has not touched the wallet yet
            let position = slot.position.clone().filter(|p| p.is_open());
            (position, slot.last_closed_at)
        };
        PositionsSnapshot {
            position,
            wallet: self.wallet.state().await,
            last_closed_at,
            saved_at: now,
        }
    }

    pub async fn snapshot(&self, now: i64) -> Snapshot {
        Snapshot {
            positions: self.positions_snapshot(now).await,
            analytics: self.analytics.snapshot(),
        }
    }

    /// Enqueue a snapshot stamped with the event time of the change
    async fn persist(&self, now: i64) {
        if !self.config.current().position_manager.snapshot_on_transition {
            return;
        }
        if let Some(handle) = &self.snapshots {
            handle.enqueue(self.snapshot(now).await);
        }
    }

    /// Reinstall persisted state at startup
    pub async fn restore(&self, snapshot: PositionsSnapshot) -> Option<Position> {
        self.wallet.restore(snapshot.wallet).await;
        let mut slot = self.slot.lock().await;
        slot.last_closed_at = snapshot.last_closed_at;
        slot.position = snapshot.position.filter(|p| p.is_open());
        if let Some(position) = &slot.position {
            info!(
                mint = %position.mint,
                remaining = position.remaining_size,
                "Restored open position"
            );
        } else {
            debug!("No open position to restore");
        }
        slot.position.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PersistenceConfig, SimulationModeConfig};
    use crate::stats::persistence::{SnapshotStore, SnapshotWriter};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn manager_with(config: Config, cancel: CancellationToken) -> PositionManager {
        manager_with_snapshots(config, cancel, None)
    }

    fn manager_with_snapshots(
        config: Config,
        cancel: CancellationToken,
        snapshots: Option<SnapshotHandle>,
    ) -> PositionManager {
        let events = EventBus::new(64);
        let wallet = Arc::new(Wallet::new(config.wallet.initial_balance_sol, events.clone()));
        let simulator = Arc::new(TxSimulator::new(
            config.transaction.simulation_mode.clone(),
            cancel,
        ));
        PositionManager::new(
            ConfigHandle::new(config),
            wallet,
            simulator,
            Arc::new(Analytics::new()),
            events,
            snapshots,
        )
    }

    fn simulated_config(seed: u64) -> Config {
        let mut config = instant_config();
        config.transaction.simulation_mode = SimulationModeConfig {
            seed: Some(seed),
            ..Default::default()
        };
        config
    }

    fn instant_config() -> Config {
        let mut config = Config::default();
        config.transaction.simulation_mode.enabled = false;
        config.position.volatility_scaling = false;
        config
    }

    fn request(price: f64, timestamp: i64) -> OpenRequest {
        OpenRequest {
            mint: "mint".into(),
            symbol: "SYM".into(),
            price,
            market_cap_sol: 44.0,
            volatility: 0.0,
            reference_volume_sol: 20.0,
            timestamp,
        }
    }

    fn market(price: f64, volume_sol: f64, timestamp: i64) -> MarketContext {
        MarketContext {
            price,
            volatility: 0.0,
            volume_sol,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_open_debits_wallet() {
        let manager = manager_with(instant_config(), CancellationToken::new());
        let position = manager.open_position(request(1.0, 0)).await.unwrap();

        assert!(position.is_open());
        assert!((position.size - 0.44).abs() < 1e-12);
        assert!((manager.wallet().balance().await - 9.56).abs() < 1e-12);
        assert!(!manager.can_open(1).await);

        // only one position at a time
        assert!(matches!(
            manager.open_position(request(1.0, 1)).await,
            Err(Error::IllegalPositionState(_))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let mut config = instant_config();
        config.wallet.initial_balance_sol = 0.2;
        let manager = manager_with(config, CancellationToken::new());

        let err = manager.open_position(request(1.0, 0)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(manager.active_position().await.is_none());
        assert_eq!(manager.wallet().balance().await, 0.2);
    }

    #[tokio::test]
    async fn test_stop_loss_closes_and_starts_cooldown() {
        let manager = manager_with(instant_config(), CancellationToken::new());
        manager.open_position(request(1.0, 0)).await.unwrap();

        let other = manager.on_market_update("other", market(0.1, 0.0, 10), 100.0).await;
        assert!(other.unwrap().is_none());
        let calm = manager.on_market_update("mint", market(0.95, 0.0, 10), 100.0).await;
        assert!(calm.unwrap().is_none());

        let outcome = manager.on_market_update("mint", market(0.7, 0.0, 20), 100.0).await.unwrap();
        let Some(ExitOutcome::Closed(position)) = outcome else {
            panic!("expected close, got {:?}", outcome);
        };
        assert_eq!(position.close_reason, Some(crate::strategy::types::ExitReason::StopLoss));
        assert!((position.realized_pnl_sol + 0.132).abs() < 1e-9);
        assert!((manager.wallet().balance().await - 9.868).abs() < 1e-9);

        assert!(!manager.can_open(20 + 29_999).await);
        assert!(manager.can_open(20 + 30_000).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_entry_leaves_no_trace() {
        let mut config = instant_config();
        config.transaction.simulation_mode = SimulationModeConfig {
            seed: Some(3),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let manager = Arc::new(manager_with(config, cancel.clone()));

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.open_position(request(1.0, 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.active_position().await.is_some());
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(Error::SimulatorCancelled)));
        assert!(manager.active_position().await.is_none());
        assert_eq!(manager.wallet().balance().await, 10.0);
    }

    #[tokio::test]
    async fn test_restore_open_position() {
        let manager = manager_with(instant_config(), CancellationToken::new());
        manager.open_position(request(1.0, 0)).await.unwrap();
        let snapshot = manager.positions_snapshot(5).await;

        let fresh = manager_with(instant_config(), CancellationToken::new());
        let restored = fresh.restore(snapshot.clone()).await.unwrap();
        assert_eq!(Some(restored), snapshot.position);
        assert!((fresh.wallet().balance().await - 9.56).abs() < 1e-12);
        assert_eq!(fresh.active_mint().await.as_deref(), Some("mint"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_delay_does_not_hold_the_slot() {
        let manager = Arc::new(manager_with(simulated_config(7), CancellationToken::new()));
        manager.open_position(request(1.0, 0)).await.unwrap();

        let exit = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.on_market_update("mint", market(0.1, 0.0, 10), 100.0).await
            })
        };
        // the exit is now waiting out its delay
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!exit.is_finished());

        let mint = tokio::time::timeout(Duration::from_millis(5), manager.active_mint()).await;
        assert_eq!(mint.unwrap().as_deref(), Some("mint"));
        assert!(manager.active_position().await.unwrap().is_open());
        // a second decision is not taken while one is in flight
        assert!(manager
            .on_market_update("mint", market(0.1, 0.0, 11), 100.0)
            .await
            .unwrap()
            .is_none());

        let outcome = exit.await.unwrap().unwrap();
        assert!(matches!(outcome, Some(ExitOutcome::Closed(_))));
        assert!(manager.active_position().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_exit_keeps_position_open() {
        let cancel = CancellationToken::new();
        let manager = Arc::new(manager_with(simulated_config(11), cancel.clone()));
        manager.open_position(request(1.0, 0)).await.unwrap();

        let exit = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.on_market_update("mint", market(0.1, 0.0, 10), 100.0).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(exit.await.unwrap(), Err(Error::SimulatorCancelled)));
        let position = manager.active_position().await.unwrap();
        assert!(position.is_open());
        assert_eq!(position.remaining_size, 1.0);
    }

    #[tokio::test]
    async fn test_force_exit_sells_everything() {
        let manager = manager_with(instant_config(), CancellationToken::new());
        manager.open_position(request(1.0, 0)).await.unwrap();

        assert!(manager
            .force_exit("other", market(0.5, 0.0, 10), ExitReason::TokenDead, 100.0)
            .await
            .unwrap()
            .is_none());

        // 0.98 would not trip any exit strategy
        let outcome = manager
            .force_exit("mint", market(0.98, 0.0, 10), ExitReason::TokenDead, 100.0)
            .await
            .unwrap();
        let Some(ExitOutcome::Closed(position)) = outcome else {
            panic!("expected close, got {:?}", outcome);
        };
        assert_eq!(position.close_reason, Some(ExitReason::TokenDead));
        assert_eq!(position.closed_at, Some(10));
        assert!((position.realized_pnl_sol + 0.0088).abs() < 1e-9);
        assert!(manager.active_position().await.is_none());
    }

    #[tokio::test]
    async fn test_close_snapshot_carries_close_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let events = EventBus::new(16);
        let (handle, _task) = SnapshotWriter::new(
            store.clone(),
            PersistenceConfig::default(),
            events,
            CancellationToken::new(),
        )
        .spawn();

        let cancel = CancellationToken::new();
        let manager = manager_with_snapshots(instant_config(), cancel, Some(handle.clone()));
        manager.open_position(request(1.0, 1_000)).await.unwrap();
        manager
            .on_market_update("mint", market(0.7, 0.0, 4_000), 100.0)
            .await
            .unwrap();
        handle.flush().await.unwrap();

        let snapshot = store.load_positions().await.unwrap().unwrap();
        assert!(snapshot.position.is_none());
        assert_eq!(snapshot.last_closed_at, Some(4_000));
        assert_eq!(snapshot.saved_at, 4_000);
    }
}
