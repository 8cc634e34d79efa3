//! Event router and per-token workers
//!
//! Feed adapters hand raw records to the [`Intake`], which validates them
//! and pushes them through the backpressure queue. The router pops events in
//! arrival order: creates are handled inline (admission, subscription,
//! worker spawn), trades are forwarded to the worker that owns the mint.
//! Each worker applies trades to its token one at a time, so per-mint order
//! is preserved while unrelated tokens progress in parallel.
//!
//! Shutdown stops the intake, lets workers drain their queues within
//! `engine.shutdown_deadline_ms`, reports what the missed-opportunity
//! tracker still holds and writes one final snapshot.

use async_trait::async_trait;
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::error::{Error, Result};
use crate::events::{BotEvent, EventBus};
use crate::position::manager::{ExitOutcome, OpenRequest, PositionManager};
use crate::position::position::Position;
use crate::price::SolPriceOracle;
use crate::safety::checker::{FailedCheck, SafetyChecker, SafetyOutcome};
use crate::safety::missed::{MissedOpportunity, MissedOpportunityTracker};
use crate::stats::analytics::{Analytics, AnalyticsSnapshot, Counter, Latency};
use crate::stats::persistence::{SnapshotHandle, SnapshotStore, SnapshotWriter};
use crate::stream::backpressure::BackpressureChannel;
use crate::stream::event::{CreateEvent, FeedEvent, RawFeedRecord, TradeEvent};
use crate::stream::pumpportal::{FeedSink, SubscriptionControl};
use crate::strategy::sizing::PositionSizer;
use crate::strategy::types::{ExitReason, MarketContext};
use crate::token::state::{StateTransition, TokenState};
use crate::token::token::{SafetyFailureMark, Token, TokenSignal, TradeContext};
use crate::token::TokenRegistry;
use crate::trading::simulation::TxSimulator;
use crate::wallet::{Wallet, WalletState};

/// Everything the router and the workers share
pub struct EngineContext {
    config: ConfigHandle,
    registry: TokenRegistry,
    positions: PositionManager,
    missed: MissedOpportunityTracker,
    analytics: Arc<Analytics>,
    events: EventBus,
    price: SolPriceOracle,
    subscriptions: Arc<dyn SubscriptionControl>,
    /// Highest event timestamp seen so far (ms)
    clock: AtomicI64,
    /// Mints whose trades bypass backpressure drops
    priority_mints: DashSet<String>,
    live: bool,
}

impl EngineContext {
    /// Wire up wallet, simulator and position manager from `config`.
    /// `live` lets the clock follow wall time when the feed is quiet.
    pub fn build(
        config: Config,
        subscriptions: Arc<dyn SubscriptionControl>,
        snapshots: Option<SnapshotHandle>,
        events: EventBus,
        cancel: CancellationToken,
        live: bool,
    ) -> Self {
        let analytics = Arc::new(Analytics::new());
        let wallet = Arc::new(Wallet::new(config.wallet.initial_balance_sol, events.clone()));
        let simulator = Arc::new(TxSimulator::new(
            config.transaction.simulation_mode.clone(),
            cancel,
        ));
        let price = SolPriceOracle::new(config.price.sol_usd);
        let config = ConfigHandle::new(config);
        let positions = PositionManager::new(
            config.clone(),
            wallet,
            simulator,
            Arc::clone(&analytics),
            events.clone(),
            snapshots,
        );

        Self {
            config,
            registry: TokenRegistry::new(),
            positions,
            missed: MissedOpportunityTracker::new(),
            analytics,
            events,
            price,
            subscriptions,
            clock: AtomicI64::new(0),
            priority_mints: DashSet::new(),
            live,
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn missed(&self) -> &MissedOpportunityTracker {
        &self.missed
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn price(&self) -> &SolPriceOracle {
        &self.price
    }

    /// Engine time in ms
    pub fn now(&self) -> i64 {
        let clock = self.clock.load(Ordering::Relaxed);
        if self.live {
            clock.max(chrono::Utc::now().timestamp_millis())
        } else {
            clock
        }
    }

    fn advance_clock(&self, timestamp: i64) {
        self.clock.fetch_max(timestamp, Ordering::Relaxed);
    }

    pub fn is_priority(&self, mint: &str) -> bool {
        self.priority_mints.contains(mint)
    }

    /// Admit a freshly created token. Returns true if it is now tracked.
    pub async fn on_create(&self, event: &CreateEvent) -> Result<bool> {
        self.advance_clock(event.timestamp);
        if self.registry.contains(&event.mint) {
            debug!(mint = %event.mint, "Create for known mint ignored");
            return Ok(false);
        }

        let config = self.config.current();
        let market_cap_usd = self.price.sol_to_usd(event.market_cap_sol);
        if market_cap_usd > config.thresholds.heating_up_usd {
            debug!(
                mint = %event.mint,
                market_cap_usd = format!("{:.0}", market_cap_usd),
                "Token created above heating-up threshold, ignored"
            );
            return Ok(false);
        }

        let token = Token::from_create(event, &config.metrics)?;
        if !self.registry.insert(token) {
            return Ok(false);
        }
        self.subscriptions.subscribe_token_trades(&event.mint).await?;
        self.analytics.increment(Counter::TokensAdmitted);

        info!(
            mint = %event.mint,
            symbol = %event.symbol,
            market_cap_sol = format!("{:.2}", event.market_cap_sol),
            "Tracking new token"
        );
        self.events.publish(BotEvent::TokenAdded {
            mint: event.mint.clone(),
            symbol: event.symbol.clone(),
            name: event.name.clone(),
            market_cap_sol: event.market_cap_sol,
            timestamp: event.timestamp,
        });
        Ok(true)
    }

    /// Fold one trade into its token and act on the resulting state
    pub async fn on_trade(&self, event: &TradeEvent) -> Result<()> {
        let started = Instant::now();
        self.advance_clock(event.timestamp);

        let Some(shared) = self.registry.get(&event.mint) else {
            debug!(mint = %event.mint, "Trade for unknown mint dropped");
            return Ok(());
        };
        let config = self.config.current();
        let sol_usd = self.price.usd_per_sol();
        let mut token = shared.lock().await;
        let was_terminal = token.state().is_terminal();
        let was_in_position = token.state() == TokenState::InPosition;

        let ctx = TradeContext {
            thresholds: &config.thresholds,
            pump: &config.safety.pump_detection,
            sol_usd,
        };
        let signals = match token.apply_trade(event, &ctx) {
            Ok(signals) => signals,
            Err(Error::DuplicateEvent { mint, timestamp }) => {
                self.analytics.increment(Counter::DuplicateEvents);
                debug!(mint = %mint, timestamp, "Duplicate trade ignored");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let now = event.timestamp;
        for signal in signals {
            self.publish_signal(&token.mint, signal, now, started);
        }
        self.missed
            .observe(&token.mint, token.current_price, token.market_cap_sol, now);

        match token.state() {
            TokenState::InPosition => self.manage_position(&mut token, now, sol_usd).await?,
            TokenState::Recovery => self.consider_entry(&mut token, now, sol_usd).await?,
            TokenState::Dead if was_in_position => self.liquidate(&token, now, sol_usd).await?,
            _ => {}
        }

        if token.state().is_terminal() && !was_terminal {
            self.retire(&token.mint).await;
        }
        self.update_priority(&token);
        Ok(())
    }

    fn publish_signal(&self, mint: &str, signal: TokenSignal, timestamp: i64, started: Instant) {
        match signal {
            TokenSignal::PriceUpdate { price, market_cap_sol } => {
                self.events.publish(BotEvent::PriceUpdate {
                    mint: mint.to_string(),
                    price,
                    market_cap_sol,
                    timestamp,
                });
            }
            TokenSignal::PumpDetected {
                price_change_pct,
                volume_increase,
            } => {
                self.analytics
                    .record_latency(Latency::PumpDetection, started.elapsed().as_millis() as u64);
                info!(
                    mint = %mint,
                    price_change_pct = format!("{:.1}", price_change_pct),
                    volume_increase = format!("{:.1}", volume_increase),
                    "Pump detected"
                );
                self.events.publish(BotEvent::PumpDetected {
                    mint: mint.to_string(),
                    price_change_pct,
                    volume_increase,
                    timestamp,
                });
            }
            TokenSignal::DrawdownDetected { drawdown_pct } => {
                self.events.publish(BotEvent::DrawdownDetected {
                    mint: mint.to_string(),
                    drawdown_pct,
                    timestamp,
                });
            }
            TokenSignal::StateChanged(transition) => self.publish_transition(mint, &transition),
        }
    }

    fn publish_transition(&self, mint: &str, transition: &StateTransition) {
        info!(
            mint = %mint,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "Token state changed"
        );
        self.events.publish(BotEvent::TokenStateChanged {
            mint: mint.to_string(),
            from: transition.from,
            to: transition.to,
            reason: transition.reason.clone(),
            timestamp: transition.timestamp,
        });
    }

    fn market_context(&self, token: &Token, now: i64) -> MarketContext {
        let period_ms = self.config.current().exit_strategies.volume_based.measurement_period_ms;
        MarketContext {
            price: token.current_price,
            volatility: token.volatility(),
            volume_sol: token.volume_in(period_ms, now),
            timestamp: now,
        }
    }

    async fn manage_position(&self, token: &mut Token, now: i64, sol_usd: f64) -> Result<()> {
        let market = self.market_context(token, now);

        match self.positions.on_market_update(&token.mint, market, sol_usd).await {
            Ok(Some(ExitOutcome::Closed(position))) => {
                let reason = position
                    .close_reason
                    .map(|r| r.code())
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                let why = format!("position closed: {}", reason);
                let transition = token.transition_to(TokenState::Closed, now, why)?;
                self.publish_transition(&token.mint, &transition);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(Error::SimulatorCancelled) => {
                debug!(mint = %token.mint, "Exit abandoned on shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The token died under an open position: sell what is left
    async fn liquidate(&self, token: &Token, now: i64, sol_usd: f64) -> Result<()> {
        let market = self.market_context(token, now);

        match self
            .positions
            .force_exit(&token.mint, market, ExitReason::TokenDead, sol_usd)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::SimulatorCancelled) => {
                debug!(mint = %token.mint, "Liquidation abandoned on shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn consider_entry(&self, token: &mut Token, now: i64, sol_usd: f64) -> Result<()> {
        let config = self.config.current();
        if !self.positions.can_open(now).await {
            return Ok(());
        }
        let checker = SafetyChecker::new(&config.safety);
        if !checker.should_evaluate(token, now) {
            return Ok(());
        }

        match checker.check(token, now, sol_usd) {
            Ok(SafetyOutcome::Approved) => self.enter(token, now, &config).await,
            Ok(SafetyOutcome::Rejected(failed)) => {
                self.reject(token, now, failed, &config);
                Ok(())
            }
            Err(e) => {
                warn!(mint = %token.mint, "Safety check errored: {}", e);
                self.events
                    .publish(BotEvent::error(&e, format!("safety check for {}", token.mint)));
                self.reject(token, now, vec![FailedCheck::internal(&e.to_string())], &config);
                Ok(())
            }
        }
    }

    async fn enter(&self, token: &mut Token, now: i64, config: &Config) -> Result<()> {
        self.analytics.increment(Counter::SafetyPasses);
        self.missed.untrack(&token.mint);
        info!(mint = %token.mint, symbol = %token.symbol, "Safety checks passed");

        let period_ms = config.exit_strategies.volume_based.measurement_period_ms;
        let request = OpenRequest {
            mint: token.mint.clone(),
            symbol: token.symbol.clone(),
            price: token.current_price,
            market_cap_sol: token.market_cap_sol,
            volatility: token.volatility(),
            reference_volume_sol: token.volume_in(period_ms, now),
            timestamp: now,
        };

        match self.positions.open_position(request).await {
            Ok(_) => {
                let transition =
                    token.transition_to(TokenState::InPosition, now, "position opened")?;
                self.publish_transition(&token.mint, &transition);
                Ok(())
            }
            // the token stays in RECOVERY
            Err(Error::SimulatorCancelled) => Ok(()),
            Err(e) => {
                self.events
                    .publish(BotEvent::error(&e, format!("open position for {}", token.mint)));
                Ok(())
            }
        }
    }

    fn reject(&self, token: &mut Token, now: i64, failed: Vec<FailedCheck>, config: &Config) {
        self.analytics.increment(Counter::SafetyFailures);
        token.last_safety_failure = Some(SafetyFailureMark {
            timestamp: now,
            price: token.current_price,
        });

        let names: Vec<&str> = failed.iter().map(|c| c.name.as_str()).collect();
        warn!(
            mint = %token.mint,
            checks = %names.join(","),
            reason = %failed.first().map(|c| c.reason.as_str()).unwrap_or_default(),
            "Safety check failed"
        );

        if config.missed_opportunity.enabled {
            let size = PositionSizer::new(&config.position)
                .calculate_size(token.market_cap_sol, token.volatility());
            self.missed.enroll(token.snapshot(now), failed, size);
        }
    }

    /// Token reached CLOSED or DEAD: settle its trace and stop its trades
    async fn retire(&self, mint: &str) {
        let config = self.config.current();
        if let Some(opportunity) = self.missed.finalize(mint, &config.missed_opportunity) {
            self.report_missed(opportunity);
        }
        self.priority_mints.remove(mint);
        if let Err(e) = self.subscriptions.unsubscribe_token_trades(mint).await {
            warn!(mint = %mint, "Unsubscribe failed: {}", e);
        }
    }

    fn update_priority(&self, token: &Token) {
        match token.state() {
            TokenState::Recovery | TokenState::InPosition => {
                self.priority_mints.insert(token.mint.clone());
            }
            _ => {
                self.priority_mints.remove(&token.mint);
            }
        }
    }

    fn report_missed(&self, opportunity: MissedOpportunity) {
        self.analytics.increment(Counter::MissedOpportunities);
        info!(
            mint = %opportunity.mint,
            gain_pct = format!("{:.1}", opportunity.gain_pct),
            time_to_peak_ms = opportunity.time_to_peak_ms,
            potential_profit_sol = format!("{:.4}", opportunity.potential_profit_sol),
            "Missed opportunity"
        );
        self.events.publish(BotEvent::MissedOpportunity {
            opportunity: Box::new(opportunity),
        });
    }

    /// Log and publish an error that stopped one event
    pub fn report_error(&self, err: &Error, context: impl Into<String>) {
        let context = context.into();
        match err {
            Error::IllegalPositionState(_)
            | Error::IllegalTokenTransition { .. }
            | Error::Internal(_) => {
                error!(context = %context, "{}", err)
            }
            _ => warn!(context = %context, "{}", err),
        }
        self.events.publish(BotEvent::error(err, context));
    }

    /// Periodic housekeeping. Returns the mints swept from the registry.
    /// Never waits on a token lock, so the router keeps flowing.
    pub async fn tick(self: &Arc<Self>) -> Vec<String> {
        let config = self.config.current();
        let now = self.now();

        let swept = self.registry.sweep(now, config.registry.sweep_interval_ms);
        for mint in &swept {
            self.priority_mints.remove(mint);
            if let Err(e) = self.subscriptions.unsubscribe_token_trades(mint).await {
                warn!(mint = %mint, "Unsubscribe failed: {}", e);
            }
        }

        if config.missed_opportunity.enabled {
            for opportunity in self.missed.expire(now, &config.missed_opportunity) {
                self.report_missed(opportunity);
            }
        }

        // time exits must fire even when the token stops trading
        if let Some(mint) = self.positions.active_mint().await {
            let context = Arc::clone(self);
            tokio::spawn(async move { context.check_idle_position(&mint, now).await });
        }

        swept
    }

    /// Evaluate the open position of a quiet token. A busy worker evaluates
    /// it itself, so a held lock means there is nothing to do.
    async fn check_idle_position(&self, mint: &str, now: i64) {
        let Some(shared) = self.registry.get(mint) else {
            return;
        };
        let Ok(mut token) = shared.try_lock() else {
            return;
        };
        if token.state() != TokenState::InPosition {
            return;
        }
        let sol_usd = self.price.usd_per_sol();
        if let Err(e) = self.manage_position(&mut token, now, sol_usd).await {
            self.report_error(&e, format!("position check for {}", mint));
        }
        if token.state().is_terminal() {
            self.retire(mint).await;
        }
    }

    /// Report every trace still tracked, used at shutdown
    pub fn flush_missed(&self) {
        let config = self.config.current();
        if !config.missed_opportunity.enabled {
            return;
        }
        for opportunity in self.missed.drain(&config.missed_opportunity) {
            self.report_missed(opportunity);
        }
    }

    /// Reinstall persisted position and analytics. A corrupt file is fatal.
    pub async fn restore(&self, store: &SnapshotStore) -> Result<Option<Position>> {
        if let Some(analytics) = store.load_analytics().await? {
            info!(trades = analytics.total_trades, "Restored analytics");
            self.analytics.restore(analytics);
        }
        let Some(snapshot) = store.load_positions().await? else {
            return Ok(None);
        };
        let Some(position) = self.positions.restore(snapshot).await else {
            return Ok(None);
        };

        let config = self.config.current();
        let token = Token::resumed_in_position(
            &position.mint,
            &position.symbol,
            position.current_price,
            position.last_update,
            &config.metrics,
        );
        self.registry.insert(token);
        self.priority_mints.insert(position.mint.clone());
        self.advance_clock(position.last_update);
        self.subscriptions.subscribe_token_trades(&position.mint).await?;
        Ok(Some(position))
    }
}

/// Entry point for feed adapters
pub struct Intake {
    inbound: Arc<BackpressureChannel<FeedEvent>>,
    context: Arc<EngineContext>,
}

impl Intake {
    /// Stop accepting events; the router drains what is queued and exits
    pub fn close(&self) {
        self.inbound.close();
    }
}

#[async_trait]
impl FeedSink for Intake {
    async fn deliver(&self, record: RawFeedRecord) -> Result<()> {
        let event = match record.validate() {
            Ok(event) => event,
            Err(e) => {
                self.malformed(&e.to_string());
                return Ok(());
            }
        };

        if self.context.live {
            let lag = chrono::Utc::now().timestamp_millis() - event.timestamp();
            if lag >= 0 {
                self.context
                    .analytics
                    .record_latency(Latency::FeedEndToEnd, lag as u64);
            }
        }

        let is_priority = event.is_create() || self.context.is_priority(event.mint());
        let dropped_before = self.inbound.dropped_count();
        match self.inbound.send(event, is_priority).await {
            Ok(_) => {}
            Err(Error::FeedDisconnected) => {
                debug!("Intake closed, event discarded");
            }
            Err(e) => return Err(e),
        }
        let dropped = self.inbound.dropped_count().saturating_sub(dropped_before);
        self.context.analytics.add(Counter::DroppedEvents, dropped);
        Ok(())
    }

    fn malformed(&self, detail: &str) {
        self.context.analytics.increment(Counter::MalformedEvents);
        warn!("Dropped malformed feed event: {}", detail);
    }
}

/// Final state handed back by [`Engine::run`]
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub wallet: WalletState,
    pub open_position: Option<Position>,
    pub analytics: AnalyticsSnapshot,
    pub tracked_tokens: usize,
}

pub struct Engine {
    context: Arc<EngineContext>,
    inbound: Arc<BackpressureChannel<FeedEvent>>,
    intake: Arc<Intake>,
    snapshots: Option<SnapshotHandle>,
    writer_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build the engine and, when persistence is enabled, restore the last
    /// snapshot and start the snapshot writer.
    pub async fn new(
        config: Config,
        subscriptions: Arc<dyn SubscriptionControl>,
        cancel: CancellationToken,
        live: bool,
    ) -> Result<Self> {
        let events = EventBus::new(config.engine.event_bus_capacity);
        let inbound = Arc::new(BackpressureChannel::new(
            config.backpressure.channel_capacity,
            config.backpressure.drop_policy,
        ));

        let (store, snapshots, writer_task) = if config.persistence.enabled {
            let store = SnapshotStore::new(&config.persistence.dir);
            let writer = SnapshotWriter::new(
                store.clone(),
                config.persistence.clone(),
                events.clone(),
                cancel.clone(),
            );
            let (handle, task) = writer.spawn();
            (Some(store), Some(handle), Some(task))
        } else {
            (None, None, None)
        };

        let context = Arc::new(EngineContext::build(
            config,
            subscriptions,
            snapshots.clone(),
            events,
            cancel.clone(),
            live,
        ));

        if let Some(store) = &store {
            if let Some(position) = context.restore(store).await? {
                info!(mint = %position.mint, "Resuming open position");
            }
        }

        let intake = Arc::new(Intake {
            inbound: Arc::clone(&inbound),
            context: Arc::clone(&context),
        });

        Ok(Self {
            context,
            inbound,
            intake,
            snapshots,
            writer_task,
            cancel,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.context.events
    }

    pub fn intake(&self) -> Arc<Intake> {
        Arc::clone(&self.intake)
    }

    /// Route events until cancelled or until the intake is closed and empty
    pub async fn run(self) -> Result<EngineReport> {
        let config = self.context.config.current();
        self.context.subscriptions.subscribe_new_tokens().await?;

        let mut workers: HashMap<String, mpsc::Sender<TradeEvent>> = HashMap::new();
        let mut tasks = JoinSet::new();
        for mint in self.context.registry.mints() {
            self.spawn_worker(mint, &mut workers, &mut tasks);
        }

        let mut sweep = tokio::time::interval(Duration::from_millis(
            config.registry.sweep_interval_ms.max(1) as u64,
        ));
        let mut snapshot_timer =
            tokio::time::interval(Duration::from_millis(
                config.persistence.snapshot_interval_ms.max(1),
            ));

        info!(tokens = workers.len(), "Engine started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                item = self.inbound.recv() => match item {
                    Some(item) => self.route(item.event, &mut workers, &mut tasks).await,
                    None => {
                        info!("Intake closed and drained");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    for mint in self.context.tick().await {
                        workers.remove(&mint);
                    }
                }
                _ = snapshot_timer.tick() => {
                    if let Some(handle) = &self.snapshots {
                        handle.enqueue(self.context.positions.snapshot(self.context.now()).await);
                    }
                }
            }
        }

        self.shutdown(workers, tasks).await
    }

    async fn route(
        &self,
        event: FeedEvent,
        workers: &mut HashMap<String, mpsc::Sender<TradeEvent>>,
        tasks: &mut JoinSet<()>,
    ) {
        match event {
            FeedEvent::Create(create) => match self.context.on_create(&create).await {
                Ok(true) => self.spawn_worker(create.mint, workers, tasks),
                Ok(false) => {}
                Err(e) => self.context.report_error(&e, format!("create for {}", create.mint)),
            },
            FeedEvent::Trade(trade) => match workers.get(&trade.mint) {
                Some(worker) => {
                    if worker.send(trade).await.is_err() {
                        debug!("Token worker already stopped");
                    }
                }
                None => {
                    debug!(mint = %trade.mint, "Trade for unknown mint dropped");
                }
            },
        }
    }

    fn spawn_worker(
        &self,
        mint: String,
        workers: &mut HashMap<String, mpsc::Sender<TradeEvent>>,
        tasks: &mut JoinSet<()>,
    ) {
        let capacity = self.context.config.current().registry.token_channel_capacity;
        let (tx, mut rx) = mpsc::channel::<TradeEvent>(capacity.max(1));
        let context = Arc::clone(&self.context);
        let worker_mint = mint.clone();
        tasks.spawn(async move {
            while let Some(trade) = rx.recv().await {
                if let Err(e) = context.on_trade(&trade).await {
                    context.report_error(&e, format!("trade for {}", trade.mint));
                }
            }
            debug!(mint = %worker_mint, "Token worker stopped");
        });
        workers.insert(mint, tx);
    }

    async fn shutdown(
        self,
        workers: HashMap<String, mpsc::Sender<TradeEvent>>,
        mut tasks: JoinSet<()>,
    ) -> Result<EngineReport> {
        let config = self.context.config.current();
        self.inbound.close();
        drop(workers);

        let deadline = Duration::from_millis(config.engine.shutdown_deadline_ms);
        let drained = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                deadline_ms = config.engine.shutdown_deadline_ms,
                "Workers still busy, cancelling"
            );
            self.cancel.cancel();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.context.flush_missed();

        if let Some(handle) = &self.snapshots {
            handle.enqueue(self.context.positions.snapshot(self.context.now()).await);
            if let Err(e) = handle.flush().await {
                error!("Final snapshot failed: {}", e);
            }
        }
        if let Some(task) = self.writer_task {
            task.abort();
        }

        let report = EngineReport {
            wallet: self.context.positions.wallet().state().await,
            open_position: self.context.positions.active_position().await,
            analytics: self.context.analytics.snapshot(),
            tracked_tokens: self.context.registry.len(),
        };
        info!(
            balance_sol = format!("{:.4}", report.wallet.balance_sol),
            pnl_sol = format!("{:.4}", report.wallet.pnl_sol()),
            trades = report.analytics.total_trades,
            "Engine stopped"
        );
        Ok(report)
    }
}
