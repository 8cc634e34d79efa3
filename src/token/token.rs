//! Token aggregate: reserves, metrics, holders and lifecycle for one mint

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::config::{MetricsConfig, PumpDetectionConfig, ThresholdsConfig};
use crate::error::{Error, Result};
use crate::stream::event::{CreateEvent, TradeEvent};
use crate::token::holders::HolderBook;
use crate::token::metrics::{PumpMetrics, TokenMetrics, VolumeStats, VolumeWindow};
use crate::token::state::{StateInputs, StateTransition, TokenState, TokenStateMachine};

/// What a trade changed, routed to the event bus by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum TokenSignal {
    PriceUpdate {
        price: f64,
        market_cap_sol: f64,
    },
    PumpDetected {
        price_change_pct: f64,
        volume_increase: f64,
    },
    DrawdownDetected {
        drawdown_pct: f64,
    },
    StateChanged(StateTransition),
}

/// Per-trade settings, borrowed from the current config
#[derive(Debug, Clone, Copy)]
pub struct TradeContext<'a> {
    pub thresholds: &'a ThresholdsConfig,
    pub pump: &'a PumpDetectionConfig,
    pub sol_usd: f64,
}

/// Last failed safety evaluation, drives the retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyFailureMark {
    pub timestamp: i64,
    pub price: f64,
}

/// Serializable view used in missed-opportunity records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSnapshot {
    pub mint: String,
    pub symbol: String,
    pub state: TokenState,
    pub timestamp: i64,
    pub age_secs: f64,
    pub price: f64,
    pub market_cap_sol: f64,
    pub v_sol: f64,
    pub holder_count: u32,
    pub top3_concentration: f64,
    pub creator_sell_percentage: f64,
    pub volatility: f64,
    pub volume_5m: VolumeStats,
    pub pump: PumpMetrics,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub mint: String,
    pub symbol: String,
    pub name: String,
    pub created_at: i64,
    pub creator: String,
    /// Fixed at creation from `marketCapSol * vTokens / vSol`
    pub total_supply: f64,
    pub current_price: f64,
    pub market_cap_sol: f64,
    pub v_tokens: f64,
    pub v_sol: f64,
    pub last_activity: i64,
    pub trade_count: u64,
    pub last_safety_failure: Option<SafetyFailureMark>,
    machine: TokenStateMachine,
    metrics: TokenMetrics,
    holders: HolderBook,
    last_event_ts: i64,
    seen_at_last_ts: HashSet<String>,
}

impl Token {
    pub fn from_create(event: &CreateEvent, config: &MetricsConfig) -> Result<Self> {
        if event.v_tokens <= 0.0 || event.v_sol <= 0.0 {
            return Err(Error::MalformedEvent(format!(
                "create for {} has empty reserves",
                event.mint
            )));
        }
        let price = event.v_sol / event.v_tokens;
        let total_supply = event.market_cap_sol * event.v_tokens / event.v_sol;

        let mut seen_at_last_ts = HashSet::new();
        if let Some(sig) = &event.signature {
            seen_at_last_ts.insert(sig.clone());
        }

        Ok(Self {
            mint: event.mint.clone(),
            symbol: event.symbol.clone(),
            name: event.name.clone(),
            created_at: event.timestamp,
            creator: event.creator.clone(),
            total_supply,
            current_price: price,
            market_cap_sol: event.market_cap_sol,
            v_tokens: event.v_tokens,
            v_sol: event.v_sol,
            last_activity: event.timestamp,
            trade_count: 0,
            last_safety_failure: None,
            machine: TokenStateMachine::new(&event.mint, price, event.timestamp),
            metrics: TokenMetrics::new(event.timestamp, price, event.market_cap_sol, config),
            holders: HolderBook::new(
                &event.creator,
                event.initial_buy,
                event.timestamp,
                config.max_trades_per_holder,
            ),
            last_event_ts: event.timestamp,
            seen_at_last_ts,
        })
    }

    /// Token rebuilt around a restored open position. Supply, reserves and
    /// holders are learned from the first trade that arrives.
    pub fn resumed_in_position(
        mint: &str,
        symbol: &str,
        price: f64,
        timestamp: i64,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            mint: mint.to_string(),
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            created_at: timestamp,
            creator: String::new(),
            total_supply: 0.0,
            current_price: price,
            market_cap_sol: 0.0,
            v_tokens: 0.0,
            v_sol: 0.0,
            last_activity: timestamp,
            trade_count: 0,
            last_safety_failure: None,
            machine: TokenStateMachine::starting_in(mint, TokenState::InPosition, price, timestamp),
            metrics: TokenMetrics::new(timestamp, price, 0.0, config),
            holders: HolderBook::new("", 0.0, timestamp, config.max_trades_per_holder),
            last_event_ts: 0,
            seen_at_last_ts: HashSet::new(),
        }
    }

    /// Fold a trade into the token. Replays and stale events fail with
    /// `DuplicateEvent` and leave the token untouched.
    pub fn apply_trade(
        &mut self,
        event: &TradeEvent,
        ctx: &TradeContext<'_>,
    ) -> Result<Vec<TokenSignal>> {
        if event.mint != self.mint {
            return Err(Error::UnknownMint(format!(
                "trade for {} routed to {}",
                event.mint, self.mint
            )));
        }
        self.guard_duplicate(event)?;

        if self.total_supply <= 0.0 && event.v_sol > 0.0 {
            self.total_supply = event.market_cap_sol * event.v_tokens / event.v_sol;
        }

        let volume_sol = event.volume_sol();
        self.v_tokens = event.v_tokens;
        self.v_sol = event.v_sol;
        self.market_cap_sol = event.market_cap_sol;
        self.current_price = event.price();
        self.last_activity = event.timestamp;
        self.trade_count += 1;

        self.holders.record_trade(
            &event.trader,
            event.side,
            event.token_amount,
            event.new_balance,
            volume_sol,
            event.timestamp,
        );

        let mut signals = vec![TokenSignal::PriceUpdate {
            price: self.current_price,
            market_cap_sol: self.market_cap_sol,
        }];

        if let Some(spike) = self.metrics.record_trade(
            event.timestamp,
            self.current_price,
            self.market_cap_sol,
            volume_sol,
            event.side.is_buy(),
            ctx.pump,
        ) {
            signals.push(TokenSignal::PumpDetected {
                price_change_pct: spike.price_change,
                volume_increase: spike.volume_increase,
            });
        }

        let drawdown_pct = self.machine.drawdown_percentage(self.current_price);
        let inputs = StateInputs {
            price: self.current_price,
            market_cap_usd: self.market_cap_sol * ctx.sol_usd,
            timestamp: event.timestamp,
        };
        for transition in self.machine.evaluate(&inputs, ctx.thresholds) {
            if transition.to == TokenState::Drawdown {
                signals.push(TokenSignal::DrawdownDetected { drawdown_pct });
            }
            signals.push(TokenSignal::StateChanged(transition));
        }

        debug!(
            mint = %self.mint,
            side = ?event.side,
            price = self.current_price,
            market_cap_sol = self.market_cap_sol,
            state = %self.state(),
            "Trade applied"
        );

        Ok(signals)
    }

    fn guard_duplicate(&mut self, event: &TradeEvent) -> Result<()> {
        let key = event.dedup_key();
        if event.timestamp < self.last_event_ts
            || (event.timestamp == self.last_event_ts && self.seen_at_last_ts.contains(&key))
        {
            return Err(Error::DuplicateEvent {
                mint: self.mint.clone(),
                timestamp: event.timestamp,
            });
        }
        if event.timestamp > self.last_event_ts {
            self.last_event_ts = event.timestamp;
            self.seen_at_last_ts.clear();
        }
        self.seen_at_last_ts.insert(key);
        Ok(())
    }

    pub fn state(&self) -> TokenState {
        self.machine.state()
    }

    pub fn state_machine(&self) -> &TokenStateMachine {
        &self.machine
    }

    pub fn transition_to(
        &mut self,
        to: TokenState,
        timestamp: i64,
        reason: impl Into<String>,
    ) -> Result<StateTransition> {
        self.machine.transition(to, timestamp, self.current_price, reason)
    }

    pub fn metrics(&self) -> &TokenMetrics {
        &self.metrics
    }

    pub fn holders(&self) -> &HolderBook {
        &self.holders
    }

    pub fn pump_metrics(&self) -> &PumpMetrics {
        &self.metrics.pump
    }

    pub fn holder_count(&self) -> u32 {
        self.holders.holder_count()
    }

    pub fn top_holder_concentration(&self, k: usize) -> f64 {
        self.holders.top_holder_concentration(k, self.total_supply)
    }

    pub fn creator_sell_percentage(&self) -> f64 {
        self.holders.creator_sell_percentage()
    }

    pub fn recent_volume(&self, window: VolumeWindow, now: i64) -> VolumeStats {
        self.metrics.volume.stats(window, now)
    }

    pub fn volume_in(&self, duration_ms: i64, now: i64) -> f64 {
        self.metrics.volume.volume_in(duration_ms, now)
    }

    pub fn price_velocity(&self) -> f64 {
        self.metrics.price_velocity()
    }

    pub fn volatility(&self) -> f64 {
        self.metrics.volatility
    }

    pub fn drawdown_percentage(&self) -> f64 {
        self.machine.drawdown_percentage(self.current_price)
    }

    pub fn market_cap_usd(&self, sol_usd: f64) -> f64 {
        self.market_cap_sol * sol_usd
    }

    pub fn age_secs(&self, now: i64) -> f64 {
        (now - self.created_at) as f64 / 1000.0
    }

    pub fn snapshot(&self, now: i64) -> TokenSnapshot {
        TokenSnapshot {
            mint: self.mint.clone(),
            symbol: self.symbol.clone(),
            state: self.state(),
            timestamp: now,
            age_secs: self.age_secs(now),
            price: self.current_price,
            market_cap_sol: self.market_cap_sol,
            v_sol: self.v_sol,
            holder_count: self.holder_count(),
            top3_concentration: self.top_holder_concentration(3),
            creator_sell_percentage: self.creator_sell_percentage(),
            volatility: self.volatility(),
            volume_5m: self.recent_volume(VolumeWindow::FiveMinutes, now),
            pump: self.metrics.pump.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Synthetic bonding-curve data shared by tests across modules

    use super::*;
    use crate::stream::event::TradeSide;

    pub const SUPPLY: f64 = 1_000_000_000.0;
    pub const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";
    pub const CREATOR: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    pub const T0: i64 = 1_700_000_000_000;

    /// Deterministic base58 address for trader `i`
    pub fn trader(i: usize) -> String {
        bs58::encode(format!("trader-{:04}", i)).into_string()
    }

    pub fn create(market_cap_sol: f64, initial_buy: f64) -> CreateEvent {
        let v_tokens = SUPPLY - initial_buy;
        CreateEvent {
            mint: MINT.to_string(),
            signature: Some("create-sig".to_string()),
            timestamp: T0,
            name: "Test Token".to_string(),
            symbol: "TEST".to_string(),
            creator: CREATOR.to_string(),
            initial_buy,
            market_cap_sol,
            v_tokens,
            v_sol: market_cap_sol * v_tokens / SUPPLY,
        }
    }

    /// Trade whose reserves are consistent with `market_cap_sol` and `v_tokens`
    #[allow(clippy::too_many_arguments)]
    pub fn trade(
        side: TradeSide,
        who: &str,
        timestamp: i64,
        market_cap_sol: f64,
        v_tokens: f64,
        token_amount: f64,
        new_balance: f64,
        sol_amount: Option<f64>,
    ) -> TradeEvent {
        TradeEvent {
            mint: MINT.to_string(),
            signature: Some(format!("sig-{}-{}-{}", who, timestamp, new_balance)),
            timestamp,
            side,
            trader: who.to_string(),
            token_amount,
            new_balance,
            sol_amount,
            market_cap_sol,
            v_tokens,
            v_sol: market_cap_sol * v_tokens / SUPPLY,
        }
    }

    /// Trades after `create(5.0, 100_000_000.0)`: 26 buyers run the market
    /// cap from 5 to 50 SOL, one sells into a dip to 40 and a bounce lifts it
    /// to 44. Ends with 27 holders (creator 10%, two 5% buyers), the last
    /// trade at `T0 + 45_000` and `v_tokens` at 560M.
    pub fn seasoned_trades() -> Vec<TradeEvent> {
        let mut trades = Vec::new();
        let mut v_tokens = SUPPLY - 100_000_000.0;
        for i in 1..=26usize {
            let amount = if i <= 2 { 50_000_000.0 } else { 10_000_000.0 };
            v_tokens -= amount;
            let mc = 5.0 + 45.0 * i as f64 / 26.0;
            let ts = T0 + 1_500 * i as i64;
            trades.push(trade(TradeSide::Buy, &trader(i), ts, mc, v_tokens, amount, amount, None));
        }
        v_tokens += 10_000_000.0;
        let dip =
            trade(TradeSide::Sell, &trader(26), T0 + 42_000, 40.0, v_tokens, 1.0e7, 0.0, None);
        trades.push(dip);
        v_tokens -= 10_000_000.0;
        let bounce =
            trade(TradeSide::Buy, &trader(27), T0 + 45_000, 44.0, v_tokens, 1.0e7, 1.0e7, None);
        trades.push(bounce);
        trades
    }

    /// Token after `seasoned_trades`, with thresholds that keep it in NEW
    pub fn seasoned_token() -> Token {
        let thresholds = ThresholdsConfig {
            heating_up_usd: 1.0e12,
            first_pump_usd: 1.0e12,
            dead_usd: 0.0,
            ..ThresholdsConfig::default()
        };
        let pump = PumpDetectionConfig::default();
        let ctx = TradeContext {
            thresholds: &thresholds,
            pump: &pump,
            sol_usd: 100.0,
        };
        let mut token = Token::from_create(&create(5.0, 100_000_000.0), &MetricsConfig::default())
            .expect("create");
        for event in seasoned_trades() {
            token.apply_trade(&event, &ctx).expect("seasoned trade");
        }
        token
    }
}
