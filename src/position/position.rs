//! Simulated position and its P&L accounting
//!
//! A position goes PENDING -> OPEN -> CLOSED. Exits are expressed as
//! fractions of the original size; `remaining_size` only ever shrinks.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stream::event::TradeSide;
use crate::strategy::types::ExitReason;

/// Below this the position counts as fully exited
const REMAINING_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Pending,
    Open,
    Closed,
}

/// A simulated fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionTrade {
    pub side: TradeSide,
    pub timestamp: i64,
    pub quoted_price: f64,
    pub execution_price: f64,
    pub sol_amount: f64,
    pub slippage_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialExit {
    pub timestamp: i64,
    /// Effective fraction of the original size closed by this exit
    pub portion: f64,
    pub execution_price: f64,
    pub proceeds_sol: f64,
    pub realized_pnl_sol: f64,
    pub reason: ExitReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub mint: String,
    pub symbol: String,
    pub state: PositionState,
    pub entry_price: f64,
    pub entry_time: i64,
    /// SOL committed at entry
    pub size: f64,
    /// Fraction of `size` still held, in [0, 1]
    pub remaining_size: f64,
    pub current_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub realized_pnl_sol: f64,
    pub realized_pnl_usd: f64,
    pub unrealized_pnl_sol: f64,
    pub trades: Vec<PositionTrade>,
    pub partial_exits: Vec<PartialExit>,
    /// One-based take-profit tiers already consumed
    pub triggered_tiers: Vec<u8>,
    /// Highest measurement-period volume seen while open
    pub peak_volume_sol: f64,
    pub last_update: i64,
    pub close_reason: Option<ExitReason>,
    pub closed_at: Option<i64>,
}

impl Position {
    /// A position awaiting its simulated entry fill
    pub fn pending(mint: &str, symbol: &str, size: f64, quoted_price: f64, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mint: mint.to_string(),
            symbol: symbol.to_string(),
            state: PositionState::Pending,
            entry_price: quoted_price,
            entry_time: timestamp,
            size,
            remaining_size: 1.0,
            current_price: quoted_price,
            highest_price: quoted_price,
            lowest_price: quoted_price,
            realized_pnl_sol: 0.0,
            realized_pnl_usd: 0.0,
            unrealized_pnl_sol: 0.0,
            trades: Vec::new(),
            partial_exits: Vec::new(),
            triggered_tiers: Vec::new(),
            peak_volume_sol: 0.0,
            last_update: timestamp,
            close_reason: None,
            closed_at: None,
        }
    }

    /// PENDING -> OPEN at the simulated execution price
    pub fn open(&mut self, execution_price: f64, slippage_pct: f64, timestamp: i64) -> Result<()> {
        if self.state != PositionState::Pending {
            return Err(Error::IllegalPositionState(format!(
                "cannot open position {} in state {:?}",
                self.id, self.state
            )));
        }
        if !(execution_price.is_finite() && execution_price > 0.0) {
            return Err(Error::IllegalPositionState(format!(
                "invalid execution price {}",
                execution_price
            )));
        }

        self.trades.push(PositionTrade {
            side: TradeSide::Buy,
            timestamp,
            quoted_price: self.entry_price,
            execution_price,
            sol_amount: self.size,
            slippage_pct,
        });
        self.state = PositionState::Open;
        self.entry_price = execution_price;
        self.entry_time = timestamp;
        self.current_price = execution_price;
        self.highest_price = execution_price;
        self.lowest_price = execution_price;
        self.last_update = timestamp;
        self.unrealized_pnl_sol = 0.0;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == PositionState::Closed
    }

    /// ROI of the held portion at the current price, in percent
    pub fn roi_pct(&self) -> f64 {
        self.roi_at(self.current_price)
    }

    pub fn roi_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }

    /// ROI at the highest price seen since entry
    pub fn peak_roi_pct(&self) -> f64 {
        self.roi_at(self.highest_price)
    }

    /// Percent below the highest price seen since entry
    pub fn drawdown_from_peak_pct(&self) -> f64 {
        if self.highest_price <= 0.0 {
            return 0.0;
        }
        (self.highest_price - self.current_price) / self.highest_price * 100.0
    }

    pub fn hold_time_ms(&self, now: i64) -> i64 {
        (now - self.entry_time).max(0)
    }

    /// SOL value of the held portion at the current price
    pub fn current_value_sol(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.remaining_size * self.size * self.current_price / self.entry_price
    }

    pub fn tier_triggered(&self, tier: u8) -> bool {
        self.triggered_tiers.contains(&tier)
    }

    /// Sum of all effective exit portions
    pub fn exited_portion(&self) -> f64 {
        self.partial_exits.iter().map(|e| e.portion).sum()
    }

    pub fn update_price(&mut self, price: f64, timestamp: i64) -> Result<()> {
        if !self.is_open() {
            return Err(Error::IllegalPositionState(format!(
                "price update on position {} in state {:?}",
                self.id, self.state
            )));
        }
        if !(price.is_finite() && price > 0.0) {
            return Ok(());
        }
        self.current_price = price;
        self.highest_price = self.highest_price.max(price);
        self.lowest_price = self.lowest_price.min(price);
        self.last_update = timestamp;
        self.unrealized_pnl_sol =
            self.remaining_size * self.size * (price / self.entry_price - 1.0);
        Ok(())
    }

    pub fn observe_volume(&mut self, volume_sol: f64) {
        if volume_sol.is_finite() && volume_sol > self.peak_volume_sol {
            self.peak_volume_sol = volume_sol;
        }
    }

    /// Close `portion` of the original size at `execution_price`.
    /// Returns the recorded exit; the proceeds go to the wallet.
    pub fn apply_exit(
        &mut self,
        portion: f64,
        execution_price: f64,
        reason: ExitReason,
        timestamp: i64,
        sol_usd: f64,
    ) -> Result<PartialExit> {
        if !self.is_open() {
            return Err(Error::IllegalPositionState(format!(
                "exit on position {} in state {:?}",
                self.id, self.state
            )));
        }
        if !(portion.is_finite() && portion > 0.0) {
            return Err(Error::IllegalPositionState(format!("invalid exit portion {}", portion)));
        }

        let effective = portion.min(self.remaining_size);
        let ratio = execution_price / self.entry_price;
        let proceeds_sol = effective * self.size * ratio;
        let realized_pnl_sol = effective * self.size * (ratio - 1.0);

        self.remaining_size -= effective;
        if self.remaining_size <= REMAINING_EPSILON {
            self.remaining_size = 0.0;
        }
        self.realized_pnl_sol += realized_pnl_sol;
        self.realized_pnl_usd += realized_pnl_sol * sol_usd;
        self.unrealized_pnl_sol =
            self.remaining_size * self.size * (self.current_price / self.entry_price - 1.0);
        self.last_update = timestamp;

        if let ExitReason::TakeProfit { tier } = reason {
            if !self.triggered_tiers.contains(&tier) {
                self.triggered_tiers.push(tier);
            }
        }

        self.trades.push(PositionTrade {
            side: TradeSide::Sell,
            timestamp,
            quoted_price: self.current_price,
            execution_price,
            sol_amount: proceeds_sol,
            slippage_pct: (execution_price / self.current_price - 1.0) * 100.0,
        });

        let exit = PartialExit {
            timestamp,
            portion: effective,
            execution_price,
            proceeds_sol,
            realized_pnl_sol,
            reason,
        };
        self.partial_exits.push(exit.clone());

        if self.remaining_size == 0.0 {
            self.state = PositionState::Closed;
            self.close_reason = Some(reason);
            self.closed_at = Some(timestamp);
            self.unrealized_pnl_sol = 0.0;
        }

        debug!(
            mint = %self.mint,
            reason = %reason,
            portion = effective,
            remaining = self.remaining_size,
            pnl_sol = realized_pnl_sol,
            "Applied exit"
        );
        Ok(exit)
    }
}
