//! Holder book: balances, concentration and creator activity

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::stream::event::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HolderTrade {
    pub timestamp: i64,
    /// Positive for buys, negative for sells
    pub signed_amount: f64,
    pub volume_sol: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderRecord {
    pub address: String,
    pub balance: f64,
    pub is_creator: bool,
    pub trades: Vec<HolderTrade>,
}

#[derive(Debug, Clone)]
pub struct HolderBook {
    holders: HashMap<String, HolderRecord>,
    creator: String,
    creator_initial_balance: f64,
    max_trades_per_holder: usize,
}

impl HolderBook {
    /// Seed the book with the creator's initial buy
    pub fn new(
        creator: &str,
        initial_buy: f64,
        timestamp: i64,
        max_trades_per_holder: usize,
    ) -> Self {
        let mut holders = HashMap::new();
        holders.insert(
            creator.to_string(),
            HolderRecord {
                address: creator.to_string(),
                balance: initial_buy.max(0.0),
                is_creator: true,
                trades: vec![HolderTrade {
                    timestamp,
                    signed_amount: initial_buy.max(0.0),
                    volume_sol: 0.0,
                }],
            },
        );
        Self {
            holders,
            creator: creator.to_string(),
            creator_initial_balance: initial_buy.max(0.0),
            max_trades_per_holder: max_trades_per_holder.max(1),
        }
    }

    /// Apply a trade; `new_balance` from the feed is authoritative
    pub fn record_trade(
        &mut self,
        trader: &str,
        side: TradeSide,
        token_amount: f64,
        new_balance: f64,
        volume_sol: f64,
        timestamp: i64,
    ) {
        let is_creator = trader == self.creator;
        let cap = self.max_trades_per_holder;
        let record = self
            .holders
            .entry(trader.to_string())
            .or_insert_with(|| HolderRecord {
                address: trader.to_string(),
                balance: 0.0,
                is_creator,
                trades: Vec::new(),
            });

        record.balance = new_balance.max(0.0);
        let signed_amount = match side {
            TradeSide::Buy => token_amount,
            TradeSide::Sell => -token_amount,
        };
        record.trades.push(HolderTrade {
            timestamp,
            signed_amount,
            volume_sol,
        });
        if record.trades.len() > cap {
            let excess = record.trades.len() - cap;
            record.trades.drain(..excess);
        }
    }

    pub fn get(&self, address: &str) -> Option<&HolderRecord> {
        self.holders.get(address)
    }

    /// Addresses with a positive balance
    pub fn holder_count(&self) -> u32 {
        self.holders.values().filter(|h| h.balance > 0.0).count() as u32
    }

    pub fn circulating_supply(&self) -> f64 {
        self.holders.values().map(|h| h.balance).sum()
    }

    /// Share of `total_supply` held by the `k` largest holders
    pub fn top_holder_concentration(&self, k: usize, total_supply: f64) -> f64 {
        if total_supply <= 0.0 {
            return 0.0;
        }
        let mut balances: Vec<f64> = self.holders.values().map(|h| h.balance).collect();
        balances.sort_by(|a, b| b.total_cmp(a));
        balances.iter().take(k).sum::<f64>() / total_supply
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn creator_balance(&self) -> f64 {
        self.holders.get(&self.creator).map(|h| h.balance).unwrap_or(0.0)
    }

    /// Fraction of the creator's initial holding that has been sold
    pub fn creator_sell_percentage(&self) -> f64 {
        if self.creator_initial_balance <= 0.0 {
            return 0.0;
        }
        (1.0 - self.creator_balance() / self.creator_initial_balance).clamp(0.0, 1.0)
    }

    /// SOL the creator received from sells at or after `since`
    pub fn creator_sell_volume_since(&self, since: i64) -> f64 {
        self.holders
            .get(&self.creator)
            .map(|h| {
                h.trades
                    .iter()
                    .filter(|t| t.timestamp >= since && t.signed_amount < 0.0)
                    .map(|t| t.volume_sol)
                    .sum()
            })
            .unwrap_or(0.0)
    }
}
