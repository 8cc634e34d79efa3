//! Simulated SOL wallet
//!
//! The only state shared across tokens. Mutated by the position manager
//! alone, read by stats and snapshots.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{BotEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub balance_sol: f64,
    pub initial_balance_sol: f64,
}

impl WalletState {
    pub fn pnl_sol(&self) -> f64 {
        self.balance_sol - self.initial_balance_sol
    }
}

pub struct Wallet {
    state: Mutex<WalletState>,
    events: EventBus,
}

impl Wallet {
    pub fn new(initial_balance_sol: f64, events: EventBus) -> Self {
        Self {
            state: Mutex::new(WalletState {
                balance_sol: initial_balance_sol,
                initial_balance_sol,
            }),
            events,
        }
    }

    pub async fn balance(&self) -> f64 {
        self.state.lock().await.balance_sol
    }

    pub async fn state(&self) -> WalletState {
        *self.state.lock().await
    }

    /// Take `amount` SOL out; fails without side effects if the balance is short
    pub async fn debit(&self, amount: f64) -> Result<f64> {
        let mut state = self.state.lock().await;
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(Error::Internal(format!("invalid debit amount {}", amount)));
        }
        if state.balance_sol < amount {
            return Err(Error::InsufficientBalance {
                available: state.balance_sol,
                required: amount,
            });
        }
        state.balance_sol -= amount;
        debug!(amount, balance = state.balance_sol, "Wallet debited");
        self.events.publish(BotEvent::BalanceUpdated {
            balance_sol: state.balance_sol,
            change_sol: -amount,
        });
        Ok(state.balance_sol)
    }

    pub async fn credit(&self, amount: f64) -> Result<f64> {
        let mut state = self.state.lock().await;
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(Error::Internal(format!("invalid credit amount {}", amount)));
        }
        state.balance_sol += amount;
        debug!(amount, balance = state.balance_sol, "Wallet credited");
        self.events.publish(BotEvent::BalanceUpdated {
            balance_sol: state.balance_sol,
            change_sol: amount,
        });
        Ok(state.balance_sol)
    }

    /// Replace the balance with a persisted one at startup
    pub async fn restore(&self, restored: WalletState) {
        let mut state = self.state.lock().await;
        *state = restored;
        info!(balance = restored.balance_sol, "Restored wallet balance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_debit_and_credit() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let wallet = Wallet::new(1.0, bus);

        assert_eq!(wallet.debit(0.4).await.unwrap(), 0.6);
        assert!(matches!(
            rx.recv().await.unwrap(),
            BotEvent::BalanceUpdated { change_sol, .. } if change_sol == -0.4
        ));

        assert_ok!(wallet.credit(0.5).await);
        assert!((wallet.balance().await - 1.1).abs() < 1e-12);
        assert!((wallet.state().await.pnl_sol() - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_wallet_untouched() {
        let wallet = Wallet::new(0.3, EventBus::new(8));
        let err = assert_err!(wallet.debit(0.5).await);
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(wallet.balance().await, 0.3);
    }

    #[tokio::test]
    async fn test_restore() {
        let wallet = Wallet::new(10.0, EventBus::new(8));
        wallet
            .restore(WalletState {
                balance_sol: 8.5,
                initial_balance_sol: 10.0,
            })
            .await;
        assert_eq!(wallet.balance().await, 8.5);
    }
}
