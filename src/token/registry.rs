//! Live tokens keyed by mint

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::token::token::Token;

pub type SharedToken = Arc<Mutex<Token>>;

/// Owns every tracked token. Each token sits behind its own async mutex so
/// that its worker can hold it across simulated transaction delays; shared
/// housekeeping only ever `try_lock`s it.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: DashMap<String, SharedToken>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new token; returns false if the mint is already tracked
    pub fn insert(&self, token: Token) -> bool {
        let mint = token.mint.clone();
        match self.tokens.entry(mint) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(token)));
                true
            }
        }
    }

    pub fn get(&self, mint: &str) -> Option<SharedToken> {
        self.tokens.get(mint).map(|t| Arc::clone(t.value()))
    }

    pub fn contains(&self, mint: &str) -> bool {
        self.tokens.contains_key(mint)
    }

    pub fn remove(&self, mint: &str) -> Option<SharedToken> {
        self.tokens.remove(mint).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn mints(&self) -> Vec<String> {
        self.tokens.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove terminal tokens with no activity for `quiet_ms`. A token whose
    /// worker holds its lock is busy, hence not quiet, and is left for the
    /// next sweep.
    pub fn sweep(&self, now: i64, quiet_ms: i64) -> Vec<String> {
        let candidates: Vec<(String, SharedToken)> = self
            .tokens
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut removed = Vec::new();
        for (mint, token) in candidates {
            let expired = match token.try_lock() {
                Ok(token) => token.state().is_terminal() && now - token.last_activity >= quiet_ms,
                Err(_) => false,
            };
            if expired {
                self.tokens.remove(&mint);
                debug!(mint = %mint, "Swept terminal token");
                removed.push(mint);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::token::state::TokenState;
    use crate::token::token::test_support::*;

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let registry = TokenRegistry::new();
        let token = Token::from_create(&create(5.0, 0.0), &MetricsConfig::default()).unwrap();
        assert!(registry.insert(token.clone()));
        assert!(!registry.insert(token));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(MINT));
    }

    #[tokio::test]
    async fn test_sweep_removes_quiet_terminal_tokens() {
        let registry = TokenRegistry::new();
        let token = Token::from_create(&create(5.0, 0.0), &MetricsConfig::default()).unwrap();
        registry.insert(token);

        // live tokens are never swept
        assert!(registry.sweep(T0 + 10_000_000, 1_000).is_empty());

        {
            let shared = registry.get(MINT).unwrap();
            let mut token = shared.lock().await;
            token.transition_to(TokenState::Dead, T0, "test").unwrap();
        }

        assert!(registry.sweep(T0 + 500, 1_000).is_empty());
        {
            // busy tokens are skipped, not waited on
            let shared = registry.get(MINT).unwrap();
            let _held = shared.lock().await;
            assert!(registry.sweep(T0 + 1_000, 1_000).is_empty());
        }
        let removed = registry.sweep(T0 + 1_000, 1_000);
        assert_eq!(removed, vec![MINT.to_string()]);
        assert!(registry.is_empty());
    }
}
