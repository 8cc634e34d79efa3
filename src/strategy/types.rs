//! Shared types for exit decisions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why (part of) a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    /// One-based tier number in ascending threshold order
    TakeProfit { tier: u8 },
    VolumeExit,
    TimeExit,
    /// The token went DEAD while the position was open
    TokenDead,
    Manual,
}

impl ExitReason {
    /// Stable code used in events and logs
    pub fn code(&self) -> String {
        match self {
            ExitReason::StopLoss => "STOP_LOSS".to_string(),
            ExitReason::TrailingStop => "TRAILING_STOP".to_string(),
            ExitReason::TakeProfit { tier } => format!("TAKE_PROFIT_{}", tier),
            ExitReason::VolumeExit => "VOLUME_EXIT".to_string(),
            ExitReason::TimeExit => "TIME_EXIT".to_string(),
            ExitReason::TokenDead => "TOKEN_DEAD".to_string(),
            ExitReason::Manual => "MANUAL".to_string(),
        }
    }

    pub fn is_take_profit(&self) -> bool {
        matches!(self, ExitReason::TakeProfit { .. })
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Exit engine output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    /// Fraction of the original position size, in (0, 1]
    pub portion: f64,
    pub reason: ExitReason,
}

impl ExitDecision {
    pub fn full(reason: ExitReason) -> Self {
        Self {
            portion: 1.0,
            reason,
        }
    }
}

/// Market snapshot handed to the exit engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketContext {
    pub price: f64,
    /// Stdev of log returns, as a fraction
    pub volatility: f64,
    /// SOL volume in the last measurement period
    pub volume_sol: f64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(ExitReason::TakeProfit { tier: 2 }.code(), "TAKE_PROFIT_2");
        assert_eq!(ExitReason::TrailingStop.to_string(), "TRAILING_STOP");
        assert!(!ExitReason::StopLoss.is_take_profit());
        assert_eq!(ExitReason::TokenDead.code(), "TOKEN_DEAD");
    }
}
