//! Token lifecycle automaton
//!
//! ```text
//! NEW -> HEATING_UP -> FIRST_PUMP -> DRAWDOWN <-> RECOVERY -> IN_POSITION -> CLOSED
//!   \_____________________ any non-terminal ______________________/ -> DEAD
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ThresholdsConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    New,
    HeatingUp,
    FirstPump,
    Drawdown,
    Recovery,
    InPosition,
    Closed,
    Dead,
}

impl TokenState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Closed | TokenState::Dead)
    }

    /// Legal edges of the lifecycle
    pub fn can_transition_to(&self, to: TokenState) -> bool {
        use TokenState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (New, HeatingUp)
                | (HeatingUp, FirstPump)
                | (FirstPump, Drawdown)
                | (Drawdown, Recovery)
                | (Recovery, InPosition)
                | (Recovery, Drawdown)
                | (InPosition, Closed)
                | (_, Dead)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::New => "NEW",
            TokenState::HeatingUp => "HEATING_UP",
            TokenState::FirstPump => "FIRST_PUMP",
            TokenState::Drawdown => "DRAWDOWN",
            TokenState::Recovery => "RECOVERY",
            TokenState::InPosition => "IN_POSITION",
            TokenState::Closed => "CLOSED",
            TokenState::Dead => "DEAD",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TokenState,
    pub to: TokenState,
    pub timestamp: i64,
    pub reason: String,
}

/// Market observation fed to the automaton after each trade
#[derive(Debug, Clone, Copy)]
pub struct StateInputs {
    pub price: f64,
    pub market_cap_usd: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct TokenStateMachine {
    mint: String,
    state: TokenState,
    entered_at: i64,
    /// Highest / lowest price since entering the current state
    local_peak: f64,
    local_trough: f64,
    dead_streak: u32,
    history: Vec<StateTransition>,
}

impl TokenStateMachine {
    pub fn new(mint: &str, price: f64, timestamp: i64) -> Self {
        Self::starting_in(mint, TokenState::New, price, timestamp)
    }

    /// Machine resumed directly in `state`, e.g. after a restart with an open position
    pub fn starting_in(mint: &str, state: TokenState, price: f64, timestamp: i64) -> Self {
        Self {
            mint: mint.to_string(),
            state,
            entered_at: timestamp,
            local_peak: price,
            local_trough: price,
            dead_streak: 0,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn entered_at(&self) -> i64 {
        self.entered_at
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn local_peak(&self) -> f64 {
        self.local_peak
    }

    /// Drop from the highest price seen since the current state was entered
    pub fn drawdown_percentage(&self, price: f64) -> f64 {
        if self.local_peak <= 0.0 {
            return 0.0;
        }
        ((1.0 - price / self.local_peak) * 100.0).max(0.0)
    }

    fn recovery_percentage(&self, price: f64) -> f64 {
        if self.local_trough <= 0.0 {
            return 0.0;
        }
        ((price / self.local_trough - 1.0) * 100.0).max(0.0)
    }

    /// Apply a transition if the table allows it
    pub fn transition(
        &mut self,
        to: TokenState,
        timestamp: i64,
        price: f64,
        reason: impl Into<String>,
    ) -> Result<StateTransition> {
        if !self.state.can_transition_to(to) {
            return Err(Error::IllegalTokenTransition {
                mint: self.mint.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let transition = StateTransition {
            from: self.state,
            to,
            timestamp,
            reason: reason.into(),
        };
        self.state = to;
        self.entered_at = timestamp;
        self.local_peak = price;
        self.local_trough = price;
        self.dead_streak = 0;
        self.history.push(transition.clone());
        Ok(transition)
    }

    /// Evaluate threshold-driven edges after a trade. A large move may pass
    /// through several states at once.
    pub fn evaluate(
        &mut self,
        inputs: &StateInputs,
        thresholds: &ThresholdsConfig,
    ) -> Vec<StateTransition> {
        let mut transitions = Vec::new();
        if self.state.is_terminal() {
            return transitions;
        }

        self.local_peak = self.local_peak.max(inputs.price);
        self.local_trough = self.local_trough.min(inputs.price);

        // an open position is liquidated by the engine when this fires
        if inputs.market_cap_usd <= thresholds.dead_usd {
            self.dead_streak += 1;
        } else {
            self.dead_streak = 0;
        }
        if self.dead_streak >= thresholds.dead_samples {
            let reason = format!(
                "market cap ${:.0} <= ${:.0} for {} samples",
                inputs.market_cap_usd, thresholds.dead_usd, self.dead_streak
            );
            if let Ok(t) =
                self.transition(TokenState::Dead, inputs.timestamp, inputs.price, reason)
            {
                transitions.push(t);
            }
            return transitions;
        }

        let mc_usd = inputs.market_cap_usd;
        // Bounded: each pass moves strictly forward or stops
        for _ in 0..4 {
            let next = match self.state {
                TokenState::New if mc_usd >= thresholds.heating_up_usd => Some((
                    TokenState::HeatingUp,
                    format!("market cap ${:.0} reached heating-up threshold", mc_usd),
                )),
                TokenState::HeatingUp if mc_usd >= thresholds.first_pump_usd => Some((
                    TokenState::FirstPump,
                    format!("market cap ${:.0} reached first-pump threshold", mc_usd),
                )),
                TokenState::FirstPump | TokenState::Recovery => {
                    let drawdown = self.drawdown_percentage(inputs.price);
                    (drawdown >= thresholds.pump_drawdown_pct).then(|| {
                        (
                            TokenState::Drawdown,
                            format!("dropped {:.1}% from local peak", drawdown),
                        )
                    })
                }
                TokenState::Drawdown => {
                    let recovery = self.recovery_percentage(inputs.price);
                    (recovery >= thresholds.recovery_pct).then(|| {
                        (
                            TokenState::Recovery,
                            format!("recovered {:.1}% from local trough", recovery),
                        )
                    })
                }
                _ => None,
            };

            match next {
                Some((to, reason)) => {
                    match self.transition(to, inputs.timestamp, inputs.price, reason) {
                        Ok(t) => transitions.push(t),
                        Err(_) => break,
                    }
                    // a drawdown or recovery needs fresh price movement
                    if matches!(to, TokenState::Drawdown | TokenState::Recovery) {
                        break;
                    }
                }
                None => break,
            }
        }

        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ThresholdsConfig {
        ThresholdsConfig {
            heating_up_usd: 1_000.0,
            first_pump_usd: 3_000.0,
            pump_drawdown_pct: 15.0,
            recovery_pct: 8.0,
            dead_usd: 100.0,
            dead_samples: 3,
        }
    }

    fn inputs(price: f64, market_cap_usd: f64, timestamp: i64) -> StateInputs {
        StateInputs {
            price,
            market_cap_usd,
            timestamp,
        }
    }

    #[test]
    fn test_transition_table() {
        use TokenState::*;
        let all = [New, HeatingUp, FirstPump, Drawdown, Recovery, InPosition, Closed, Dead];
        let legal = [
            (New, HeatingUp),
            (HeatingUp, FirstPump),
            (FirstPump, Drawdown),
            (Drawdown, Recovery),
            (Recovery, InPosition),
            (Recovery, Drawdown),
            (InPosition, Closed),
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to)) || (!from.is_terminal() && to == Dead);
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_illegal_transition_is_not_applied() {
        let mut machine = TokenStateMachine::new("mint", 1.0, 0);
        let err = machine.transition(TokenState::InPosition, 1, 1.0, "skip ahead");
        assert!(matches!(err, Err(Error::IllegalTokenTransition { .. })));
        assert_eq!(machine.state(), TokenState::New);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_full_cycle_to_recovery() {
        let t = thresholds();
        let mut m = TokenStateMachine::new("mint", 1.0, 0);

        assert!(m.evaluate(&inputs(1.5, 900.0, 1), &t).is_empty());
        let moved = m.evaluate(&inputs(2.0, 1_200.0, 2), &t);
        assert_eq!(moved[0].to, TokenState::HeatingUp);

        m.evaluate(&inputs(5.0, 3_500.0, 3), &t);
        assert_eq!(m.state(), TokenState::FirstPump);

        m.evaluate(&inputs(6.0, 4_200.0, 4), &t);
        // 6.0 -> 5.0 is a 16.7% drawdown
        m.evaluate(&inputs(5.0, 3_500.0, 5), &t);
        assert_eq!(m.state(), TokenState::Drawdown);

        m.evaluate(&inputs(4.8, 3_360.0, 6), &t);
        // 4.8 -> 5.3 is +10.4%
        m.evaluate(&inputs(5.3, 3_710.0, 7), &t);
        assert_eq!(m.state(), TokenState::Recovery);

        // falls back from the recovery peak
        m.evaluate(&inputs(4.4, 3_080.0, 8), &t);
        assert_eq!(m.state(), TokenState::Drawdown);
        assert_eq!(m.history().len(), 5);
    }

    #[test]
    fn test_jump_through_two_states() {
        let mut m = TokenStateMachine::new("mint", 1.0, 0);
        let moved = m.evaluate(&inputs(10.0, 5_000.0, 1), &thresholds());
        assert_eq!(moved.len(), 2);
        assert_eq!(m.state(), TokenState::FirstPump);
    }

    #[test]
    fn test_dead_after_consecutive_samples() {
        let t = thresholds();
        let mut m = TokenStateMachine::new("mint", 1.0, 0);
        m.evaluate(&inputs(0.1, 50.0, 1), &t);
        m.evaluate(&inputs(0.1, 50.0, 2), &t);
        // streak broken
        m.evaluate(&inputs(0.5, 500.0, 3), &t);
        m.evaluate(&inputs(0.1, 50.0, 4), &t);
        m.evaluate(&inputs(0.1, 50.0, 5), &t);
        assert_eq!(m.state(), TokenState::New);
        let moved = m.evaluate(&inputs(0.1, 50.0, 6), &t);
        assert_eq!(moved[0].to, TokenState::Dead);
        assert!(m.evaluate(&inputs(9.0, 9_000.0, 7), &t).is_empty());
    }

    #[test]
    fn test_in_position_only_leaves_by_close_or_death() {
        let t = thresholds();
        let mut m = TokenStateMachine::starting_in("mint", TokenState::InPosition, 1.0, 0);
        // price swings do not move an open position's token
        assert!(m.evaluate(&inputs(0.5, 2_000.0, 1), &t).is_empty());
        assert!(m.evaluate(&inputs(9.0, 9_000.0, 2), &t).is_empty());
        assert_eq!(m.state(), TokenState::InPosition);

        m.evaluate(&inputs(0.01, 10.0, 3), &t);
        m.evaluate(&inputs(0.01, 10.0, 4), &t);
        let moved = m.evaluate(&inputs(0.01, 10.0, 5), &t);
        assert_eq!(moved.len(), 1);
        assert_eq!((moved[0].from, moved[0].to), (TokenState::InPosition, TokenState::Dead));
        assert!(m.transition(TokenState::Closed, 6, 0.01, "position closed").is_err());

        let mut m = TokenStateMachine::starting_in("mint", TokenState::InPosition, 1.0, 0);
        assert!(m.transition(TokenState::Closed, 1, 1.0, "position closed").is_ok());
    }
}
