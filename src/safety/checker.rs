//! Three-phase admission check for tokens in RECOVERY
//!
//! Phase A screens minimum requirements, phase B looks for rug signals and
//! phase C requires at least one healthy pump pattern. The first failing phase
//! stops the evaluation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SafetyConfig;
use crate::error::{Error, Result};
use crate::token::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckPhase {
    MinimumRequirements,
    RugSignals,
    PumpDynamics,
    Internal,
}

/// Direction in which the actual value must sit relative to the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    AtLeast,
    AtMost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCheck {
    pub name: String,
    pub phase: CheckPhase,
    pub reason: String,
    pub actual_value: f64,
    pub threshold_value: f64,
    pub threshold_path: String,
    pub comparison: Comparison,
}

impl FailedCheck {
    fn new(
        name: &str,
        phase: CheckPhase,
        reason: impl Into<String>,
        actual_value: f64,
        threshold_value: f64,
        threshold_path: &str,
        comparison: Comparison,
    ) -> Self {
        Self {
            name: name.to_string(),
            phase,
            reason: reason.into(),
            actual_value,
            threshold_value,
            threshold_path: threshold_path.to_string(),
            comparison,
        }
    }

    /// Failure recorded when the checker itself errors
    pub fn internal(detail: &str) -> Self {
        Self::new(
            "INTERNAL",
            CheckPhase::Internal,
            format!("internal: {}", detail),
            0.0,
            0.0,
            "",
            Comparison::AtLeast,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyOutcome {
    Approved,
    Rejected(Vec<FailedCheck>),
}

impl SafetyOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, SafetyOutcome::Approved)
    }
}

pub struct SafetyChecker<'a> {
    config: &'a SafetyConfig,
}

impl<'a> SafetyChecker<'a> {
    pub fn new(config: &'a SafetyConfig) -> Self {
        Self { config }
    }

    /// Retry policy: after a failure, wait out the cooldown and skip tokens
    /// that already ran away.
    pub fn should_evaluate(&self, token: &Token, now: i64) -> bool {
        let Some(mark) = token.last_safety_failure else {
            return true;
        };
        if now - mark.timestamp < self.config.retry_cooldown_ms {
            return false;
        }
        if mark.price <= 0.0 {
            return true;
        }
        let gain_pct = (token.current_price / mark.price - 1.0) * 100.0;
        gain_pct <= self.config.retry_max_gain_pct
    }

    pub fn check(&self, token: &Token, now: i64, sol_usd: f64) -> Result<SafetyOutcome> {
        if !self.config.enabled {
            return Ok(SafetyOutcome::Approved);
        }

        for (name, value) in [
            ("price", token.current_price),
            ("vSol", token.v_sol),
            ("volatility", token.volatility()),
            ("acceleration", token.pump_metrics().price_acceleration),
            ("sol_usd", sol_usd),
        ] {
            if !value.is_finite() {
                return Err(Error::SafetyCheck(format!(
                    "{} for {} is not finite",
                    name, token.mint
                )));
            }
        }

        if let Some(failed) = self.minimum_requirements(token, now) {
            debug!(mint = %token.mint, check = %failed.name, "Phase A failed");
            return Ok(SafetyOutcome::Rejected(vec![failed]));
        }
        if let Some(failed) = self.rug_signals(token, now) {
            debug!(mint = %token.mint, check = %failed.name, "Phase B failed");
            return Ok(SafetyOutcome::Rejected(vec![failed]));
        }
        let failures = self.pump_dynamics(token, now, sol_usd);
        if failures.is_empty() {
            Ok(SafetyOutcome::Approved)
        } else {
            debug!(mint = %token.mint, branches = failures.len(), "Phase C failed");
            Ok(SafetyOutcome::Rejected(failures))
        }
    }

    fn minimum_requirements(&self, token: &Token, now: i64) -> Option<FailedCheck> {
        let phase = CheckPhase::MinimumRequirements;
        let cfg = self.config;

        let age = token.age_secs(now);
        let min_age = cfg.min_token_age_seconds as f64;
        if age < min_age {
            return Some(FailedCheck::new(
                "MIN_TOKEN_AGE",
                phase,
                format!("Token age {:.1}s below {}s", age, min_age),
                age,
                min_age,
                "safety.min_token_age_seconds",
                Comparison::AtLeast,
            ));
        }

        if token.v_sol < cfg.min_liquidity_sol {
            return Some(FailedCheck::new(
                "MIN_LIQUIDITY",
                phase,
                format!("Liquidity {:.2} SOL below {} SOL", token.v_sol, cfg.min_liquidity_sol),
                token.v_sol,
                cfg.min_liquidity_sol,
                "safety.min_liquidity_sol",
                Comparison::AtLeast,
            ));
        }

        let holders = token.holder_count();
        if holders < cfg.min_holders {
            return Some(FailedCheck::new(
                "MIN_HOLDERS",
                phase,
                format!("{} holders below minimum {}", holders, cfg.min_holders),
                holders as f64,
                cfg.min_holders as f64,
                "safety.min_holders",
                Comparison::AtLeast,
            ));
        }

        None
    }

    fn rug_signals(&self, token: &Token, now: i64) -> Option<FailedCheck> {
        let phase = CheckPhase::RugSignals;
        let cfg = self.config;
        let pump = token.pump_metrics();

        if let (Some(pump_time), Some(pump_price)) = (pump.last_pump_time, pump.last_pump_price) {
            if pump.pump_count > 0
                && now - pump_time < cfg.post_pump_window_ms
                && pump_price > 0.0
            {
                let change = (token.current_price - pump_price) / pump_price * 100.0;
                if change <= -cfg.max_post_pump_drop_pct {
                    return Some(FailedCheck::new(
                        "POST_PUMP_DUMP",
                        phase,
                        format!("Price dump after pump ({:.1}%)", change),
                        -change,
                        cfg.max_post_pump_drop_pct,
                        "safety.max_post_pump_drop_pct",
                        Comparison::AtMost,
                    ));
                }
            }
        }

        if token.v_sol > 0.0 {
            let sold = token
                .holders()
                .creator_sell_volume_since(now - cfg.creator_sell_window_ms);
            let pct = sold / token.v_sol * 100.0;
            if pct > cfg.max_creator_sell_liquidity_pct {
                return Some(FailedCheck::new(
                    "CREATOR_SELLING",
                    phase,
                    "Suspicious creator selling",
                    pct,
                    cfg.max_creator_sell_liquidity_pct,
                    "safety.max_creator_sell_liquidity_pct",
                    Comparison::AtMost,
                ));
            }
        }

        let concentration = token.top_holder_concentration(3);
        if concentration > cfg.max_top_holder_concentration {
            return Some(FailedCheck::new(
                "TOP_HOLDER_CONCENTRATION",
                phase,
                format!("Top 3 holders own {:.1}% of supply", concentration * 100.0),
                concentration,
                cfg.max_top_holder_concentration,
                "safety.max_top_holder_concentration",
                Comparison::AtMost,
            ));
        }

        None
    }

    /// Empty when at least one branch holds; otherwise one failure per branch
    fn pump_dynamics(&self, token: &Token, now: i64, sol_usd: f64) -> Vec<FailedCheck> {
        let phase = CheckPhase::PumpDynamics;
        let cfg = &self.config.pump_detection;
        let pump = token.pump_metrics();
        let mut failures = Vec::with_capacity(4);

        // Branch 1: accelerating price backed by a correlated volume spike
        let branch = (|| {
            if pump.price_acceleration <= cfg.min_price_acceleration {
                return Some(FailedCheck::new(
                    "PRICE_ACCELERATION",
                    phase,
                    "Price is not accelerating",
                    pump.price_acceleration,
                    cfg.min_price_acceleration,
                    "safety.pump_detection.min_price_acceleration",
                    Comparison::AtLeast,
                ));
            }
            let spike = pump.latest_spike();
            let increase = spike.map(|s| s.volume_increase).unwrap_or(0.0);
            if increase <= cfg.min_volume_spike {
                return Some(FailedCheck::new(
                    "VOLUME_SPIKE",
                    phase,
                    "No qualifying volume spike",
                    increase,
                    cfg.min_volume_spike,
                    "safety.pump_detection.min_volume_spike",
                    Comparison::AtLeast,
                ));
            }
            let correlation = spike
                .map(|s| s.price_change / s.volume_increase)
                .unwrap_or(0.0);
            if correlation <= cfg.min_price_volume_correlation {
                return Some(FailedCheck::new(
                    "PRICE_VOLUME_CORRELATION",
                    phase,
                    "Price change not backed by volume",
                    correlation,
                    cfg.min_price_volume_correlation,
                    "safety.pump_detection.min_price_volume_correlation",
                    Comparison::AtLeast,
                ));
            }
            None
        })();
        match branch {
            None => return Vec::new(),
            Some(f) => failures.push(f),
        }

        // Branch 2: steady gains at low volatility
        let volatility = token.volatility();
        if pump.highest_gain_rate <= cfg.min_gain_rate {
            failures.push(FailedCheck::new(
                "GAIN_RATE",
                phase,
                format!("Gain rate {:.2}%/s too low", pump.highest_gain_rate),
                pump.highest_gain_rate,
                cfg.min_gain_rate,
                "safety.pump_detection.min_gain_rate",
                Comparison::AtLeast,
            ));
        } else if volatility >= cfg.max_price_volatility {
            failures.push(FailedCheck::new(
                "PRICE_VOLATILITY",
                phase,
                format!("Volatility {:.3} too high", volatility),
                volatility,
                cfg.max_price_volatility,
                "safety.pump_detection.max_price_volatility",
                Comparison::AtMost,
            ));
        } else {
            return Vec::new();
        }

        // Branch 3: large token still growing its market cap
        let mc_usd = token.market_cap_usd(sol_usd);
        if mc_usd <= cfg.large_token_mc_usd {
            failures.push(FailedCheck::new(
                "LARGE_TOKEN",
                phase,
                format!("Market cap ${:.0} not a large token", mc_usd),
                mc_usd,
                cfg.large_token_mc_usd,
                "safety.pump_detection.large_token_mc_usd",
                Comparison::AtLeast,
            ));
        } else if pump.market_cap_gain_rate <= cfg.min_mc_gain_rate {
            failures.push(FailedCheck::new(
                "MARKET_CAP_GAIN_RATE",
                phase,
                format!("Market cap gain rate {:.2}%/s too low", pump.market_cap_gain_rate),
                pump.market_cap_gain_rate,
                cfg.min_mc_gain_rate,
                "safety.pump_detection.min_mc_gain_rate",
                Comparison::AtLeast,
            ));
        } else {
            return Vec::new();
        }

        // Branch 4: repeated pumps inside the window
        let pumps = pump.pumps_since(now - cfg.pump_window_ms);
        if pumps < cfg.min_pump_count {
            failures.push(FailedCheck::new(
                "PUMP_COUNT",
                phase,
                format!("{} pumps in window, need {}", pumps, cfg.min_pump_count),
                pumps as f64,
                cfg.min_pump_count as f64,
                "safety.pump_detection.min_pump_count",
                Comparison::AtLeast,
            ));
        } else {
            return Vec::new();
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricsConfig, PumpDetectionConfig, ThresholdsConfig};
    use crate::stream::event::TradeSide;
    use crate::token::token::test_support::*;
    use crate::token::token::{SafetyFailureMark, TradeContext};

    const NOW: i64 = T0 + 45_000;

    fn config() -> SafetyConfig {
        SafetyConfig {
            min_token_age_seconds: 30,
            min_liquidity_sol: 10.0,
            min_holders: 25,
            max_top_holder_concentration: 0.25,
            pump_detection: PumpDetectionConfig {
                min_gain_rate: 1.0,
                max_price_volatility: 0.5,
                ..PumpDetectionConfig::default()
            },
            ..SafetyConfig::default()
        }
    }

    fn apply(token: &mut Token, event: crate::stream::event::TradeEvent) {
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
        token.apply_trade(&event, &ctx).unwrap();
    }

    fn rejected(outcome: SafetyOutcome) -> Vec<FailedCheck> {
        match outcome {
            SafetyOutcome::Rejected(checks) => checks,
            SafetyOutcome::Approved => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_seasoned_token_is_approved() {
        let token = seasoned_token();
        let cfg = config();
        let outcome = SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap();
        assert_eq!(outcome, SafetyOutcome::Approved);
    }

    #[test]
    fn test_min_holders_boundary() {
        let token = seasoned_token();
        assert_eq!(token.holder_count(), 27);

        let mut cfg = config();
        cfg.min_holders = 27;
        assert!(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap().is_approved());

        cfg.min_holders = 28;
        let checks = rejected(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap());
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "MIN_HOLDERS");
        assert_eq!(checks[0].phase, CheckPhase::MinimumRequirements);
        assert_eq!(checks[0].actual_value, 27.0);
        assert_eq!(checks[0].threshold_path, "safety.min_holders");
    }

    #[test]
    fn test_min_token_age_boundary() {
        let token = seasoned_token();
        let mut cfg = config();
        cfg.min_token_age_seconds = 45;
        assert!(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap().is_approved());

        cfg.min_token_age_seconds = 46;
        let checks = rejected(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap());
        assert_eq!(checks[0].name, "MIN_TOKEN_AGE");
    }

    #[test]
    fn test_creator_selling_is_a_rug_signal() {
        let mut token = seasoned_token();
        let v_tokens = 560_000_000.0 + 30_000_000.0;
        let v_sol = 42.0 * v_tokens / SUPPLY;
        apply(
            &mut token,
            trade(
                TradeSide::Sell,
                CREATOR,
                T0 + 46_000,
                42.0,
                v_tokens,
                30_000_000.0,
                70_000_000.0,
                Some(0.15 * v_sol),
            ),
        );

        let cfg = config();
        let checks = rejected(SafetyChecker::new(&cfg).check(&token, T0 + 46_000, 100.0).unwrap());
        assert_eq!(checks[0].phase, CheckPhase::RugSignals);
        assert_eq!(checks[0].reason, "Suspicious creator selling");
        assert!((checks[0].actual_value - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_large_creator_dumping_after_pump() {
        // the creator bought 40% of supply at launch
        let creator_bag = 400_000_000.0;
        let mut token =
            Token::from_create(&create(5.0, creator_bag), &MetricsConfig::default()).unwrap();
        for mut event in seasoned_trades() {
            event.v_tokens -= 300_000_000.0;
            event.v_sol = event.market_cap_sol * event.v_tokens / SUPPLY;
            apply(&mut token, event);
        }

        // a heavy buy pumps the market cap from 44 to 55 SOL
        let pump_at = T0 + 60_000;
        apply(
            &mut token,
            trade(TradeSide::Buy, &trader(28), pump_at, 55.0, 2.4e8, 2.0e7, 2.0e7, Some(30.0)),
        );
        assert_eq!(token.pump_metrics().last_pump_time, Some(pump_at));

        // ten seconds later the creator pulls 15% of the curve's SOL
        let (v_sol, v_tokens) = (token.v_sol, token.v_tokens);
        let sold_sol = 0.15 * v_sol;
        let v_sol_after = v_sol - sold_sol;
        let v_tokens_after = v_sol * v_tokens / v_sol_after;
        let tokens_sold = v_tokens_after - v_tokens;
        let now = pump_at + 10_000;
        apply(
            &mut token,
            trade(
                TradeSide::Sell,
                CREATOR,
                now,
                v_sol_after * SUPPLY / v_tokens_after,
                v_tokens_after,
                tokens_sold,
                creator_bag - tokens_sold,
                Some(sold_sol),
            ),
        );

        // the drop from the pump stays inside the dump limit
        let pump_price = token.pump_metrics().last_pump_price.unwrap();
        assert!((token.current_price / pump_price - 1.0) * 100.0 > -30.0);
        assert!(token.top_holder_concentration(3) > 0.4);

        let cfg = config();
        let checks = rejected(SafetyChecker::new(&cfg).check(&token, now, 100.0).unwrap());
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "CREATOR_SELLING");
        assert_eq!(checks[0].phase, CheckPhase::RugSignals);
        assert_eq!(checks[0].reason, "Suspicious creator selling");
        assert!(checks[0].actual_value > cfg.max_creator_sell_liquidity_pct);
    }

    #[test]
    fn test_post_pump_dump_is_a_rug_signal() {
        let mut token = seasoned_token();
        assert!(token.pump_metrics().pump_count > 0);
        // buyer 1 dumps 50M, market cap falls to 25 SOL
        apply(
            &mut token,
            trade(
                TradeSide::Sell,
                &trader(1),
                T0 + 50_000,
                25.0,
                610_000_000.0,
                50_000_000.0,
                0.0,
                None,
            ),
        );
        let cfg = config();
        let checks = rejected(SafetyChecker::new(&cfg).check(&token, T0 + 50_000, 100.0).unwrap());
        assert_eq!(checks[0].name, "POST_PUMP_DUMP");
        assert_eq!(checks[0].phase, CheckPhase::RugSignals);
    }

    #[test]
    fn test_concentration_limit() {
        let token = seasoned_token();
        let mut cfg = config();
        cfg.max_top_holder_concentration = 0.15;
        let checks = rejected(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap());
        assert_eq!(checks[0].name, "TOP_HOLDER_CONCENTRATION");
    }

    #[test]
    fn test_pump_dynamics_requires_one_branch() {
        let token = seasoned_token();
        let mut cfg = config();
        cfg.pump_detection.min_price_acceleration = 1.0e6;
        cfg.pump_detection.min_gain_rate = 1.0e6;
        cfg.pump_detection.large_token_mc_usd = 1.0e12;
        cfg.pump_detection.min_pump_count = 100;

        let checks = rejected(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap());
        assert_eq!(checks.len(), 4);
        assert!(checks.iter().all(|c| c.phase == CheckPhase::PumpDynamics));

        // any single branch is enough
        cfg.pump_detection.min_pump_count = 1;
        assert!(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap().is_approved());
    }

    #[test]
    fn test_non_finite_metrics_error() {
        let mut token = seasoned_token();
        token.v_sol = f64::NAN;
        let cfg = config();
        let result = SafetyChecker::new(&cfg).check(&token, NOW, 100.0);
        assert!(matches!(result, Err(Error::SafetyCheck(_))));
    }

    #[test]
    fn test_disabled_checker_approves() {
        let token = seasoned_token();
        let mut cfg = config();
        cfg.enabled = false;
        cfg.min_holders = 1_000;
        assert!(SafetyChecker::new(&cfg).check(&token, NOW, 100.0).unwrap().is_approved());
    }

    #[test]
    fn test_retry_policy() {
        let mut token = seasoned_token();
        let cfg = config();
        let checker = SafetyChecker::new(&cfg);
        assert!(checker.should_evaluate(&token, NOW));

        token.last_safety_failure = Some(SafetyFailureMark {
            timestamp: NOW,
            price: token.current_price,
        });
        assert!(!checker.should_evaluate(&token, NOW + 4_999));
        assert!(checker.should_evaluate(&token, NOW + 5_000));

        // ran more than 20% since the failure
        token.last_safety_failure = Some(SafetyFailureMark {
            timestamp: NOW,
            price: token.current_price / 1.25,
        });
        assert!(!checker.should_evaluate(&token, NOW + 10_000));
    }
}
