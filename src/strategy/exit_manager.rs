//! Layered exit engine
//!
//! Rules are checked in a fixed priority order and the first one that fires
//! wins: stop-loss, trailing stop, take-profit tiers, volume collapse, time
//! exit. Disabled rules are skipped without reordering the rest.

use tracing::debug;

use crate::config::{ExitStrategiesConfig, TrailingStopConfig};
use crate::position::position::Position;
use crate::strategy::types::{ExitDecision, ExitReason, MarketContext};

pub struct ExitEngine<'a> {
    config: &'a ExitStrategiesConfig,
}

impl<'a> ExitEngine<'a> {
    pub fn new(config: &'a ExitStrategiesConfig) -> Self {
        Self { config }
    }

    /// Decide whether any part of `position` should be closed now.
    /// Pure: reads the position and market snapshot, mutates nothing.
    pub fn evaluate(&self, position: &Position, market: &MarketContext) -> Option<ExitDecision> {
        if !position.is_open() {
            return None;
        }

        let decision = self
            .check_stop_loss(position)
            .or_else(|| self.check_trailing_stop(position, market))
            .or_else(|| self.check_take_profit(position))
            .or_else(|| self.check_volume_collapse(position, market))
            .or_else(|| self.check_time_exit(position, market));

        if let Some(decision) = &decision {
            debug!(
                mint = %position.mint,
                reason = %decision.reason,
                portion = decision.portion,
                roi_pct = position.roi_pct(),
                "Exit triggered"
            );
        }
        decision
    }

    fn check_stop_loss(&self, position: &Position) -> Option<ExitDecision> {
        let cfg = &self.config.stop_loss;
        if cfg.enabled && position.roi_pct() <= -cfg.percentage {
            return Some(ExitDecision::full(ExitReason::StopLoss));
        }
        None
    }

    fn check_trailing_stop(
        &self,
        position: &Position,
        market: &MarketContext,
    ) -> Option<ExitDecision> {
        let cfg = &self.config.trailing_stop;
        if !cfg.enabled || position.peak_roi_pct() < cfg.activation_pct {
            return None;
        }
        let distance = trail_distance(cfg, market.volatility);
        if position.drawdown_from_peak_pct() >= distance {
            return Some(ExitDecision::full(ExitReason::TrailingStop));
        }
        None
    }

    fn check_take_profit(&self, position: &Position) -> Option<ExitDecision> {
        let cfg = &self.config.take_profit;
        if !cfg.enabled {
            return None;
        }
        let roi = position.roi_pct();
        cfg.tiers
            .iter()
            .enumerate()
            .map(|(i, tier)| ((i + 1) as u8, tier))
            .find(|(n, tier)| !position.tier_triggered(*n) && roi >= tier.threshold_pct)
            .map(|(tier, t)| ExitDecision {
                portion: t.portion,
                reason: ExitReason::TakeProfit { tier },
            })
    }

    fn check_volume_collapse(
        &self,
        position: &Position,
        market: &MarketContext,
    ) -> Option<ExitDecision> {
        let cfg = &self.config.volume_based;
        if !cfg.enabled {
            return None;
        }
        let peak = position.peak_volume_sol.max(market.volume_sol);
        let floor = peak * cfg.volume_drop_threshold_pct / 100.0;
        if peak >= cfg.min_peak_volume_sol && market.volume_sol < floor {
            return Some(ExitDecision::full(ExitReason::VolumeExit));
        }
        None
    }

    fn check_time_exit(&self, position: &Position, market: &MarketContext) -> Option<ExitDecision> {
        let cfg = &self.config.time_based;
        if !cfg.enabled {
            return None;
        }
        let mut max_hold_ms = cfg.max_hold_time_secs as i64 * 1000;
        if position.roi_pct() > cfg.extension_threshold_pct {
            max_hold_ms += cfg.extension_time_secs as i64 * 1000;
        }
        if position.hold_time_ms(market.timestamp) > max_hold_ms {
            return Some(ExitDecision::full(ExitReason::TimeExit));
        }
        None
    }
}

/// Trail distance in percent, widened by volatility
pub fn trail_distance(cfg: &TrailingStopConfig, volatility: f64) -> f64 {
    let volatility = if volatility.is_finite() { volatility.max(0.0) } else { 0.0 };
    (cfg.base_pct + volatility * cfg.volatility_multiplier).clamp(cfg.min_pct, cfg.max_pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TakeProfitTier;

    const HOUR_MS: i64 = 3_600_000;

    fn position_at(entry: f64, current: f64) -> Position {
        let mut position = Position::pending("mint", "SYM", 1.0, entry, 0);
        position.open(entry, 0.0, 0).unwrap();
        position.update_price(current, 1).unwrap();
        position
    }

    fn market(price: f64, volume_sol: f64, timestamp: i64) -> MarketContext {
        MarketContext {
            price,
            volatility: 0.0,
            volume_sol,
            timestamp,
        }
    }

    fn only(rule: &str) -> ExitStrategiesConfig {
        let mut config = ExitStrategiesConfig::default();
        config.stop_loss.enabled = rule == "stop_loss";
        config.trailing_stop.enabled = rule == "trailing_stop";
        config.take_profit.enabled = rule == "take_profit";
        config.volume_based.enabled = rule == "volume_based";
        config.time_based.enabled = rule == "time_based";
        config
    }

    #[test]
    fn test_stop_loss_boundary() {
        let config = ExitStrategiesConfig::default();
        let engine = ExitEngine::new(&config);

        let at_boundary = position_at(2.0, 1.5);
        let decision = engine.evaluate(&at_boundary, &market(1.5, 0.0, 1)).unwrap();
        assert_eq!(decision, ExitDecision::full(ExitReason::StopLoss));

        let just_above = position_at(2.0, 1.5 + 1e-9);
        assert!(engine.evaluate(&just_above, &market(1.5, 0.0, 1)).is_none());
    }

    #[test]
    fn test_time_exit_after_two_hours() {
        let config = ExitStrategiesConfig::default();
        let engine = ExitEngine::new(&config);

        let position = position_at(1.0, 1.05);
        let decision = engine.evaluate(&position, &market(1.05, 0.0, 2 * HOUR_MS)).unwrap();
        assert_eq!(decision.reason, ExitReason::TimeExit);
    }

    #[test]
    fn test_time_exit_extended_for_winners() {
        let config = only("time_based");
        let engine = ExitEngine::new(&config);

        // 31 minutes at +15%: extension applies
        let position = position_at(1.0, 1.15);
        assert!(engine.evaluate(&position, &market(1.15, 0.0, 31 * 60_000)).is_none());
        assert_eq!(
            engine.evaluate(&position, &market(1.15, 0.0, 46 * 60_000)).unwrap().reason,
            ExitReason::TimeExit
        );
    }

    #[test]
    fn test_volume_collapse() {
        let config = ExitStrategiesConfig::default();
        let engine = ExitEngine::new(&config);

        let mut position = position_at(1.0, 1.02);
        position.observe_volume(1_500.0);
        let decision = engine.evaluate(&position, &market(1.02, 800.0, 60_000)).unwrap();
        assert_eq!(decision.reason, ExitReason::VolumeExit);

        // 1000 is still above 60% of the peak
        assert!(engine.evaluate(&position, &market(1.02, 1_000.0, 60_000)).is_none());

        // peak below the minimum never triggers
        let mut quiet = position_at(1.0, 1.02);
        quiet.observe_volume(5.0);
        assert!(engine.evaluate(&quiet, &market(1.02, 0.5, 60_000)).is_none());
    }

    #[test]
    fn test_take_profit_tiers_fire_once_in_order() {
        let mut config = only("take_profit");
        config.take_profit.tiers = vec![
            TakeProfitTier {
                threshold_pct: 10.0,
                portion: 0.3,
            },
            TakeProfitTier {
                threshold_pct: 20.0,
                portion: 0.3,
            },
        ];
        let engine = ExitEngine::new(&config);

        let mut position = position_at(1.0, 1.25);
        let first = engine.evaluate(&position, &market(1.25, 0.0, 1)).unwrap();
        assert_eq!(first.reason, ExitReason::TakeProfit { tier: 1 });
        position.apply_exit(first.portion, 1.25, first.reason, 1, 100.0).unwrap();

        let second = engine.evaluate(&position, &market(1.25, 0.0, 2)).unwrap();
        assert_eq!(second.reason, ExitReason::TakeProfit { tier: 2 });
        position.apply_exit(second.portion, 1.25, second.reason, 2, 100.0).unwrap();

        assert!(engine.evaluate(&position, &market(1.25, 0.0, 3)).is_none());
    }

    #[test]
    fn test_trailing_stop_uses_volatility() {
        let config = only("trailing_stop");
        let engine = ExitEngine::new(&config);

        let mut position = position_at(1.0, 1.3);
        position.update_price(1.22, 2).unwrap();
        // 6.15% off the peak: beyond base 5% but within 5 + 0.05 * 50 = 7.5%
        let mut calm = market(1.22, 0.0, 2);
        assert_eq!(engine.evaluate(&position, &calm).unwrap().reason, ExitReason::TrailingStop);
        calm.volatility = 0.05;
        assert!(engine.evaluate(&position, &calm).is_none());

        // not armed below the activation ROI
        let mut small = position_at(1.0, 1.05);
        small.update_price(0.9, 2).unwrap();
        assert!(engine.evaluate(&small, &market(0.9, 0.0, 2)).is_none());
    }

    #[test]
    fn test_priority_is_stable_when_rules_disabled() {
        // stop-loss and time exit both apply: stop-loss wins
        let config = ExitStrategiesConfig::default();
        let engine = ExitEngine::new(&config);
        let position = position_at(1.0, 0.7);
        assert_eq!(
            engine.evaluate(&position, &market(0.7, 0.0, 2 * HOUR_MS)).unwrap().reason,
            ExitReason::StopLoss
        );

        // disabling stop-loss leaves time exit in charge
        let mut config = ExitStrategiesConfig::default();
        config.stop_loss.enabled = false;
        let engine = ExitEngine::new(&config);
        assert_eq!(
            engine.evaluate(&position, &market(0.7, 0.0, 2 * HOUR_MS)).unwrap().reason,
            ExitReason::TimeExit
        );
    }

    #[test]
    fn test_trail_distance_is_clamped() {
        let cfg = TrailingStopConfig::default();
        assert_eq!(trail_distance(&cfg, 0.0), 5.0);
        assert_eq!(trail_distance(&cfg, 1.0), 15.0);
        assert_eq!(trail_distance(&cfg, f64::NAN), 5.0);
    }
}
