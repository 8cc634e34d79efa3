//! Position sizing
//!
//! Size scales with the token's market cap and shrinks with volatility.

use crate::config::PositionConfig;

pub struct PositionSizer<'a> {
    config: &'a PositionConfig,
}

impl<'a> PositionSizer<'a> {
    pub fn new(config: &'a PositionConfig) -> Self {
        Self { config }
    }

    /// Position size in SOL for a token at `market_cap_sol`
    pub fn calculate_size(&self, market_cap_sol: f64, volatility: f64) -> f64 {
        let min = self.config.min_position_size_sol;
        let max = self.config.max_position_size_sol;

        let mut size =
            (market_cap_sol * self.config.position_size_market_cap_ratio).clamp(min, max);

        if self.config.volatility_scaling && volatility.is_finite() && volatility > 0.0 {
            let scale = (1.0 - volatility * self.config.volatility_scaling_factor).max(0.0);
            size = (size * scale).clamp(min, max);
        }

        size
    }
}
