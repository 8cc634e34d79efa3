//! Missed-opportunity tracking
//!
//! Every rejected token is followed until it goes terminal or the tracking
//! window ends. If it went on to pump hard and fast, a record is emitted with
//! per-check threshold suggestions.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MissedOpportunityConfig;
use crate::safety::checker::{Comparison, FailedCheck};
use crate::token::token::TokenSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSuggestion {
    pub check_name: String,
    pub threshold_path: String,
    pub current_value: f64,
    pub actual_value: f64,
    pub suggested_value: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakData {
    pub peak_price: f64,
    pub peak_time: i64,
    pub peak_market_cap_sol: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedOpportunity {
    pub mint: String,
    pub symbol: String,
    pub rejected_at: i64,
    pub rejected_price: f64,
    pub initial_metrics: TokenSnapshot,
    pub failed_checks: Vec<FailedCheck>,
    pub peak_data: PeakData,
    pub gain_pct: f64,
    pub time_to_peak_ms: i64,
    pub potential_profit_sol: f64,
    pub threshold_analysis: Vec<ThresholdSuggestion>,
}

#[derive(Debug, Clone)]
struct TrackedRejection {
    snapshot: TokenSnapshot,
    failed_checks: Vec<FailedCheck>,
    hypothetical_size_sol: f64,
    peak: PeakData,
}

/// Confidence attached to a suggestion for a given threshold
fn confidence_for(path: &str) -> f64 {
    match path {
        "safety.min_holders" => 0.8,
        "safety.min_liquidity_sol" | "safety.min_token_age_seconds" => 0.7,
        "safety.max_top_holder_concentration" => 0.6,
        "safety.max_creator_sell_liquidity_pct" => 0.4,
        _ => 0.5,
    }
}

/// One suggestion per failed check; internal failures have none
pub fn analyze_thresholds(failed_checks: &[FailedCheck]) -> Vec<ThresholdSuggestion> {
    failed_checks
        .iter()
        .filter(|c| !c.threshold_path.is_empty())
        .map(|c| {
            let integral = matches!(
                c.threshold_path.as_str(),
                "safety.min_holders"
                    | "safety.min_token_age_seconds"
                    | "safety.pump_detection.min_pump_count"
            );
            let suggested = match c.comparison {
                Comparison::AtLeast => {
                    let relaxed = c.threshold_value * 0.9;
                    let relaxed = if integral { relaxed.floor() } else { relaxed };
                    relaxed.min(c.actual_value)
                }
                Comparison::AtMost => (c.threshold_value * 1.1).max(c.actual_value),
            };
            ThresholdSuggestion {
                check_name: c.name.clone(),
                threshold_path: c.threshold_path.clone(),
                current_value: c.threshold_value,
                actual_value: c.actual_value,
                suggested_value: suggested,
                confidence: confidence_for(&c.threshold_path),
            }
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct MissedOpportunityTracker {
    tracked: DashMap<String, TrackedRejection>,
}

impl MissedOpportunityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start following a rejected token. A token already followed keeps its
    /// first rejection and accumulates the new failed checks.
    pub fn enroll(
        &self,
        snapshot: TokenSnapshot,
        failed_checks: Vec<FailedCheck>,
        hypothetical_size_sol: f64,
    ) {
        let mint = snapshot.mint.clone();
        match self.tracked.entry(mint) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let existing = existing.get_mut();
                for check in failed_checks {
                    if !existing.failed_checks.iter().any(|c| c.name == check.name) {
                        existing.failed_checks.push(check);
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let peak = PeakData {
                    peak_price: snapshot.price,
                    peak_time: snapshot.timestamp,
                    peak_market_cap_sol: snapshot.market_cap_sol,
                };
                slot.insert(TrackedRejection {
                    snapshot,
                    failed_checks,
                    hypothetical_size_sol,
                    peak,
                });
            }
        }
    }

    pub fn is_tracking(&self, mint: &str) -> bool {
        self.tracked.contains_key(mint)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Stop following without emitting, e.g. once a position was opened
    pub fn untrack(&self, mint: &str) {
        self.tracked.remove(mint);
    }

    pub fn observe(&self, mint: &str, price: f64, market_cap_sol: f64, timestamp: i64) {
        if let Some(mut entry) = self.tracked.get_mut(mint) {
            if price > entry.peak.peak_price {
                entry.peak = PeakData {
                    peak_price: price,
                    peak_time: timestamp,
                    peak_market_cap_sol: market_cap_sol,
                };
            }
        }
    }

    /// Stop following `mint`; returns a record if the miss was significant
    pub fn finalize(
        &self,
        mint: &str,
        config: &MissedOpportunityConfig,
    ) -> Option<MissedOpportunity> {
        let (_, tracked) = self.tracked.remove(mint)?;
        Self::evaluate(tracked, config)
    }

    /// Finalize every rejection whose tracking window has ended
    pub fn expire(&self, now: i64, config: &MissedOpportunityConfig) -> Vec<MissedOpportunity> {
        let expired: Vec<String> = self
            .tracked
            .iter()
            .filter(|e| now - e.snapshot.timestamp >= config.tracking_window_ms)
            .map(|e| e.key().clone())
            .collect();
        expired
            .iter()
            .filter_map(|mint| self.finalize(mint, config))
            .collect()
    }

    /// Finalize everything, used at shutdown
    pub fn drain(&self, config: &MissedOpportunityConfig) -> Vec<MissedOpportunity> {
        let mints: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        mints
            .iter()
            .filter_map(|mint| self.finalize(mint, config))
            .collect()
    }

    fn evaluate(
        tracked: TrackedRejection,
        config: &MissedOpportunityConfig,
    ) -> Option<MissedOpportunity> {
        if !config.enabled {
            return None;
        }
        let rejected_price = tracked.snapshot.price;
        if rejected_price <= 0.0 {
            return None;
        }
        let gain = (tracked.peak.peak_price - rejected_price) / rejected_price;
        let gain_pct = gain * 100.0;
        let time_to_peak_ms = tracked.peak.peak_time - tracked.snapshot.timestamp;
        let potential_profit_sol = tracked.hypothetical_size_sol * gain;

        let significant = gain_pct >= config.significant_gain_pct
            && time_to_peak_ms < config.max_time_to_peak_ms
            && potential_profit_sol >= config.min_profit_sol;
        if !significant {
            return None;
        }

        info!(
            mint = %tracked.snapshot.mint,
            gain_pct = format!("{:.1}", gain_pct),
            time_to_peak_secs = time_to_peak_ms / 1000,
            profit_sol = format!("{:.4}", potential_profit_sol),
            "Missed opportunity"
        );

        Some(MissedOpportunity {
            mint: tracked.snapshot.mint.clone(),
            symbol: tracked.snapshot.symbol.clone(),
            rejected_at: tracked.snapshot.timestamp,
            rejected_price,
            threshold_analysis: analyze_thresholds(&tracked.failed_checks),
            initial_metrics: tracked.snapshot,
            failed_checks: tracked.failed_checks,
            peak_data: tracked.peak,
            gain_pct,
            time_to_peak_ms,
            potential_profit_sol,
        })
    }
}
