//! Per-strategy effectiveness tracking.
//!
//! Updated once per finalized cycle. Observability only: nothing in the
//! control path reads these values back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ControlStrategy;
use crate::units::Timestamp;

/// Running averages for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyRecord {
    pub cycles: u64,
    pub avg_temp_error: f64,
    pub avg_adjustments: f64,
    pub avg_movement: f64,
    pub last_temp_error: Option<f64>,
    pub last_adjustments: u32,
    pub last_movement: f64,
    pub last_updated: Option<String>,
}

impl StrategyRecord {
    fn push(&mut self, temp_error: f64, adjustments: u32, movement: f64, now: Timestamp) {
        self.cycles += 1;
        let n = self.cycles as f64;
        self.avg_temp_error = (self.avg_temp_error * (n - 1.0) + temp_error) / n;
        self.avg_adjustments = (self.avg_adjustments * (n - 1.0) + f64::from(adjustments)) / n;
        self.avg_movement = (self.avg_movement * (n - 1.0) + movement) / n;
        self.last_temp_error = Some(temp_error);
        self.last_adjustments = adjustments;
        self.last_movement = movement;
        self.last_updated = Some(now.to_rfc3339());
    }
}

/// Records keyed by strategy label, plus the last strategy that ran a pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyMetrics {
    pub last_strategy: Option<ControlStrategy>,
    pub strategies: BTreeMap<String, StrategyRecord>,
}

impl StrategyMetrics {
    /// Fold one finished cycle into `strategy`'s averages.
    pub fn record(&mut self, strategy: ControlStrategy, temp_error: f64, adjustments: u32, movement: f64, now: Timestamp) {
        self.strategies
            .entry(strategy.as_str().to_string())
            .or_default()
            .push(temp_error, adjustments, movement, now);
    }

    /// Note that `strategy` drove an adjustment pass.
    pub fn mark_used(&mut self, strategy: ControlStrategy) {
        self.last_strategy = Some(strategy);
    }

    #[must_use]
    pub fn get(&self, strategy: ControlStrategy) -> Option<&StrategyRecord> {
        self.strategies.get(strategy.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_accumulate_per_strategy() {
        let mut metrics = StrategyMetrics::default();
        metrics.record(ControlStrategy::Hybrid, 1.0, 4, 60.0, Timestamp(0));
        metrics.record(ControlStrategy::Hybrid, 0.5, 2, 20.0, Timestamp(60_000));
        metrics.record(ControlStrategy::Dab, 2.0, 1, 10.0, Timestamp(0));

        let hybrid = metrics.get(ControlStrategy::Hybrid).unwrap();
        assert_eq!(hybrid.cycles, 2);
        assert!((hybrid.avg_temp_error - 0.75).abs() < 1e-12);
        assert!((hybrid.avg_adjustments - 3.0).abs() < 1e-12);
        assert!((hybrid.avg_movement - 40.0).abs() < 1e-12);
        assert_eq!(hybrid.last_adjustments, 2);
        assert_eq!(hybrid.last_updated.as_deref(), Some("1970-01-01T00:01:00.000Z"));
        assert_eq!(metrics.get(ControlStrategy::Dab).unwrap().cycles, 1);
        assert!(metrics.get(ControlStrategy::Stats).is_none());
    }

    #[test]
    fn serializes_with_strategy_labels() {
        let mut metrics = StrategyMetrics::default();
        metrics.mark_used(ControlStrategy::Cost);
        metrics.record(ControlStrategy::Cost, 0.2, 1, 5.0, Timestamp(0));
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["last_strategy"], "cost");
        assert_eq!(json["strategies"]["cost"]["cycles"], 1);
    }
}
