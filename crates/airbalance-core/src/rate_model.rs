//! Learned thermal rates per vent and per conditioning mode.
//!
//! Each vent carries:
//! - a smoothed rate (degrees per minute at 100% open), overwritten at finalize,
//! - streaming least-squares sums over `(percent_open, observed_rate)` samples.
//!
//! A global per-mode ceiling tracks the highest rate ever learned; it seeds
//! vents that have never produced a usable observation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DabSettings;
use crate::units::HvacMode;

/// Learned rates for one vent. `None` means never learned for that mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooling_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heating_rate: Option<f64>,
}

impl RateEntry {
    #[must_use]
    pub const fn get(&self, mode: HvacMode) -> Option<f64> {
        match mode {
            HvacMode::Cooling => self.cooling_rate,
            HvacMode::Heating => self.heating_rate,
        }
    }

    pub fn set(&mut self, mode: HvacMode, value: f64) {
        match mode {
            HvacMode::Cooling => self.cooling_rate = Some(value),
            HvacMode::Heating => self.heating_rate = Some(value),
        }
    }
}

/// Running sums for ordinary least squares over `x = percent_open`, `y = rate`.
///
/// Only four sums and a count are kept. Samples are never removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionStats {
    pub n: u32,
    pub sum_x: f64,
    pub sum_y: f64,
    pub sum_xx: f64,
    pub sum_xy: f64,
}

impl RegressionStats {
    /// Append one sample.
    pub fn push(&mut self, x: f64, y: f64) {
        self.n = self.n.saturating_add(1);
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;
    }

    /// `(slope, intercept)`, or `None` while underdetermined.
    #[must_use]
    pub fn fit(&self) -> Option<(f64, f64)> {
        if self.n < 2 {
            return None;
        }
        let n = f64::from(self.n);
        let denom = n * self.sum_xx - self.sum_x * self.sum_x;
        if denom == 0.0 {
            return None;
        }
        let slope = (n * self.sum_xy - self.sum_x * self.sum_y) / denom;
        let intercept = (self.sum_y - slope * self.sum_x) / n;
        Some((slope, intercept))
    }
}

/// Regression sums for both modes of one vent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeRegression {
    #[serde(default)]
    pub cooling: RegressionStats,
    #[serde(default)]
    pub heating: RegressionStats,
}

impl ModeRegression {
    #[must_use]
    pub const fn get(&self, mode: HvacMode) -> &RegressionStats {
        match mode {
            HvacMode::Cooling => &self.cooling,
            HvacMode::Heating => &self.heating,
        }
    }

    fn get_mut(&mut self, mode: HvacMode) -> &mut RegressionStats {
        match mode {
            HvacMode::Cooling => &mut self.cooling,
            HvacMode::Heating => &mut self.heating,
        }
    }
}

/// Highest rate ever learned, per mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalRateCeiling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooling_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heating_max: Option<f64>,
}

impl GlobalRateCeiling {
    #[must_use]
    pub const fn get(&self, mode: HvacMode) -> Option<f64> {
        match mode {
            HvacMode::Cooling => self.cooling_max,
            HvacMode::Heating => self.heating_max,
        }
    }

    /// Raise the ceiling if `rate` exceeds it. Returns true if it moved.
    pub fn observe(&mut self, mode: HvacMode, rate: f64) -> bool {
        let slot = match mode {
            HvacMode::Cooling => &mut self.cooling_max,
            HvacMode::Heating => &mut self.heating_max,
        };
        if rate > slot.unwrap_or(0.0) {
            *slot = Some(rate);
            return true;
        }
        false
    }

    /// Seed for a closed vent with no history: 10% of the ceiling, or of the
    /// configured maximum when nothing has been learned yet.
    #[must_use]
    pub fn fallback_seed(&self, mode: HvacMode, settings: &DabSettings) -> f64 {
        self.get(mode).unwrap_or(settings.max_temp_change_rate) * 0.1
    }
}

/// Owned rate state for every vent the engine has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateModel {
    #[serde(default)]
    vent_rates: BTreeMap<String, RateEntry>,
    #[serde(default)]
    regression: BTreeMap<String, ModeRegression>,
    #[serde(default)]
    max_rates: GlobalRateCeiling,
}

impl RateModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Learned rate, or 0 when unknown.
    #[must_use]
    pub fn get_rate(&self, vent_id: &str, mode: HvacMode) -> f64 {
        self.learned_rate(vent_id, mode).unwrap_or(0.0)
    }

    #[must_use]
    pub fn learned_rate(&self, vent_id: &str, mode: HvacMode) -> Option<f64> {
        self.vent_rates.get(vent_id).and_then(|entry| entry.get(mode))
    }

    pub fn set_rate(&mut self, vent_id: &str, mode: HvacMode, value: f64) {
        self.vent_rates
            .entry(vent_id.to_string())
            .or_default()
            .set(mode, value);
    }

    /// Return the usable rate for `vent_id`, seeding it with `initial_rate`
    /// when nothing positive has been learned. Returns 0 if the seed is unusable.
    pub fn ensure_rate(&mut self, vent_id: &str, mode: HvacMode, initial_rate: f64) -> f64 {
        let current = self.get_rate(vent_id, mode);
        if current > 0.0 {
            return current;
        }
        if initial_rate <= 0.0 {
            return 0.0;
        }
        self.set_rate(vent_id, mode, initial_rate);
        initial_rate
    }

    pub fn update_regression(&mut self, vent_id: &str, mode: HvacMode, open_percent: f64, observed_rate: f64) {
        self.regression
            .entry(vent_id.to_string())
            .or_default()
            .get_mut(mode)
            .push(open_percent, observed_rate);
    }

    #[must_use]
    pub fn regression_stats(&self, vent_id: &str, mode: HvacMode) -> Option<&RegressionStats> {
        self.regression.get(vent_id).map(|m| m.get(mode))
    }

    #[must_use]
    pub fn fit(&self, vent_id: &str, mode: HvacMode) -> Option<(f64, f64)> {
        self.regression_stats(vent_id, mode).and_then(RegressionStats::fit)
    }

    #[must_use]
    pub const fn ceiling(&self) -> &GlobalRateCeiling {
        &self.max_rates
    }

    pub fn ceiling_mut(&mut self) -> &mut GlobalRateCeiling {
        &mut self.max_rates
    }

    /// Every vent with at least one learned rate, sorted by id.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RateEntry)> {
        self.vent_rates.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vent_rates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vent_rates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rate_reads_zero() {
        let model = RateModel::new();
        assert_eq!(model.get_rate("v1", HvacMode::Cooling), 0.0);
        assert_eq!(model.learned_rate("v1", HvacMode::Cooling), None);
    }

    #[test]
    fn modes_are_independent() {
        let mut model = RateModel::new();
        model.set_rate("v1", HvacMode::Cooling, 0.4);
        assert_eq!(model.get_rate("v1", HvacMode::Cooling), 0.4);
        assert_eq!(model.get_rate("v1", HvacMode::Heating), 0.0);
        model.set_rate("v1", HvacMode::Heating, 0.2);
        assert_eq!(model.get_rate("v1", HvacMode::Cooling), 0.4);
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn ensure_rate_seeds_only_when_unlearned() {
        let mut model = RateModel::new();
        assert_eq!(model.ensure_rate("v1", HvacMode::Heating, 0.5), 0.5);
        assert_eq!(model.get_rate("v1", HvacMode::Heating), 0.5);
        model.set_rate("v1", HvacMode::Heating, 0.3);
        assert_eq!(model.ensure_rate("v1", HvacMode::Heating, 0.5), 0.3);
        assert_eq!(model.ensure_rate("v2", HvacMode::Heating, 0.0), 0.0);
        assert_eq!(model.learned_rate("v2", HvacMode::Heating), None);
    }

    #[test]
    fn fit_requires_two_distinct_x_values() {
        let mut stats = RegressionStats::default();
        assert_eq!(stats.fit(), None);
        stats.push(50.0, 0.3);
        assert_eq!(stats.fit(), None);
        stats.push(50.0, 0.4);
        assert_eq!(stats.fit(), None);
        stats.push(60.0, 0.5);
        assert!(stats.fit().is_some());
    }

    #[test]
    fn fit_recovers_known_line() {
        let mut model = RateModel::new();
        for x in [20.0, 35.0, 50.0, 80.0, 100.0] {
            model.update_regression("v1", HvacMode::Cooling, x, 0.01 * x + 0.05);
        }
        let (slope, intercept) = model.fit("v1", HvacMode::Cooling).unwrap();
        assert!((slope - 0.01).abs() < 1e-9);
        assert!((intercept - 0.05).abs() < 1e-9);
        assert_eq!(model.fit("v1", HvacMode::Heating), None);
    }

    #[test]
    fn fit_minimizes_squared_residuals() {
        let samples = [(10.0, 0.12), (30.0, 0.31), (55.0, 0.49), (70.0, 0.74), (90.0, 0.88)];
        let mut stats = RegressionStats::default();
        for (x, y) in samples {
            stats.push(x, y);
        }
        let (slope, intercept) = stats.fit().unwrap();
        let sse = |m: f64, b: f64| -> f64 {
            samples.iter().map(|(x, y)| (y - (m * x + b)).powi(2)).sum()
        };
        let best = sse(slope, intercept);
        for (dm, db) in [(1e-4, 0.0), (-1e-4, 0.0), (0.0, 1e-3), (0.0, -1e-3)] {
            assert!(sse(slope + dm, intercept + db) > best);
        }
    }

    #[test]
    fn ceiling_only_rises() {
        let mut ceiling = GlobalRateCeiling::default();
        let settings = DabSettings::default();
        assert!((ceiling.fallback_seed(HvacMode::Cooling, &settings) - 0.15).abs() < 1e-12);
        assert!(ceiling.observe(HvacMode::Cooling, 0.8));
        assert!(!ceiling.observe(HvacMode::Cooling, 0.5));
        assert_eq!(ceiling.get(HvacMode::Cooling), Some(0.8));
        assert_eq!(ceiling.get(HvacMode::Heating), None);
        assert!((ceiling.fallback_seed(HvacMode::Cooling, &settings) - 0.08).abs() < 1e-12);
    }

    #[test]
    fn model_serializes_with_stable_keys() {
        let mut model = RateModel::new();
        model.set_rate("v1", HvacMode::Cooling, 0.4);
        model.update_regression("v1", HvacMode::Cooling, 50.0, 0.2);
        model.ceiling_mut().observe(HvacMode::Cooling, 0.4);
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["vent_rates"]["v1"]["cooling_rate"], 0.4);
        assert_eq!(json["regression"]["v1"]["cooling"]["n"], 1);
        assert_eq!(json["max_rates"]["cooling_max"], 0.4);
        let back: RateModel = serde_json::from_value(json).unwrap();
        assert_eq!(back, model);
    }
}
