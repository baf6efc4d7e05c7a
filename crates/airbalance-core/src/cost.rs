//! Target-opening computation.
//!
//! Three models produce a candidate open percentage per vent:
//! - exponential (`dab`): `base · e^(exp · target_rate / rate) · 100`,
//! - linear (`cost`): `target_rate / rate · 100`,
//! - regression (`stats`): inverts the vent's fitted `open% → rate` line.
//!
//! `hybrid` evaluates all three and keeps the candidate with the lowest
//! actuation cost. Every model sizes its answer against one shared horizon:
//! the longest estimated time-to-setpoint among the thermostat's vents.

use std::collections::BTreeMap;

use crate::config::{ControlStrategy, DabSettings};
use crate::math::{has_room_reached_setpoint, round_big_decimal};
use crate::units::HvacMode;

const TEMP_WEIGHT: f64 = 1.0;
const OPEN_WEIGHT: f64 = 0.25;
const MOVE_WEIGHT: f64 = 0.3;

/// Everything the target models need to know about one vent for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct VentConditions {
    pub vent_id: String,
    pub room_name: Option<String>,
    /// Room temperature in Celsius. Equals the setpoint when `temp_missing`.
    pub temp: f64,
    /// Learned (or seeded) rate for the active mode.
    pub rate: f64,
    pub active: bool,
    /// Reported open percentage, when known.
    pub current_percent: Option<f64>,
    /// The room had no temperature reading this pass.
    pub temp_missing: bool,
}

/// Exponential-model target for one vent.
#[must_use]
pub fn exponential_open_percent(
    temp: f64,
    setpoint: f64,
    mode: HvacMode,
    rate: f64,
    horizon: f64,
    settings: &DabSettings,
) -> f64 {
    if has_room_reached_setpoint(mode, setpoint, temp, 0.0) {
        return 0.0;
    }
    if rate <= 0.0 || horizon <= 0.0 {
        return 100.0;
    }
    let target_rate = (setpoint - temp).abs() / horizon;
    let fraction = settings.base_const * ((target_rate / rate) * settings.exp_const).exp();
    round_big_decimal(fraction * 100.0, 3).clamp(0.0, 100.0)
}

/// Linear-model target: the share of the vent's full-open rate needed to
/// arrive exactly at the horizon.
#[must_use]
pub fn linear_open_percent(temp: f64, setpoint: f64, rate: f64, horizon: f64) -> f64 {
    if rate <= 0.0 || horizon <= 0.0 {
        return 100.0;
    }
    let diff = (setpoint - temp).abs();
    if diff <= 0.0 {
        return 0.0;
    }
    (diff / horizon / rate * 100.0).clamp(0.0, 100.0)
}

/// Regression-model target. Falls back to `linear_fallback` when the fit is
/// missing or not increasing.
#[must_use]
pub fn regression_open_percent(
    temp: f64,
    setpoint: f64,
    horizon: f64,
    fit: Option<(f64, f64)>,
    linear_fallback: f64,
) -> f64 {
    if horizon <= 0.0 {
        return 100.0;
    }
    let Some((slope, intercept)) = fit.filter(|(slope, _)| *slope > 0.0) else {
        return linear_fallback;
    };
    let target_rate = (setpoint - temp).abs() / horizon;
    ((target_rate - intercept) / slope).clamp(0.0, 100.0)
}

/// Longest estimated minutes-to-setpoint across the included vents.
///
/// Vents already at setpoint, vents with no learned rate, and (when
/// `close_inactive`) inactive rooms are skipped. Each estimate is capped at
/// `max_running_time`. Returns `None` when no vent qualifies.
#[must_use]
pub fn longest_minutes_to_target(
    vents: &[VentConditions],
    mode: HvacMode,
    setpoint: f64,
    max_running_time: f64,
    close_inactive: bool,
) -> Option<f64> {
    let mut longest: Option<f64> = None;
    for vent in vents {
        if close_inactive && !vent.active {
            continue;
        }
        if has_room_reached_setpoint(mode, setpoint, vent.temp, 0.0) {
            continue;
        }
        if vent.rate <= 0.0 {
            continue;
        }
        let mut minutes = (setpoint - vent.temp).abs() / vent.rate;
        if minutes > max_running_time * 2.0 {
            minutes = max_running_time;
        }
        minutes = minutes.min(max_running_time);
        longest = Some(longest.map_or(minutes, |l: f64| l.max(minutes)));
    }
    longest
}

/// Weighted cost of moving a vent to `candidate` percent.
///
/// Penalizes missing the horizon, holding the vent open, and moving it.
#[must_use]
pub fn actuation_cost(temp: f64, setpoint: f64, rate: f64, horizon: f64, candidate: f64, current: f64) -> f64 {
    let diff = (setpoint - temp).abs();
    let time_to_target = if candidate <= 0.0 || rate <= 0.0 || horizon <= 0.0 {
        if diff > 0.0 { f64::INFINITY } else { 0.0 }
    } else {
        diff / (rate * (candidate / 100.0))
    };
    let temp_cost = if horizon > 0.0 {
        (time_to_target - horizon).abs()
    } else {
        0.0
    };
    let open_cost = candidate / 100.0;
    let move_cost = (candidate - current).abs() / 100.0;
    TEMP_WEIGHT * temp_cost + OPEN_WEIGHT * open_cost + MOVE_WEIGHT * move_cost
}

/// The three model outputs for one vent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidates {
    pub dab: f64,
    pub cost: f64,
    pub stats: f64,
}

impl Candidates {
    /// Pick the target for `strategy`. `hybrid` compares costs in
    /// dab, cost, stats order and only replaces on a strictly lower cost.
    #[must_use]
    pub fn select(&self, strategy: ControlStrategy, cost_of: impl Fn(f64) -> f64) -> f64 {
        match strategy {
            ControlStrategy::Dab => self.dab,
            ControlStrategy::Cost => self.cost,
            ControlStrategy::Stats => self.stats,
            ControlStrategy::Hybrid => {
                let mut best = self.dab;
                let mut best_cost = cost_of(self.dab);
                for candidate in [self.cost, self.stats] {
                    let c = cost_of(candidate);
                    if c < best_cost {
                        best = candidate;
                        best_cost = c;
                    }
                }
                best
            }
        }
    }
}

/// Shared parameters for one thermostat's target pass.
#[derive(Debug, Clone, Copy)]
pub struct TargetPass<'a> {
    pub mode: HvacMode,
    pub setpoint: f64,
    /// Horizon after substitution of the learned default (never negative).
    pub horizon: f64,
    pub strategy: ControlStrategy,
    pub close_inactive: bool,
    pub settings: &'a DabSettings,
}

impl TargetPass<'_> {
    /// Candidates for one vent. `fit` is the vent's regression line, if any.
    #[must_use]
    pub fn candidates(&self, vent: &VentConditions, fit: Option<(f64, f64)>) -> Candidates {
        if self.close_inactive && !vent.active {
            let dab = if self.horizon == 0.0 { 100.0 } else { 0.0 };
            return Candidates {
                dab,
                cost: 0.0,
                stats: 0.0,
            };
        }
        let min_rate = self.settings.min_temp_change_rate;

        let dab = if self.horizon == 0.0 || vent.rate < min_rate {
            100.0
        } else {
            exponential_open_percent(
                vent.temp,
                self.setpoint,
                self.mode,
                vent.rate,
                self.horizon,
                self.settings,
            )
        };
        let cost = if vent.rate < min_rate {
            100.0
        } else {
            linear_open_percent(vent.temp, self.setpoint, vent.rate, self.horizon)
        };
        let stats = regression_open_percent(vent.temp, self.setpoint, self.horizon, fit, cost);
        Candidates { dab, cost, stats }
    }

    /// Final target for one vent under the configured strategy.
    #[must_use]
    pub fn target(&self, vent: &VentConditions, fit: Option<(f64, f64)>) -> f64 {
        if vent.temp_missing && vent.active {
            return 100.0;
        }
        let candidates = self.candidates(vent, fit);
        if self.strategy == ControlStrategy::Hybrid && self.close_inactive && !vent.active {
            return 0.0;
        }
        let current = vent.current_percent.unwrap_or(candidates.dab);
        candidates.select(self.strategy, |candidate| {
            actuation_cost(vent.temp, self.setpoint, vent.rate, self.horizon, candidate, current)
        })
    }

    /// Targets for every vent, keyed by vent id.
    pub fn targets(
        &self,
        vents: &[VentConditions],
        fit: impl Fn(&str) -> Option<(f64, f64)>,
    ) -> BTreeMap<String, f64> {
        vents
            .iter()
            .map(|vent| (vent.vent_id.clone(), self.target(vent, fit(&vent.vent_id))))
            .collect()
    }
}
