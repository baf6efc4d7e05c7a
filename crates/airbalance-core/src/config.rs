//! Engine configuration.
//!
//! Two layers:
//! - [`DabSettings`]: algorithm constants (rate bounds, airflow floor, model
//!   coefficients). These are empirically tuned and rarely changed.
//! - [`EngineConfig`]: installation options (strategy, granularity, debounce,
//!   vent-to-thermostat assignments). Loaded from JSON; every field defaults.
//!
//! The control strategy may be overridden through the `AIRBALANCE_STRATEGY`
//! environment variable when the caller opts in via
//! [`EngineConfig::with_env_overrides`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding the configured control strategy.
pub const STRATEGY_ENV: &str = "AIRBALANCE_STRATEGY";

/// Algorithm constants for DAB calculations (Celsius based).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DabSettings {
    /// Ceiling for an inferred rate (°/min at 100% open). Larger samples are rejected.
    pub max_temp_change_rate: f64,
    /// Floor rate; also the "minimum detectable" rate below which a vent is opened fully.
    pub min_temp_change_rate: f64,
    /// Offset applied to thermostat setpoints (cooling lowers, heating raises).
    pub setpoint_offset: f64,
    pub vent_pre_adjust_threshold: f64,
    /// Default learned cycle length for a thermostat with no history.
    pub max_minutes_to_setpoint: f64,
    pub min_minutes_to_setpoint: f64,
    pub min_runtime_for_rate_calc: f64,
    pub temp_sensor_accuracy: f64,
    pub min_detectable_temp_change: f64,
    /// Floor for the mean open percentage across all vents on one duct system.
    pub min_combined_vent_flow: f64,
    pub increment_percentage: f64,
    pub max_standard_vents: u32,
    pub max_iterations: u32,
    pub standard_vent_default_open: f64,
    pub temp_boundary_adjustment: f64,
    /// Band used to infer heating/cooling when the thermostat does not report it.
    pub thermostat_hysteresis: f64,
    pub base_const: f64,
    pub exp_const: f64,
    /// Delay between HVAC turning off and the finalize pass.
    pub finalize_settle_secs: u64,
}

impl Default for DabSettings {
    fn default() -> Self {
        Self {
            max_temp_change_rate: 1.5,
            min_temp_change_rate: 0.001,
            setpoint_offset: 0.7,
            vent_pre_adjust_threshold: 0.2,
            max_minutes_to_setpoint: 60.0,
            min_minutes_to_setpoint: 1.0,
            min_runtime_for_rate_calc: 5.0,
            temp_sensor_accuracy: 0.5,
            min_detectable_temp_change: 0.1,
            min_combined_vent_flow: 30.0,
            increment_percentage: 1.5,
            max_standard_vents: 15,
            max_iterations: 500,
            standard_vent_default_open: 50.0,
            temp_boundary_adjustment: 0.1,
            thermostat_hysteresis: 0.6,
            base_const: 0.0991,
            exp_const: 2.3,
            finalize_settle_secs: 30,
        }
    }
}

/// Closed set of target-computation strategies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ControlStrategy {
    /// Exponential model only.
    Dab,
    /// Linear target-rate model only.
    Cost,
    /// Regression model only (falls back to linear when underdetermined).
    Stats,
    /// Lowest actuation cost among the three models, per vent.
    #[default]
    Hybrid,
}

impl ControlStrategy {
    /// Parse from string (case-insensitive). Unknown names select `Hybrid`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "dab" | "exponential" | "exp" => Self::Dab,
            "cost" | "linear" => Self::Cost,
            "stats" | "regression" | "ols" => Self::Stats,
            _ => Self::Hybrid,
        }
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dab => "dab",
            Self::Cost => "cost",
            Self::Stats => "stats",
            Self::Hybrid => "hybrid",
        }
    }
}

impl From<String> for ControlStrategy {
    fn from(value: String) -> Self {
        Self::from_str_loose(&value)
    }
}

impl From<ControlStrategy> for String {
    fn from(value: ControlStrategy) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ControlStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which thermostat serves a vent and which sensor, if any, overrides its room temperature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VentAssignment {
    pub thermostat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_sensor_id: Option<String>,
}

/// Installation-level options. Static for the duration of one control pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub control_strategy: ControlStrategy,
    /// Vent positions are rounded to multiples of this many percent.
    pub vent_granularity: u32,
    pub close_inactive_rooms: bool,
    pub min_adjustment_percent: u32,
    pub min_adjustment_interval_minutes: u32,
    /// Temperature error (°C) at or above which debouncing is bypassed.
    pub temp_error_override: f64,
    /// Seed efficiency for vents without a learned rate (0-100).
    pub initial_efficiency_percent: f64,
    pub log_efficiency_changes: bool,
    pub poll_interval_active_minutes: u32,
    pub poll_interval_idle_minutes: u32,
    pub command_timeout_ms: u64,
    /// Deadline for one snapshot fetch.
    pub fetch_timeout_ms: u64,
    pub max_concurrent_commands: usize,
    pub conventional_vents_by_thermostat: BTreeMap<String, u32>,
    pub vent_assignments: BTreeMap<String, VentAssignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure_id: Option<String>,
    pub settings: DabSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_strategy: ControlStrategy::Hybrid,
            vent_granularity: 5,
            close_inactive_rooms: true,
            min_adjustment_percent: 10,
            min_adjustment_interval_minutes: 30,
            temp_error_override: 0.6,
            initial_efficiency_percent: 50.0,
            log_efficiency_changes: true,
            poll_interval_active_minutes: 3,
            poll_interval_idle_minutes: 10,
            command_timeout_ms: 10_000,
            fetch_timeout_ms: 30_000,
            max_concurrent_commands: 6,
            conventional_vents_by_thermostat: BTreeMap::new(),
            vent_assignments: BTreeMap::new(),
            structure_id: None,
            settings: DabSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Apply `AIRBALANCE_STRATEGY` if it is set.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(STRATEGY_ENV) {
            self.control_strategy = ControlStrategy::from_str_loose(&raw);
        }
        self
    }

    /// Assign a vent to a thermostat (builder style, mostly for tests and scenarios).
    #[must_use]
    pub fn with_vent(mut self, vent_id: impl Into<String>, thermostat_id: impl Into<String>) -> Self {
        self.vent_assignments.insert(
            vent_id.into(),
            VentAssignment {
                thermostat_id: thermostat_id.into(),
                temp_sensor_id: None,
            },
        );
        self
    }

    /// Vent ids grouped by serving thermostat, both levels sorted.
    #[must_use]
    pub fn vents_by_thermostat(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (vent_id, assignment) in &self.vent_assignments {
            if assignment.thermostat_id.is_empty() {
                continue;
            }
            grouped
                .entry(assignment.thermostat_id.clone())
                .or_default()
                .push(vent_id.clone());
        }
        grouped
    }

    /// Unmanaged vents sharing the thermostat's duct system, capped at `max_standard_vents`.
    #[must_use]
    pub fn conventional_vents(&self, thermostat_id: &str) -> u32 {
        self.conventional_vents_by_thermostat
            .get(thermostat_id)
            .copied()
            .unwrap_or(0)
            .min(self.settings.max_standard_vents)
    }

    /// Seed rate derived from `initial_efficiency_percent`.
    #[must_use]
    pub fn initial_rate(&self) -> f64 {
        clamp_efficiency_percent(self.initial_efficiency_percent) / 100.0
    }
}

/// Clamp an efficiency percentage into `[0, 100]`; NaN maps to 0.
#[must_use]
pub fn clamp_efficiency_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strategies() {
        assert_eq!(ControlStrategy::from_str_loose("dab"), ControlStrategy::Dab);
        assert_eq!(ControlStrategy::from_str_loose("COST"), ControlStrategy::Cost);
        assert_eq!(ControlStrategy::from_str_loose("linear"), ControlStrategy::Cost);
        assert_eq!(ControlStrategy::from_str_loose("stats"), ControlStrategy::Stats);
        assert_eq!(ControlStrategy::from_str_loose("hybrid"), ControlStrategy::Hybrid);
        assert_eq!(ControlStrategy::from_str_loose("bogus"), ControlStrategy::Hybrid);
    }

    #[test]
    fn default_strategy_is_hybrid() {
        assert_eq!(ControlStrategy::default(), ControlStrategy::Hybrid);
        assert_eq!(EngineConfig::default().control_strategy, ControlStrategy::Hybrid);
    }

    #[test]
    fn config_json_defaults_every_field() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.settings.max_iterations, 500);
        assert_eq!(config.vent_granularity, 5);
    }

    #[test]
    fn config_json_lenient_strategy_and_assignments() {
        let json = r#"{
            "control_strategy": "Regression",
            "vent_assignments": {
                "v1": {"thermostat_id": "t1"},
                "v2": {"thermostat_id": "t1", "temp_sensor_id": "s2"},
                "v3": {"thermostat_id": "t2"}
            },
            "conventional_vents_by_thermostat": {"t1": 40}
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.control_strategy, ControlStrategy::Stats);
        let grouped = config.vents_by_thermostat();
        assert_eq!(grouped["t1"], vec!["v1".to_string(), "v2".to_string()]);
        assert_eq!(grouped["t2"], vec!["v3".to_string()]);
        assert_eq!(config.conventional_vents("t1"), 15);
        assert_eq!(config.conventional_vents("t2"), 0);
    }

    #[test]
    fn strategy_serializes_as_lowercase_label() {
        let json = serde_json::to_string(&ControlStrategy::Stats).unwrap();
        assert_eq!(json, "\"stats\"");
    }

    #[test]
    fn initial_rate_is_clamped() {
        let mut config = EngineConfig::default();
        assert!((config.initial_rate() - 0.5).abs() < 1e-12);
        config.initial_efficiency_percent = 250.0;
        assert!((config.initial_rate() - 1.0).abs() < 1e-12);
        config.initial_efficiency_percent = -3.0;
        assert_eq!(config.initial_rate(), 0.0);
        assert_eq!(clamp_efficiency_percent(f64::NAN), 0.0);
    }
}
