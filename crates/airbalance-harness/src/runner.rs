//! Test execution engine.
//!
//! Each fixture case names a pure engine function and its inputs; the runner
//! evaluates it with [`DabSettings`] (defaults, optionally overridden by an
//! inline `settings` object) and compares the result to the expected value.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use airbalance_core::airflow::AirflowRedistributor;
use airbalance_core::config::DabSettings;
use airbalance_core::cost::{exponential_open_percent, linear_open_percent};
use airbalance_core::gate::{AdjustmentGate, GateDecision, VentRuntimeState};
use airbalance_core::math;
use airbalance_core::{EngineConfig, HvacMode, Timestamp};

use crate::fixtures::FixtureSet;
use crate::verify::VerificationResult;

/// Runs a fixture set and collects verification results.
pub struct TestRunner {
    /// Name of the verification campaign.
    pub campaign: String,
}

impl TestRunner {
    #[must_use]
    pub fn new(campaign: impl Into<String>) -> Self {
        Self {
            campaign: campaign.into(),
        }
    }

    /// Run all fixtures in a set and return results.
    pub fn run(&self, fixture_set: &FixtureSet) -> Vec<VerificationResult> {
        fixture_set
            .cases
            .iter()
            .map(|case| {
                let (actual, diff) = match execute_case(&case.function, &case.inputs) {
                    Ok(actual) => {
                        let diff = compare(&case.expected_output, &actual, case.tolerance, "$").err();
                        (actual, diff)
                    }
                    Err(err) => (Value::String(format!("error:{err}")), Some(err)),
                };
                VerificationResult {
                    family: fixture_set.family.clone(),
                    case_name: case.name.clone(),
                    function: case.function.clone(),
                    passed: diff.is_none(),
                    expected: case.expected_output.clone(),
                    actual,
                    diff,
                }
            })
            .collect()
    }

    /// Run several sets, in order.
    pub fn run_all(&self, sets: &[FixtureSet]) -> Vec<VerificationResult> {
        sets.iter().flat_map(|set| self.run(set)).collect()
    }
}

/// Structural comparison with a numeric tolerance. Extra keys in `actual`
/// objects are ignored.
fn compare(expected: &Value, actual: &Value, tolerance: f64, at: &str) -> Result<(), String> {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => {
            let (e, a) = (e.as_f64().unwrap_or(f64::NAN), a.as_f64().unwrap_or(f64::NAN));
            if (e - a).abs() <= tolerance {
                Ok(())
            } else {
                Err(format!("{at}: expected {e}, got {a} (tolerance {tolerance})"))
            }
        }
        (Value::Object(e), Value::Object(a)) => {
            for (key, value) in e {
                let path = format!("{at}.{key}");
                let other = a.get(key).ok_or_else(|| format!("{path}: missing"))?;
                compare(value, other, tolerance, &path)?;
            }
            Ok(())
        }
        (Value::Array(e), Value::Array(a)) => {
            if e.len() != a.len() {
                return Err(format!("{at}: expected {} items, got {}", e.len(), a.len()));
            }
            for (i, (e, a)) in e.iter().zip(a).enumerate() {
                compare(e, a, tolerance, &format!("{at}[{i}]"))?;
            }
            Ok(())
        }
        _ if expected == actual => Ok(()),
        _ => Err(format!("{at}: expected {expected}, got {actual}")),
    }
}

fn parse<T: DeserializeOwned>(inputs: &Value) -> Result<T, String> {
    T::deserialize(inputs).map_err(|e| format!("bad inputs: {e}"))
}

fn settings(inputs: &Value) -> Result<DabSettings, String> {
    match inputs.get("settings") {
        Some(value) => parse(value),
        None => Ok(DabSettings::default()),
    }
}

#[derive(Deserialize)]
struct ScaledValue {
    value: f64,
    scale: u32,
}

#[derive(Deserialize)]
struct MultipleInput {
    value: f64,
    granularity: u32,
}

#[derive(Deserialize)]
struct RollingInput {
    current: Option<f64>,
    new_value: f64,
    weight: f64,
    num_entries: u32,
}

#[derive(Deserialize)]
struct SetpointInput {
    mode: HvacMode,
    setpoint: f64,
    temp: f64,
    #[serde(default)]
    offset: f64,
}

#[derive(Deserialize)]
struct ModeInput {
    temp: f64,
    cooling_setpoint: f64,
    heating_setpoint: f64,
}

#[derive(Deserialize)]
struct ChangeRateInput {
    start_temp: f64,
    current_temp: f64,
    minutes: f64,
    percent_open: u8,
    current_rate: f64,
}

#[derive(Deserialize)]
struct OpenPercentInput {
    temp: f64,
    setpoint: f64,
    mode: HvacMode,
    rate: f64,
    horizon: f64,
}

#[derive(Deserialize)]
struct RedistributeInput {
    mode: HvacMode,
    temps: Vec<(String, f64)>,
    targets: BTreeMap<String, f64>,
    #[serde(default)]
    conventional: u32,
}

#[derive(Deserialize)]
struct GateInput {
    target: f64,
    current: u8,
    temp_error: f64,
    #[serde(default = "active_default")]
    room_active: bool,
    /// Minutes since this vent was last commanded, if ever.
    last_commanded_minutes_ago: Option<u64>,
    #[serde(default)]
    config: Option<Value>,
}

fn active_default() -> bool {
    true
}

/// Evaluate one named function.
pub fn execute_case(function: &str, inputs: &Value) -> Result<Value, String> {
    let value = match function {
        "round_big_decimal" => {
            let i: ScaledValue = parse(inputs)?;
            json!(math::round_big_decimal(i.value, i.scale))
        }
        "round_to_nearest_multiple" => {
            let i: MultipleInput = parse(inputs)?;
            json!(math::round_to_nearest_multiple(i.value, i.granularity))
        }
        "rolling_average" => {
            let i: RollingInput = parse(inputs)?;
            json!(math::rolling_average(i.current, i.new_value, i.weight, i.num_entries))
        }
        "has_room_reached_setpoint" => {
            let i: SetpointInput = parse(inputs)?;
            json!(math::has_room_reached_setpoint(i.mode, i.setpoint, i.temp, i.offset))
        }
        "should_pre_adjust" => {
            let i: SetpointInput = parse(inputs)?;
            json!(math::should_pre_adjust(i.mode, i.setpoint, i.temp, &settings(inputs)?))
        }
        "temp_error" => {
            let i: SetpointInput = parse(inputs)?;
            json!(math::temp_error(i.mode, i.setpoint, i.temp))
        }
        "calculate_hvac_mode" => {
            let i: ModeInput = parse(inputs)?;
            json!(math::calculate_hvac_mode(i.temp, i.cooling_setpoint, i.heating_setpoint).as_str())
        }
        "calculate_room_change_rate" => {
            let i: ChangeRateInput = parse(inputs)?;
            let rate = math::calculate_room_change_rate(
                i.start_temp,
                i.current_temp,
                i.minutes,
                i.percent_open,
                i.current_rate,
                &settings(inputs)?,
            );
            json!(rate)
        }
        "exponential_open_percent" => {
            let i: OpenPercentInput = parse(inputs)?;
            json!(exponential_open_percent(
                i.temp,
                i.setpoint,
                i.mode,
                i.rate,
                i.horizon,
                &settings(inputs)?
            ))
        }
        "linear_open_percent" => {
            let i: OpenPercentInput = parse(inputs)?;
            json!(linear_open_percent(i.temp, i.setpoint, i.rate, i.horizon))
        }
        "redistribute" => {
            let i: RedistributeInput = parse(inputs)?;
            let s = settings(inputs)?;
            let temps: Vec<(&str, f64)> = i.temps.iter().map(|(id, t)| (id.as_str(), *t)).collect();
            let mut targets = i.targets;
            let report = AirflowRedistributor::new(&s).redistribute(&temps, i.mode, &mut targets, i.conventional);
            json!({ "targets": targets, "iterations": report.iterations, "added": report.added })
        }
        "gate" => {
            let i: GateInput = parse(inputs)?;
            let config: EngineConfig = match &i.config {
                Some(value) => parse(value)?,
                None => EngineConfig::default(),
            };
            let now = Timestamp::from_secs(86_400);
            let runtime = i.last_commanded_minutes_ago.map(|ago| {
                let mut state = VentRuntimeState::default();
                state.record_command(i.current, Timestamp(now.as_millis().saturating_sub(ago * 60_000)));
                state
            });
            let decision = AdjustmentGate::from_config(&config).evaluate(
                i.target,
                i.current,
                i.temp_error,
                i.room_active,
                runtime.as_ref(),
                now,
            );
            match decision {
                GateDecision::Unchanged { percent } => json!(format!("unchanged:{percent}")),
                GateDecision::Suppressed { percent, reason } => {
                    json!(format!("suppressed:{percent}:{}", reason.as_str()))
                }
                GateDecision::Command { percent, .. } => json!(format!("command:{percent}")),
            }
        }
        other => return Err(format!("unsupported function {other}")),
    };
    Ok(value)
}
