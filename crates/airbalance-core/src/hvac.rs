//! Thermostat interpretation: what it is doing, what it is aiming for, and
//! what it is about to do.

use crate::config::DabSettings;
use crate::math::calculate_hvac_mode;
use crate::snapshot::ThermostatReading;
use crate::units::{HvacAction, HvacMode, ThermostatMode};

/// Resolve the thermostat's current activity.
///
/// A raw `heating`/`cooling` action wins. Otherwise activity is inferred from
/// the operating mode and the current temperature against the setpoint(s)
/// widened by `hysteresis`. Unavailable thermostats and thermostats missing
/// the readings needed for inference resolve to `Unknown`.
#[must_use]
pub fn resolve_action(reading: &ThermostatReading, hysteresis: f64) -> HvacAction {
    if reading.mode == ThermostatMode::Unavailable {
        return HvacAction::Unknown;
    }
    if let Some(raw) = reading.hvac_action.as_deref() {
        let action = HvacAction::from_str_loose(raw);
        if action.is_active() {
            return action;
        }
    }

    let unit = reading.unit;
    let Some(current) = reading.current_celsius() else {
        return HvacAction::Unknown;
    };
    let target = reading.target.map(|t| unit.to_celsius(t));
    let low = reading.target_low.map(|t| unit.to_celsius(t));
    let high = reading.target_high.map(|t| unit.to_celsius(t));

    match reading.mode {
        ThermostatMode::Heat => match target.or(low) {
            Some(t) if current <= t - hysteresis => HvacAction::Heating,
            Some(_) => HvacAction::Idle,
            None => HvacAction::Unknown,
        },
        ThermostatMode::Cool => match target.or(high) {
            Some(t) if current >= t + hysteresis => HvacAction::Cooling,
            Some(_) => HvacAction::Idle,
            None => HvacAction::Unknown,
        },
        ThermostatMode::HeatCool | ThermostatMode::Auto => match (low, high) {
            (Some(low), _) if current <= low - hysteresis => HvacAction::Heating,
            (_, Some(high)) if current >= high + hysteresis => HvacAction::Cooling,
            (Some(_), Some(_)) => HvacAction::Idle,
            _ => HvacAction::Unknown,
        },
        ThermostatMode::Off | ThermostatMode::Unavailable => HvacAction::Idle,
    }
}

/// Effective Celsius setpoint for `mode`, shifted by the setpoint offset
/// (cooling aims lower, heating aims higher).
#[must_use]
pub fn resolve_setpoint(reading: &ThermostatReading, mode: HvacMode, settings: &DabSettings) -> Option<f64> {
    let (raw, offset) = match mode {
        HvacMode::Cooling => (reading.target_high.or(reading.target), -settings.setpoint_offset),
        HvacMode::Heating => (reading.target_low.or(reading.target), settings.setpoint_offset),
    };
    raw.map(|t| reading.unit.to_celsius(t) + offset)
}

/// Mode the thermostat will run next if it starts conditioning.
///
/// Dual-setpoint thermostats pick whichever setpoint is nearer the current
/// temperature; both setpoints must be known.
#[must_use]
pub fn predict_mode(reading: &ThermostatReading) -> Option<HvacMode> {
    match reading.mode {
        ThermostatMode::Cool => Some(HvacMode::Cooling),
        ThermostatMode::Heat => Some(HvacMode::Heating),
        ThermostatMode::HeatCool | ThermostatMode::Auto => {
            let unit = reading.unit;
            let current = reading.current_celsius()?;
            let cooling = unit.to_celsius(reading.target_high?);
            let heating = unit.to_celsius(reading.target_low?);
            Some(calculate_hvac_mode(current, cooling, heating))
        }
        ThermostatMode::Off | ThermostatMode::Unavailable => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::TemperatureUnit;

    fn reading(mode: ThermostatMode, current: f64) -> ThermostatReading {
        ThermostatReading {
            mode,
            current_temperature: Some(current),
            ..ThermostatReading::default()
        }
    }

    #[test]
    fn raw_action_wins() {
        let mut r = reading(ThermostatMode::Cool, 10.0);
        r.hvac_action = Some("heating".into());
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Heating);
    }

    #[test]
    fn unavailable_resolves_to_unknown() {
        let mut r = reading(ThermostatMode::Unavailable, 20.0);
        r.hvac_action = Some("heating".into());
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Unknown);
    }

    #[test]
    fn heat_mode_uses_hysteresis() {
        let mut r = reading(ThermostatMode::Heat, 20.3);
        r.target = Some(21.0);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Heating);
        r.current_temperature = Some(20.5);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Idle);
        r.target = None;
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Unknown);
        r.target_low = Some(22.0);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Heating);
    }

    #[test]
    fn cool_mode_uses_hysteresis() {
        let mut r = reading(ThermostatMode::Cool, 25.0);
        r.target = Some(24.0);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Cooling);
        r.current_temperature = Some(24.5);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Idle);
    }

    #[test]
    fn dual_setpoint_modes() {
        let mut r = reading(ThermostatMode::Auto, 19.0);
        r.target_low = Some(20.0);
        r.target_high = Some(25.0);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Heating);
        r.current_temperature = Some(26.0);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Cooling);
        r.current_temperature = Some(22.0);
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Idle);
        r.target_high = None;
        assert_eq!(resolve_action(&r, 0.6), HvacAction::Unknown);
    }

    #[test]
    fn setpoint_offsets_and_units() {
        let s = DabSettings::default();
        let mut r = reading(ThermostatMode::HeatCool, 22.0);
        r.target = Some(22.0);
        r.target_high = Some(25.0);
        assert!((resolve_setpoint(&r, HvacMode::Cooling, &s).unwrap() - 24.3).abs() < 1e-9);
        assert!((resolve_setpoint(&r, HvacMode::Heating, &s).unwrap() - 22.7).abs() < 1e-9);

        let f = ThermostatReading {
            target: Some(77.0),
            ..ThermostatReading::default()
        }
        .with_unit(TemperatureUnit::Fahrenheit);
        assert!((resolve_setpoint(&f, HvacMode::Heating, &s).unwrap() - 25.7).abs() < 1e-9);
        assert_eq!(resolve_setpoint(&ThermostatReading::default(), HvacMode::Heating, &s), None);
    }

    #[test]
    fn predicted_modes() {
        assert_eq!(predict_mode(&reading(ThermostatMode::Cool, 20.0)), Some(HvacMode::Cooling));
        assert_eq!(predict_mode(&reading(ThermostatMode::Heat, 20.0)), Some(HvacMode::Heating));
        assert_eq!(predict_mode(&reading(ThermostatMode::Off, 20.0)), None);
        let mut r = reading(ThermostatMode::Auto, 24.0);
        assert_eq!(predict_mode(&r), None);
        r.target_low = Some(19.0);
        r.target_high = Some(25.0);
        assert_eq!(predict_mode(&r), Some(HvacMode::Cooling));
    }
}
