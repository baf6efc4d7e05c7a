//! Numeric helpers shared by the balancing pipeline.
//!
//! All temperatures are Celsius. Rates are degrees per minute at 100% open.

use crate::config::DabSettings;
use crate::units::HvacMode;

/// Round to `scale` decimal places.
#[must_use]
pub fn round_big_decimal(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    (value * factor).round() / factor
}

/// Round to the nearest multiple of `granularity`, ties away from zero.
///
/// A zero granularity rounds to the nearest integer.
#[must_use]
pub fn round_to_nearest_multiple(value: f64, granularity: u32) -> i64 {
    if granularity == 0 {
        return value.round() as i64;
    }
    let g = f64::from(granularity);
    let quotient = value / g;
    let rounded = if quotient >= 0.0 {
        (quotient + 0.5).floor()
    } else {
        (quotient - 0.5).ceil()
    };
    (rounded * g) as i64
}

/// Weighted rolling average over a window of `num_entries`.
///
/// With no prior value (or a zero prior) the new value is adopted as-is.
/// `weight` scales how far the average moves toward the new value.
#[must_use]
pub fn rolling_average(current: Option<f64>, new_value: f64, weight: f64, num_entries: u32) -> f64 {
    if num_entries == 0 {
        return 0.0;
    }
    let n = f64::from(num_entries);
    let base = match current {
        Some(value) if value != 0.0 => value,
        _ => new_value,
    };
    let total = base * (n - 1.0) + base + (new_value - base) * weight;
    total / n
}

/// Returns true once `current_temp` has crossed `setpoint` (shifted by `offset`)
/// in the conditioning direction.
#[must_use]
pub fn has_room_reached_setpoint(mode: HvacMode, setpoint: f64, current_temp: f64, offset: f64) -> bool {
    match mode {
        HvacMode::Cooling => current_temp <= setpoint - offset,
        HvacMode::Heating => current_temp >= setpoint + offset,
    }
}

/// Pick the mode whose setpoint is nearer to `temp`. Ties resolve to heating.
#[must_use]
pub fn calculate_hvac_mode(temp: f64, cooling_setpoint: f64, heating_setpoint: f64) -> HvacMode {
    if (temp - cooling_setpoint).abs() < (temp - heating_setpoint).abs() {
        HvacMode::Cooling
    } else {
        HvacMode::Heating
    }
}

/// Returns true when the room is close enough to triggering `mode` that vents
/// should be positioned before the cycle starts.
#[must_use]
pub fn should_pre_adjust(mode: HvacMode, setpoint: f64, current_temp: f64, settings: &DabSettings) -> bool {
    let offset = settings.setpoint_offset;
    let threshold = settings.vent_pre_adjust_threshold;
    match mode {
        HvacMode::Cooling => current_temp + offset - threshold >= setpoint,
        HvacMode::Heating => current_temp - offset + threshold <= setpoint,
    }
}

/// Absolute distance still to travel toward the setpoint; zero once crossed.
#[must_use]
pub fn temp_error(mode: HvacMode, setpoint: f64, temp: f64) -> f64 {
    match mode {
        HvacMode::Heating => (setpoint - temp).max(0.0),
        HvacMode::Cooling => (temp - setpoint).max(0.0),
    }
}

/// Infer a 100%-open equivalent rate from one cycle's observation.
///
/// Returns `None` when the observation carries no usable signal: the cycle was
/// too short, the vent was closed, the change was undetectable at a small
/// opening, or the normalized rate exceeds the configured ceiling.
#[must_use]
pub fn calculate_room_change_rate(
    start_temp: f64,
    current_temp: f64,
    total_minutes: f64,
    percent_open: u8,
    current_rate: f64,
    settings: &DabSettings,
) -> Option<f64> {
    if total_minutes < settings.min_minutes_to_setpoint
        || total_minutes < settings.min_runtime_for_rate_calc
        || percent_open == 0
    {
        return None;
    }

    let mut diff = (start_temp - current_temp).abs();
    if diff < settings.min_detectable_temp_change {
        return (percent_open >= 30).then_some(settings.min_temp_change_rate);
    }
    if diff < settings.temp_sensor_accuracy {
        diff = diff.max(settings.min_detectable_temp_change);
    }

    let rate = diff / total_minutes;
    let p_open = f64::from(percent_open) / 100.0;
    let max_rate = rate.max(current_rate);
    let approx = if max_rate == 0.0 {
        0.0
    } else {
        (rate / max_rate) / p_open
    };

    if approx > settings.max_temp_change_rate {
        return None;
    }
    Some(approx.max(settings.min_temp_change_rate))
}
