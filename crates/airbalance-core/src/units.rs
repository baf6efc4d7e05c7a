//! Clock, temperature-unit and HVAC vocabulary shared by every module.
//!
//! The engine never reads the wall clock. Every operation takes a
//! [`Timestamp`] supplied by the caller so that cycle timing, debounce
//! windows and the finalize settle delay are deterministic under test.

use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: f64 = 60_000.0;

/// Milliseconds since the Unix epoch, as seen by the control loop's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Build a timestamp from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Current wall-clock time. Only the control loop driver calls this.
    #[must_use]
    pub fn now() -> Self {
        let duration = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Raw milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Timestamp shifted forward by `ms` milliseconds.
    #[must_use]
    pub const fn plus_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Timestamp shifted forward by whole minutes.
    #[must_use]
    pub const fn plus_minutes(self, minutes: u64) -> Self {
        self.plus_millis(minutes.saturating_mul(60_000))
    }

    /// Fractional minutes elapsed since `earlier` (zero if `earlier` is later).
    #[must_use]
    pub fn minutes_since(self, earlier: Timestamp) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 / MS_PER_MINUTE
    }

    /// RFC-3339 UTC rendering with millisecond precision.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        let secs = self.0 / 1000;
        let millis = self.0 % 1000;
        let days = (secs / 86_400) as i64;
        let rem = secs % 86_400;
        let (year, month, day) = civil_from_days(days);
        format!(
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
            rem / 3600,
            (rem % 3600) / 60,
            rem % 60,
        )
    }
}

// Howard Hinnant's days-to-civil conversion (proleptic Gregorian).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// The conditioning direction of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Cooling,
    Heating,
}

impl HvacMode {
    /// Stable lowercase label used in logs and persisted maps.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cooling => "cooling",
            Self::Heating => "heating",
        }
    }

    /// Both modes, cooling first.
    #[must_use]
    pub const fn all() -> [HvacMode; 2] {
        [Self::Cooling, Self::Heating]
    }
}

/// Resolved thermostat activity for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Heating,
    Cooling,
    Idle,
    Unknown,
}

impl HvacAction {
    /// The conditioning mode when the thermostat is actively running.
    #[must_use]
    pub const fn mode(self) -> Option<HvacMode> {
        match self {
            Self::Heating => Some(HvacMode::Heating),
            Self::Cooling => Some(HvacMode::Cooling),
            Self::Idle | Self::Unknown => None,
        }
    }

    /// Returns true while the thermostat is heating or cooling.
    #[must_use]
    pub const fn is_active(self) -> bool {
        self.mode().is_some()
    }

    /// Parse the raw action attribute (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "heating" | "heat" => Self::Heating,
            "cooling" | "cool" => Self::Cooling,
            "idle" | "off" | "fan" | "drying" => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

impl From<HvacMode> for HvacAction {
    fn from(mode: HvacMode) -> Self {
        match mode {
            HvacMode::Cooling => Self::Cooling,
            HvacMode::Heating => Self::Heating,
        }
    }
}

/// The operating mode a thermostat has been set to (not what it is doing).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatMode {
    #[default]
    Off,
    Heat,
    Cool,
    HeatCool,
    Auto,
    Unavailable,
}

impl ThermostatMode {
    /// Parse a thermostat mode string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "heat" => Self::Heat,
            "cool" => Self::Cool,
            "heat_cool" | "heatcool" => Self::HeatCool,
            "auto" => Self::Auto,
            "unavailable" | "unknown" => Self::Unavailable,
            _ => Self::Off,
        }
    }

    /// Dual-setpoint modes.
    #[must_use]
    pub const fn is_dual(self) -> bool {
        matches!(self, Self::HeatCool | Self::Auto)
    }
}

/// Unit attached to a raw temperature reading.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Parse a unit label. Anything not recognised as Fahrenheit is Celsius.
    #[must_use]
    pub fn from_label(label: Option<&str>) -> Self {
        if label.is_some_and(is_fahrenheit_unit) {
            Self::Fahrenheit
        } else {
            Self::Celsius
        }
    }

    /// Convert a reading in this unit to Celsius.
    #[must_use]
    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            Self::Celsius => value,
            Self::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }
}

/// Returns true if `unit` names Fahrenheit (`F`, `°F`, `degF`, `fahrenheit`).
#[must_use]
pub fn is_fahrenheit_unit(unit: &str) -> bool {
    let normalized: String = unit
        .chars()
        .filter(char::is_ascii)
        .collect::<String>()
        .to_ascii_lowercase();
    matches!(normalized.trim(), "f" | "degf" | "fahrenheit")
}
