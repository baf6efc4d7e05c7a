//! Externally supplied sensor state for one poll.
//!
//! A [`Snapshot`] is everything the engine is allowed to know about the
//! building at one instant: thermostat attributes, vent positions, room
//! temperatures and occupancy, and any dedicated temperature sensors.
//! Readings may be missing; the engine treats absence per vent, never as a
//! reason to abort a pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::VentAssignment;
use crate::units::{TemperatureUnit, ThermostatMode};

/// Raw thermostat attributes, in the thermostat's own unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatReading {
    /// Raw `hvac_action` attribute, when the thermostat reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hvac_action: Option<String>,
    pub mode: ThermostatMode,
    pub unit: TemperatureUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_temperature: Option<f64>,
    /// Single setpoint (`heat`/`cool` modes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    /// Heating setpoint in dual-setpoint modes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_low: Option<f64>,
    /// Cooling setpoint in dual-setpoint modes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_high: Option<f64>,
}

impl ThermostatReading {
    /// A thermostat in `mode` reporting `action`, with a single setpoint (Celsius).
    #[must_use]
    pub fn new(mode: ThermostatMode, action: Option<&str>, current: f64, target: f64) -> Self {
        Self {
            hvac_action: action.map(str::to_string),
            mode,
            current_temperature: Some(current),
            target: Some(target),
            ..Self::default()
        }
    }

    /// Heating thermostat actively running.
    #[must_use]
    pub fn heating(current: f64, target: f64) -> Self {
        Self::new(ThermostatMode::Heat, Some("heating"), current, target)
    }

    /// Cooling thermostat actively running.
    #[must_use]
    pub fn cooling(current: f64, target: f64) -> Self {
        Self::new(ThermostatMode::Cool, Some("cooling"), current, target)
    }

    /// Same thermostat, now reporting `idle`.
    #[must_use]
    pub fn idle(mut self) -> Self {
        self.hvac_action = Some("idle".to_string());
        self
    }

    #[must_use]
    pub fn with_unit(mut self, unit: TemperatureUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Current temperature in Celsius.
    #[must_use]
    pub fn current_celsius(&self) -> Option<f64> {
        self.current_temperature.map(|t| self.unit.to_celsius(t))
    }
}

/// One vent's reported state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VentReading {
    /// Reported opening. `None` means the vent is unavailable this poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_open: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// One room (zone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

impl Default for RoomReading {
    fn default() -> Self {
        Self {
            name: None,
            active: true,
            temperature_c: None,
        }
    }
}

/// A dedicated temperature sensor overriding a room's own reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub unit: TemperatureUnit,
}

/// Building state at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub thermostats: BTreeMap<String, ThermostatReading>,
    pub vents: BTreeMap<String, VentReading>,
    pub rooms: BTreeMap<String, RoomReading>,
    pub sensors: BTreeMap<String, SensorReading>,
}

impl Snapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_thermostat(mut self, id: impl Into<String>, reading: ThermostatReading) -> Self {
        self.thermostats.insert(id.into(), reading);
        self
    }

    /// Add an active room with a Celsius temperature.
    #[must_use]
    pub fn with_room(mut self, id: impl Into<String>, name: impl Into<String>, temperature_c: Option<f64>) -> Self {
        self.rooms.insert(
            id.into(),
            RoomReading {
                name: Some(name.into()),
                active: true,
                temperature_c,
            },
        );
        self
    }

    #[must_use]
    pub fn with_vent(mut self, id: impl Into<String>, room_id: impl Into<String>, percent_open: Option<u8>) -> Self {
        self.vents.insert(
            id.into(),
            VentReading {
                percent_open,
                room_id: Some(room_id.into()),
            },
        );
        self
    }

    #[must_use]
    pub fn with_sensor(mut self, id: impl Into<String>, value: f64, unit: TemperatureUnit) -> Self {
        self.sensors.insert(
            id.into(),
            SensorReading {
                value: Some(value),
                unit,
            },
        );
        self
    }

    /// Mark a room active or inactive.
    pub fn set_room_active(&mut self, room_id: &str, active: bool) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.active = active;
        }
    }

    /// Update a room temperature in place.
    pub fn set_room_temperature(&mut self, room_id: &str, temperature_c: Option<f64>) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.temperature_c = temperature_c;
        }
    }

    /// Update a vent position in place.
    pub fn set_vent_percent(&mut self, vent_id: &str, percent_open: Option<u8>) {
        if let Some(vent) = self.vents.get_mut(vent_id) {
            vent.percent_open = percent_open;
        }
    }

    #[must_use]
    pub fn vent_percent(&self, vent_id: &str) -> Option<u8> {
        self.vents.get(vent_id).and_then(|v| v.percent_open)
    }

    /// The room a vent serves, with its id.
    #[must_use]
    pub fn room_for_vent(&self, vent_id: &str) -> Option<(&str, &RoomReading)> {
        let room_id = self.vents.get(vent_id)?.room_id.as_deref()?;
        self.rooms.get_key_value(room_id).map(|(id, room)| (id.as_str(), room))
    }

    #[must_use]
    pub fn room_name(&self, vent_id: &str) -> Option<&str> {
        self.room_for_vent(vent_id).and_then(|(_, room)| room.name.as_deref())
    }

    /// Rooms without a reading count as active.
    #[must_use]
    pub fn room_active(&self, vent_id: &str) -> bool {
        self.room_for_vent(vent_id).is_none_or(|(_, room)| room.active)
    }

    /// Room temperature in Celsius for a vent. A dedicated sensor wins when it
    /// has a value; otherwise the room's own reading is used.
    #[must_use]
    pub fn room_temperature(&self, vent_id: &str, assignment: Option<&VentAssignment>) -> Option<f64> {
        let sensor = assignment
            .and_then(|a| a.temp_sensor_id.as_deref())
            .and_then(|id| self.sensors.get(id))
            .and_then(|s| s.value.map(|v| s.unit.to_celsius(v)));
        sensor.or_else(|| self.room_for_vent(vent_id).and_then(|(_, room)| room.temperature_c))
    }
}
