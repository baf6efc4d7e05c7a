//! Efficiency export and import.
//!
//! The export is a camelCase JSON document compatible with the hub-side
//! format (`exportMetadata` + `efficiencyData`). Import validates the whole
//! payload before touching the model: a structural problem or a non-numeric
//! rate rejects everything, while entries that simply do not match a known
//! vent are counted and skipped.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ImportError;
use crate::rate_model::RateModel;
use crate::snapshot::Snapshot;
use crate::units::{HvacMode, Timestamp};

pub const EXPORT_FORMAT_VERSION: &str = "ha-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub version: String,
    pub export_date: String,
    pub structure_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRates {
    pub max_cooling_rate: f64,
    pub max_heating_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEfficiency {
    pub room_id: Option<String>,
    pub room_name: Option<String>,
    pub vent_id: String,
    pub cooling_rate: f64,
    pub heating_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyData {
    pub global_rates: GlobalRates,
    pub room_efficiencies: Vec<RoomEfficiency>,
}

/// Serializable snapshot of every learned rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyExport {
    pub export_metadata: ExportMetadata,
    pub efficiency_data: EfficiencyData,
}

impl EfficiencyExport {
    /// Build an export from the model. Room ids and names come from
    /// `snapshot` when the vent is present in it. Unlearned rates export as 0.
    #[must_use]
    pub fn build(model: &RateModel, snapshot: Option<&Snapshot>, structure_id: Option<&str>, now: Timestamp) -> Self {
        let room_efficiencies = model
            .entries()
            .map(|(vent_id, entry)| {
                let room = snapshot.and_then(|s| s.room_for_vent(vent_id));
                RoomEfficiency {
                    room_id: room.map(|(id, _)| id.to_string()),
                    room_name: room.and_then(|(_, r)| r.name.clone()),
                    vent_id: vent_id.to_string(),
                    cooling_rate: entry.cooling_rate.unwrap_or(0.0),
                    heating_rate: entry.heating_rate.unwrap_or(0.0),
                }
            })
            .collect();
        let ceiling = model.ceiling();
        Self {
            export_metadata: ExportMetadata {
                version: EXPORT_FORMAT_VERSION.to_string(),
                export_date: now.to_rfc3339(),
                structure_id: structure_id.map(str::to_string),
            },
            efficiency_data: EfficiencyData {
                global_rates: GlobalRates {
                    max_cooling_rate: ceiling.cooling_max.unwrap_or(0.0),
                    max_heating_rate: ceiling.heating_max.unwrap_or(0.0),
                },
                room_efficiencies,
            },
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Counts returned by a successful import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub entries: usize,
    pub applied: usize,
    pub unmatched: usize,
}

struct PlannedRate {
    vent_id: String,
    cooling: Option<f64>,
    heating: Option<f64>,
}

/// Apply an efficiency payload to `model`.
///
/// `payload` is either a full export or its bare `efficiencyData` section.
/// Entries are matched to vents in `snapshot` by vent id, then room id, then
/// case-insensitive room name; each vent receives at most one entry. Global
/// ceilings only ever rise.
pub fn import_efficiency(payload: &Value, snapshot: &Snapshot, model: &mut RateModel) -> Result<ImportSummary, ImportError> {
    let root = payload.as_object().ok_or(ImportError::NotAnObject)?;
    let data = match root.get("efficiencyData") {
        None | Some(Value::Null) => root,
        Some(Value::Object(data)) => data,
        Some(_) => {
            return Err(ImportError::InvalidSection {
                section: "efficiencyData",
                expected: "an object",
            });
        }
    };

    let entries = match data.get("roomEfficiencies") {
        None | Some(Value::Null) => return Err(ImportError::MissingSection { section: "roomEfficiencies" }),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(ImportError::InvalidSection {
                section: "roomEfficiencies",
                expected: "a list",
            });
        }
    };

    let (global_cooling, global_heating) = match data.get("globalRates") {
        None | Some(Value::Null) => (None, None),
        Some(Value::Object(rates)) => (
            coerce_rate(rates.get("maxCoolingRate"), || ImportError::InvalidGlobalRate { field: "maxCoolingRate" })?,
            coerce_rate(rates.get("maxHeatingRate"), || ImportError::InvalidGlobalRate { field: "maxHeatingRate" })?,
        ),
        Some(_) => {
            return Err(ImportError::InvalidSection {
                section: "globalRates",
                expected: "an object",
            });
        }
    };

    let mut by_room_id: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut by_room_name: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (vent_id, vent) in &snapshot.vents {
        let Some(room_id) = vent.room_id.as_deref() else {
            continue;
        };
        by_room_id.entry(room_id).or_default().push(vent_id);
        if let Some(name) = snapshot.rooms.get(room_id).and_then(|r| r.name.as_deref()) {
            by_room_name.entry(name.to_lowercase()).or_default().push(vent_id);
        }
    }

    let mut used: BTreeSet<&str> = BTreeSet::new();
    let mut plan = Vec::new();
    let mut unmatched = 0;

    for (index, entry) in entries.iter().enumerate() {
        let Some(entry) = entry.as_object() else {
            unmatched += 1;
            continue;
        };
        let cooling = coerce_rate(entry.get("coolingRate"), || ImportError::InvalidRate {
            index,
            field: "coolingRate",
        })?;
        let heating = coerce_rate(entry.get("heatingRate"), || ImportError::InvalidRate {
            index,
            field: "heatingRate",
        })?;

        let direct = id_field(entry.get("ventId"))
            .and_then(|id| snapshot.vents.get_key_value(id.as_str()))
            .map(|(id, _)| id.as_str())
            .filter(|id| !used.contains(id));
        let target = direct.or_else(|| {
            let by_id = id_field(entry.get("roomId"))
                .and_then(|id| by_room_id.get(id.as_str()))
                .filter(|c| !c.is_empty());
            let candidates = by_id.or_else(|| {
                entry
                    .get("roomName")
                    .and_then(Value::as_str)
                    .and_then(|name| by_room_name.get(&name.to_lowercase()))
            })?;
            candidates.iter().copied().find(|c| !used.contains(c))
        });

        let Some(vent_id) = target else {
            unmatched += 1;
            continue;
        };
        if cooling.is_none() && heating.is_none() {
            unmatched += 1;
            continue;
        }
        used.insert(vent_id);
        plan.push(PlannedRate {
            vent_id: vent_id.to_string(),
            cooling,
            heating,
        });
    }

    if let Some(rate) = global_cooling {
        model.ceiling_mut().observe(HvacMode::Cooling, rate);
    }
    if let Some(rate) = global_heating {
        model.ceiling_mut().observe(HvacMode::Heating, rate);
    }
    for planned in &plan {
        for (mode, rate) in [(HvacMode::Cooling, planned.cooling), (HvacMode::Heating, planned.heating)] {
            if let Some(rate) = rate {
                model.set_rate(&planned.vent_id, mode, rate);
                model.ceiling_mut().observe(mode, rate);
            }
        }
    }

    Ok(ImportSummary {
        entries: entries.len(),
        applied: plan.len(),
        unmatched,
    })
}

/// Numbers and numeric strings are rates; null or absent is "no rate";
/// negative values are ignored. Anything else is an error.
fn coerce_rate(value: Option<&Value>, invalid: impl FnOnce() -> ImportError) -> Result<Option<f64>, ImportError> {
    let rate = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match rate {
        Some(r) if r.is_finite() => Ok((r >= 0.0).then_some(r)),
        _ => Err(invalid()),
    }
}

/// Ids may be exported as strings or numbers.
fn id_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
