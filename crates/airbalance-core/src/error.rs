//! Error taxonomy for the balancing engine.
//!
//! Per-vent and per-thermostat failures are reported, never propagated across
//! siblings: a failed command or a missing setpoint for one thermostat does
//! not abort the rest of the pass.

use thiserror::Error;

use crate::units::HvacMode;

/// Failures surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("thermostat {thermostat_id} has no {} setpoint", mode.as_str())]
    MissingSetpoint {
        thermostat_id: String,
        mode: HvacMode,
    },
    #[error("thermostat {thermostat_id} is unavailable")]
    ThermostatUnavailable { thermostat_id: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Import(#[from] ImportError),
}

/// A reading could not be fetched from the data source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{what} unavailable")]
    Unavailable { what: String },
    #[error("{what} timed out after {timeout_ms} ms")]
    Timeout { what: String, timeout_ms: u64 },
}

/// A vent-position command failed. Scoped to one vent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command to vent {vent_id} timed out after {timeout_ms} ms")]
    Timeout { vent_id: String, timeout_ms: u64 },
    #[error("vent {vent_id} rejected command: {reason}")]
    Rejected { vent_id: String, reason: String },
}

impl CommandError {
    /// The vent this failure belongs to.
    #[must_use]
    pub fn vent_id(&self) -> &str {
        match self {
            Self::Timeout { vent_id, .. } | Self::Rejected { vent_id, .. } => vent_id,
        }
    }
}

/// Learned-state save/load failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("state checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("unsupported state version {found}")]
    UnsupportedVersion { found: u32 },
}

/// Structural problems with an efficiency-import payload. Any of these rejects
/// the whole import before anything is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("efficiency payload must be a JSON object")]
    NotAnObject,
    #[error("missing {section} section")]
    MissingSection { section: &'static str },
    #[error("{section} must be {expected}")]
    InvalidSection {
        section: &'static str,
        expected: &'static str,
    },
    #[error("entry {index}: {field} is not numeric")]
    InvalidRate { index: usize, field: &'static str },
    #[error("globalRates.{field} is not numeric")]
    InvalidGlobalRate { field: &'static str },
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
