//! Learned-state persistence.
//!
//! State is written as a versioned envelope:
//!
//! ```json
//! {"version": 1, "sha256": "<hex of the state JSON>", "state": {...}}
//! ```
//!
//! Saves go through one writer lock and land via a temp file plus rename, so
//! a reader never sees a torn file. A missing file loads as empty state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PersistenceError;
use crate::metrics::StrategyMetrics;
use crate::rate_model::RateModel;

pub const STATE_VERSION: u32 = 1;

/// Everything the engine learns and must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedState {
    /// Rates, regression sums and per-mode ceilings.
    #[serde(flatten)]
    pub rates: RateModel,
    /// Learned cycle length per thermostat.
    pub max_running_minutes: BTreeMap<String, f64>,
    pub strategy_metrics: StrategyMetrics,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateEnvelope {
    version: u32,
    sha256: String,
    state: serde_json::Value,
}

/// Encode `state` into an envelope document.
pub fn encode_state(state: &LearnedState) -> Result<String, PersistenceError> {
    let value = serde_json::to_value(state)?;
    let envelope = StateEnvelope {
        version: STATE_VERSION,
        sha256: state_digest(&value)?,
        state: value,
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

/// Decode and verify an envelope document.
pub fn decode_state(text: &str) -> Result<LearnedState, PersistenceError> {
    let envelope: StateEnvelope = serde_json::from_str(text)?;
    if envelope.version != STATE_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found: envelope.version,
        });
    }
    let actual = state_digest(&envelope.state)?;
    if actual != envelope.sha256 {
        return Err(PersistenceError::ChecksumMismatch {
            expected: envelope.sha256,
            actual,
        });
    }
    Ok(serde_json::from_value(envelope.state)?)
}

fn state_digest(state: &serde_json::Value) -> Result<String, PersistenceError> {
    let canonical = serde_json::to_vec(state)?;
    Ok(hex_lower(&Sha256::digest(&canonical)))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// File-backed store with a single-writer save path.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state. A missing file is empty state, not an error.
    pub fn load(&self) -> Result<LearnedState, PersistenceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => decode_state(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LearnedState::default()),
            Err(source) => Err(self.io_error(&self.path, source)),
        }
    }

    /// Persist state atomically.
    pub fn save(&self, state: &LearnedState) -> Result<(), PersistenceError> {
        let text = encode_state(state)?;
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, text).map_err(|e| self.io_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(&self.path, e))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
