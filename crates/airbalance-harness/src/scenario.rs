//! Scripted scenario replay.
//!
//! A scenario is a configuration plus a list of timed steps. Each step
//! supplies the snapshot the next tick will see (or `null` for an outage)
//! and the vents whose commands should fail. Steps are replayed through the
//! real [`ControlLoop`], so fetch, finalize, dispatch and persistence all run.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use airbalance_core::structured_log::LogEmitter;
use airbalance_core::{
    CommandError, ControlLoop, Engine, EngineConfig, FetchError, LearnedState, SetVentPosition, Snapshot,
    StateStore, Timestamp,
};

use crate::error::HarnessError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Seconds since the scenario epoch.
    pub at_secs: u64,
    /// Snapshot returned by the fetch at this step; `None` simulates an outage.
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub fail_vents: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Wall-clock origin (Unix seconds) for step offsets.
    #[serde(default)]
    pub epoch_secs: u64,
    #[serde(default)]
    pub config: EngineConfig,
    pub steps: Vec<ScenarioStep>,
}

/// What happened at one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub at_secs: u64,
    pub fetch_failed: bool,
    pub commands: Vec<SetVentPosition>,
    pub failed_commands: Vec<String>,
    pub suppressed: usize,
    pub cycles_started: Vec<String>,
    pub cycles_ended: Vec<String>,
    pub finalized: Vec<String>,
    pub saved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepSummary>,
    pub learned: LearnedState,
}

impl ScenarioReport {
    /// Total commands issued across all steps, failed ones included.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.steps.iter().map(|s| s.commands.len()).sum()
    }
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::from_json(&content).map_err(|e| HarnessError::json(path, e))
    }

    /// Replay every step. Learned state is loaded from and saved to `store`
    /// when one is given.
    pub fn run(&self, log: LogEmitter, store: Option<StateStore>) -> Result<ScenarioReport, HarnessError> {
        let next_snapshot: Arc<Mutex<Option<Snapshot>>> = Arc::new(Mutex::new(None));
        let failing: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(BTreeSet::new()));

        let source = {
            let slot = Arc::clone(&next_snapshot);
            move |_timeout_ms: u64| {
                slot.lock().take().ok_or_else(|| FetchError::Unavailable {
                    what: "scenario snapshot".to_string(),
                })
            }
        };
        let commander = {
            let failing = Arc::clone(&failing);
            move |vent_id: &str, _percent: u8, _timeout_ms: u64| -> Result<(), CommandError> {
                if failing.lock().contains(vent_id) {
                    Err(CommandError::Rejected {
                        vent_id: vent_id.to_string(),
                        reason: "scripted failure".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        };

        let engine = Engine::new(self.config.clone()).with_log(log);
        let mut control = ControlLoop::new(engine, source, commander);
        if let Some(store) = store {
            control = control.with_store(store)?;
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            *next_snapshot.lock() = step.snapshot.clone();
            *failing.lock() = step.fail_vents.clone();

            let now = Timestamp::from_secs(self.epoch_secs.saturating_add(step.at_secs));
            let tick = control.tick(now);
            steps.push(StepSummary {
                at_secs: step.at_secs,
                fetch_failed: tick.fetch_error.is_some(),
                commands: tick.engine.commands.clone(),
                failed_commands: tick.dispatch.failures().map(|e| e.vent_id().to_string()).collect(),
                suppressed: tick.engine.suppressed.len(),
                cycles_started: tick.engine.cycles_started,
                cycles_ended: tick.engine.cycles_ended,
                finalized: tick.engine.finalized,
                saved: tick.saved,
            });
        }

        // Flush is best effort; the replay result does not depend on the log.
        let _ = control.engine_mut().flush_log();
        Ok(ScenarioReport {
            name: self.name.clone(),
            steps,
            learned: control.engine().learned_state(),
        })
    }
}
