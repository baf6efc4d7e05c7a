//! Bounded fan-out of vent-position commands.
//!
//! Commands are issued in waves of at most `max_concurrent` threads. Each
//! wave waits at most `timeout_ms` for its results; a command still running
//! at the deadline is recorded as a timeout and its thread is abandoned. One
//! vent's failure is recorded in the report without affecting its siblings.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::engine::SetVentPosition;
use crate::error::CommandError;

/// The device command layer. `timeout_ms` is passed through so the call can
/// give up on its own; the dispatcher stops waiting at that deadline either way.
pub trait VentCommander: Send + Sync {
    fn set_vent_position(&self, vent_id: &str, percent: u8, timeout_ms: u64) -> Result<(), CommandError>;
}

impl<F> VentCommander for F
where
    F: Fn(&str, u8, u64) -> Result<(), CommandError> + Send + Sync,
{
    fn set_vent_position(&self, vent_id: &str, percent: u8, timeout_ms: u64) -> Result<(), CommandError> {
        self(vent_id, percent, timeout_ms)
    }
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub vent_id: String,
    pub percent: u8,
    #[serde(serialize_with = "serialize_result")]
    pub result: Result<(), CommandError>,
}

fn serialize_result<S: serde::Serializer>(result: &Result<(), CommandError>, s: S) -> Result<S::Ok, S::Error> {
    match result {
        Ok(()) => s.serialize_none(),
        Err(err) => s.serialize_some(&err.to_string()),
    }
}

/// Outcomes of one dispatch, in command order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<CommandOutcome>,
}

impl DispatchReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommandError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Send `commands` through `commander`, at most `max_concurrent` at a time.
pub fn dispatch<C: VentCommander + 'static>(
    commander: &Arc<C>,
    commands: &[SetVentPosition],
    max_concurrent: usize,
    timeout_ms: u64,
) -> DispatchReport {
    let mut outcomes = Vec::with_capacity(commands.len());
    for wave in commands.chunks(max_concurrent.max(1)) {
        let results = run_wave(commander, wave, timeout_ms);
        for (cmd, result) in wave.iter().zip(results) {
            outcomes.push(CommandOutcome {
                vent_id: cmd.vent_id.clone(),
                percent: cmd.percent,
                result,
            });
        }
    }
    DispatchReport { outcomes }
}

fn run_wave<C: VentCommander + 'static>(
    commander: &Arc<C>,
    wave: &[SetVentPosition],
    timeout_ms: u64,
) -> Vec<Result<(), CommandError>> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let (tx, rx) = mpsc::channel();
    for (index, cmd) in wave.iter().enumerate() {
        let tx = tx.clone();
        let commander = Arc::clone(commander);
        let vent_id = cmd.vent_id.clone();
        let percent = cmd.percent;
        std::thread::spawn(move || {
            let result = commander.set_vent_position(&vent_id, percent, timeout_ms);
            // The receiver is gone once the wave deadline has passed.
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    let mut results: Vec<Option<Result<(), CommandError>>> = vec![None; wave.len()];
    let mut pending = wave.len();
    // Senders only disappear without a result when a command panicked.
    let mut disconnected = false;
    while pending > 0 {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((index, result)) => {
                results[index] = Some(result);
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                disconnected = true;
                break;
            }
        }
    }

    wave.iter()
        .zip(results)
        .map(|(cmd, result)| {
            result.unwrap_or_else(|| {
                Err(if disconnected {
                    CommandError::Rejected {
                        vent_id: cmd.vent_id.clone(),
                        reason: "command handler panicked".to_string(),
                    }
                } else {
                    CommandError::Timeout {
                        vent_id: cmd.vent_id.clone(),
                        timeout_ms,
                    }
                })
            })
        })
        .collect()
}
