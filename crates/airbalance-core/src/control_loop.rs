//! Periodic driver: fetch, finalize, poll, dispatch, persist.
//!
//! The loop polls every `poll_interval_active_minutes` while any thermostat
//! is conditioning and every `poll_interval_idle_minutes` otherwise. It also
//! wakes early for a pending finalize deadline.
//!
//! Outbound calls are bounded: commands by the dispatcher's wave deadline,
//! snapshot fetches by `fetch_timeout_ms`. A snapshot delivered after its
//! deadline is discarded as a timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::dispatch::{DispatchReport, VentCommander, dispatch};
use crate::engine::{Engine, PollReport};
use crate::error::{FetchError, PersistenceError};
use crate::persistence::StateStore;
use crate::snapshot::Snapshot;
use crate::units::Timestamp;

/// Shutdown is checked at least this often while sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Where snapshots come from. Implementations should give up after
/// `timeout_ms`; a late answer is treated as a timeout regardless.
pub trait SnapshotSource {
    fn fetch(&mut self, timeout_ms: u64) -> Result<Snapshot, FetchError>;
}

impl<F> SnapshotSource for F
where
    F: FnMut(u64) -> Result<Snapshot, FetchError>,
{
    fn fetch(&mut self, timeout_ms: u64) -> Result<Snapshot, FetchError> {
        self(timeout_ms)
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Set when the snapshot could not be fetched; nothing else ran.
    pub fetch_error: Option<FetchError>,
    pub engine: PollReport,
    pub dispatch: DispatchReport,
    /// Failed commands whose debounce record was undone.
    pub rolled_back: usize,
    pub saved: bool,
    pub save_error: Option<String>,
}

pub struct ControlLoop<S, C> {
    engine: Engine,
    source: S,
    commander: Arc<C>,
    store: Option<StateStore>,
}

impl<S: SnapshotSource, C: VentCommander + 'static> ControlLoop<S, C> {
    pub fn new(engine: Engine, source: S, commander: C) -> Self {
        Self {
            engine,
            source,
            commander: Arc::new(commander),
            store: None,
        }
    }

    /// Attach a state store and restore whatever it holds.
    pub fn with_store(mut self, store: StateStore) -> Result<Self, PersistenceError> {
        let state = store.load()?;
        self.engine.restore(state);
        self.store = Some(store);
        Ok(self)
    }

    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Minutes until the next regular poll.
    #[must_use]
    pub fn next_interval_minutes(&self) -> u64 {
        let config = self.engine.config();
        let minutes = if self.engine.any_active() {
            config.poll_interval_active_minutes
        } else {
            config.poll_interval_idle_minutes
        };
        u64::from(minutes.max(1))
    }

    /// Run one control pass at `now`.
    pub fn tick(&mut self, now: Timestamp) -> TickReport {
        let mut report = TickReport::default();

        let snapshot = match self.fetch_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.engine.record_fetch_failure(&err, now);
                // Due finalizes need a fresh snapshot; without one they are dropped.
                self.engine.discard_due_finalizes(now, "snapshot_unavailable");
                report.fetch_error = Some(err);
                return report;
            }
        };

        let finalized = self.engine.run_due_finalizes(&snapshot, now);
        report.engine.absorb(finalized);
        let polled = self.engine.poll(&snapshot, now);
        report.engine.absorb(polled);

        let config = self.engine.config();
        report.dispatch = dispatch(
            &self.commander,
            &report.engine.commands,
            config.max_concurrent_commands,
            config.command_timeout_ms,
        );
        for failure in report.dispatch.failures() {
            if self.engine.command_failed(failure, now) {
                report.rolled_back += 1;
            }
        }

        if report.engine.state_changed {
            self.persist(now, &mut report);
        }
        report
    }

    fn fetch_snapshot(&mut self) -> Result<Snapshot, FetchError> {
        let timeout_ms = self.engine.config().fetch_timeout_ms;
        let started = Instant::now();
        let snapshot = self.source.fetch(timeout_ms)?;
        if started.elapsed() > Duration::from_millis(timeout_ms) {
            return Err(FetchError::Timeout {
                what: "snapshot".to_string(),
                timeout_ms,
            });
        }
        Ok(snapshot)
    }

    fn persist(&mut self, now: Timestamp, report: &mut TickReport) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store.save(&self.engine.learned_state());
        self.engine.record_save(result.as_ref().map(|_| ()), now);
        match result {
            Ok(()) => report.saved = true,
            Err(err) => report.save_error = Some(err.to_string()),
        }
    }

    /// Tick on the wall clock until `shutdown` is set, then cancel pending
    /// finalizes and flush the event log.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let mut next_tick = Timestamp::now();
        while !shutdown.load(Ordering::SeqCst) {
            let now = Timestamp::now();
            let finalize_due = self
                .engine
                .next_finalize_due()
                .is_some_and(|due| due <= now);
            if now >= next_tick || finalize_due {
                self.tick(now);
                next_tick = now.plus_minutes(self.next_interval_minutes());
            }
            std::thread::sleep(SLEEP_SLICE);
        }
        self.engine.cancel_pending_finalizes(Timestamp::now());
        let _ = self.engine.flush_log();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::CommandError;
    use crate::snapshot::ThermostatReading;
    use crate::units::HvacMode;

    fn house(reading: ThermostatReading) -> Snapshot {
        Snapshot::new()
            .with_thermostat("t1", reading)
            .with_room("r1", "Office", Some(20.0))
            .with_room("r2", "Den", Some(22.0))
            .with_vent("v1", "r1", Some(50))
            .with_vent("v2", "r2", Some(50))
    }

    fn scripted(snapshots: Vec<Result<Snapshot, FetchError>>) -> impl FnMut(u64) -> Result<Snapshot, FetchError> {
        let mut queue: VecDeque<_> = snapshots.into();
        move |_timeout_ms| {
            queue.pop_front().unwrap_or_else(|| {
                Err(FetchError::Unavailable {
                    what: "script exhausted".into(),
                })
            })
        }
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_vent("v1", "t1").with_vent("v2", "t1"))
    }

    fn accept_all(_: &str, _: u8, _: u64) -> Result<(), CommandError> {
        Ok(())
    }

    #[test]
    fn interval_follows_activity() {
        let heating = house(ThermostatReading::heating(20.0, 24.0));
        let mut control = ControlLoop::new(engine(), scripted(vec![Ok(heating)]), accept_all);
        assert_eq!(control.next_interval_minutes(), 10);
        let report = control.tick(Timestamp::from_secs(0));
        assert_eq!(report.dispatch.succeeded(), 2);
        assert_eq!(control.next_interval_minutes(), 3);
    }

    #[test]
    fn fetch_failure_skips_and_drops_due_finalize() {
        let heating = house(ThermostatReading::heating(20.0, 24.0));
        let idle = house(ThermostatReading::heating(24.0, 24.0).idle());
        let mut control = ControlLoop::new(engine(), scripted(vec![Ok(heating), Ok(idle)]), accept_all);
        control.tick(Timestamp::from_secs(0));
        control.tick(Timestamp::from_secs(900));
        assert!(control.engine().next_finalize_due().is_some());

        let report = control.tick(Timestamp::from_secs(960));
        assert!(report.fetch_error.is_some());
        assert!(control.engine().next_finalize_due().is_none());
        assert!(control.engine().max_running_minutes("t1").is_none());
    }

    #[test]
    fn rejected_commands_roll_back() {
        let heating = house(ThermostatReading::heating(20.0, 24.0));
        let commander = |vent: &str, _: u8, _: u64| -> Result<(), CommandError> {
            if vent == "v2" {
                Err(CommandError::Rejected {
                    vent_id: vent.into(),
                    reason: "offline".into(),
                })
            } else {
                Ok(())
            }
        };
        let mut control = ControlLoop::new(engine(), scripted(vec![Ok(heating)]), commander);
        let report = control.tick(Timestamp::from_secs(0));
        assert_eq!(report.rolled_back, 1);
        assert_eq!(control.engine().vent_state("v2").unwrap().last_commanded_at, None);
        assert!(control.engine().vent_state("v1").unwrap().last_commanded_at.is_some());
        assert_eq!(control.engine().cycles().cycle("t1").unwrap().adjustments_applied, 1);
    }

    #[test]
    fn finalize_is_persisted() {
        let dir = std::env::temp_dir().join(format!(
            "airbalance-loop-{}-{}",
            std::process::id(),
            Timestamp::now().as_millis()
        ));
        let path = dir.join("state.json");
        let heating = house(ThermostatReading::heating(20.0, 24.0));
        let mut warm = house(ThermostatReading::heating(24.0, 24.0).idle());
        warm.set_room_temperature("r1", Some(21.5));
        let source = scripted(vec![Ok(heating), Ok(warm.clone()), Ok(warm)]);
        let mut control = ControlLoop::new(engine(), source, accept_all)
            .with_store(StateStore::new(&path))
            .unwrap();

        control.tick(Timestamp::from_secs(0));
        let ended = control.tick(Timestamp::from_secs(1200));
        assert_eq!(ended.engine.cycles_ended, vec!["t1".to_string()]);
        assert!(!ended.saved);

        let finalized = control.tick(Timestamp::from_secs(1230));
        assert_eq!(finalized.engine.finalized, vec!["t1".to_string()]);
        assert!(finalized.saved, "{:?}", finalized.save_error);

        let restored = StateStore::new(&path).load().unwrap();
        assert_eq!(
            restored.rates.learned_rate("v1", HvacMode::Heating),
            control.engine().rates().learned_rate("v1", HvacMode::Heating)
        );
        assert!(restored.max_running_minutes.contains_key("t1"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn late_snapshot_is_a_timeout() {
        let config = EngineConfig {
            fetch_timeout_ms: 20,
            ..EngineConfig::default()
        }
        .with_vent("v1", "t1")
        .with_vent("v2", "t1");
        let heating = house(ThermostatReading::heating(20.0, 24.0));
        let slow = move |timeout_ms: u64| -> Result<Snapshot, FetchError> {
            assert_eq!(timeout_ms, 20);
            std::thread::sleep(Duration::from_millis(200));
            Ok(heating.clone())
        };
        let mut control = ControlLoop::new(Engine::new(config), slow, accept_all);
        let report = control.tick(Timestamp::from_secs(0));
        assert_eq!(
            report.fetch_error,
            Some(FetchError::Timeout {
                what: "snapshot".into(),
                timeout_ms: 20
            })
        );
        assert!(report.engine.commands.is_empty());
        assert!(!control.engine().any_active());
    }
}
