//! The balancing engine: owned state plus the per-poll control pass.
//!
//! One [`Engine`] owns every learned and transient map (rates, cycle state,
//! per-vent debounce records, strategy metrics) keyed by vent or thermostat
//! id. Callers drive it with snapshots and timestamps:
//!
//! 1. [`Engine::run_due_finalizes`] with a freshly fetched snapshot once a
//!    finalize deadline has passed,
//! 2. [`Engine::poll`] with the current snapshot,
//! 3. dispatch of the returned [`SetVentPosition`] intents, reporting
//!    failures back through [`Engine::command_failed`].
//!
//! Per-thermostat and per-vent problems are collected in the [`PollReport`];
//! they never abort work for siblings.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::json;

use crate::airflow::AirflowRedistributor;
use crate::config::{EngineConfig, clamp_efficiency_percent};
use crate::cost::{TargetPass, VentConditions, longest_minutes_to_target};
use crate::cycle::{CycleStateMachine, FinalizeVent, Transition, finalize_cycle};
use crate::error::{CommandError, EngineError, FetchError, PersistenceError};
use crate::export::{EfficiencyExport, ImportSummary, import_efficiency};
use crate::gate::{AdjustmentGate, GateDecision, SuppressReason, VentRuntimeState};
use crate::hvac::{predict_mode, resolve_action, resolve_setpoint};
use crate::math::{round_big_decimal, should_pre_adjust, temp_error};
use crate::metrics::StrategyMetrics;
use crate::persistence::LearnedState;
use crate::rate_model::RateModel;
use crate::snapshot::Snapshot;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};
use crate::units::{HvacAction, HvacMode, Timestamp};

/// Minimum efficiency move (percentage points) worth an `efficiency_changed` event.
const EFFICIENCY_LOG_DELTA: f64 = 1.0;

/// Intent to move one vent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetVentPosition {
    pub vent_id: String,
    pub percent: u8,
}

/// Everything one engine call did.
#[derive(Debug, Default)]
pub struct PollReport {
    pub commands: Vec<SetVentPosition>,
    pub suppressed: Vec<(String, SuppressReason)>,
    /// Vents left out of this pass because their position was unavailable.
    pub skipped_vents: Vec<String>,
    pub errors: Vec<EngineError>,
    pub cycles_started: Vec<String>,
    pub cycles_ended: Vec<String>,
    pub finalized: Vec<String>,
    /// Learned state changed and should be saved.
    pub state_changed: bool,
}

impl PollReport {
    pub(crate) fn absorb(&mut self, other: PollReport) {
        self.commands.extend(other.commands);
        self.suppressed.extend(other.suppressed);
        self.skipped_vents.extend(other.skipped_vents);
        self.errors.extend(other.errors);
        self.cycles_started.extend(other.cycles_started);
        self.cycles_ended.extend(other.cycles_ended);
        self.finalized.extend(other.finalized);
        self.state_changed |= other.state_changed;
    }

    /// Commanded percent for `vent_id`, if this call commanded it.
    #[must_use]
    pub fn command_for(&self, vent_id: &str) -> Option<u8> {
        self.commands
            .iter()
            .find(|c| c.vent_id == vent_id)
            .map(|c| c.percent)
    }
}

/// Owned engine state.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    gate: AdjustmentGate,
    rates: RateModel,
    metrics: StrategyMetrics,
    max_running_minutes: BTreeMap<String, f64>,
    cycles: CycleStateMachine,
    vents: BTreeMap<String, VentRuntimeState>,
    /// Thermostat and movement behind each vent's latest command, for rollback.
    last_commands: BTreeMap<String, (String, u8)>,
    pre_adjusted: BTreeSet<String>,
    unavailable_logged: BTreeSet<String>,
    unresolved_logged: BTreeSet<String>,
    log: LogEmitter,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            gate: AdjustmentGate::from_config(&config),
            cycles: CycleStateMachine::new(&config.settings),
            config,
            rates: RateModel::new(),
            metrics: StrategyMetrics::default(),
            max_running_minutes: BTreeMap::new(),
            vents: BTreeMap::new(),
            last_commands: BTreeMap::new(),
            pre_adjusted: BTreeSet::new(),
            unavailable_logged: BTreeSet::new(),
            unresolved_logged: BTreeSet::new(),
            log: LogEmitter::null(),
        }
    }

    /// Replace the event log sink.
    #[must_use]
    pub fn with_log(mut self, log: LogEmitter) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn rates(&self) -> &RateModel {
        &self.rates
    }

    #[must_use]
    pub const fn metrics(&self) -> &StrategyMetrics {
        &self.metrics
    }

    #[must_use]
    pub const fn cycles(&self) -> &CycleStateMachine {
        &self.cycles
    }

    #[must_use]
    pub fn vent_state(&self, vent_id: &str) -> Option<&VentRuntimeState> {
        self.vents.get(vent_id)
    }

    /// Learned cycle length for a thermostat, when one has been recorded.
    #[must_use]
    pub fn max_running_minutes(&self, thermostat_id: &str) -> Option<f64> {
        self.max_running_minutes.get(thermostat_id).copied()
    }

    /// True while any thermostat was last seen conditioning.
    #[must_use]
    pub fn any_active(&self) -> bool {
        self.cycles.any_active()
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Observe every assigned thermostat, track cycle transitions and run an
    /// adjustment pass for those actively conditioning.
    pub fn poll(&mut self, snapshot: &Snapshot, now: Timestamp) -> PollReport {
        let mut report = PollReport::default();
        self.last_commands.clear();

        for (thermostat_id, vent_ids) in self.config.vents_by_thermostat() {
            let action = snapshot
                .thermostats
                .get(&thermostat_id)
                .map_or(HvacAction::Unknown, |reading| {
                    resolve_action(reading, self.config.settings.thermostat_hysteresis)
                });
            if action == HvacAction::Unknown {
                // Skip this pass only; a running cycle stays open.
                if self.unresolved_logged.insert(thermostat_id.clone()) {
                    let entry = self
                        .log
                        .entry(LogLevel::Warn, "thermostat_unavailable", now)
                        .with_thermostat(thermostat_id.as_str());
                    self.emit(entry);
                }
                report.errors.push(EngineError::ThermostatUnavailable { thermostat_id });
                continue;
            }
            self.unresolved_logged.remove(&thermostat_id);
            self.observe(&thermostat_id, &vent_ids, action, snapshot, now, &mut report);
            if let Some(mode) = action.mode() {
                let pass = self.apply_adjustments(&thermostat_id, &vent_ids, mode, snapshot, now, true);
                report.absorb(pass);
            }
        }
        report
    }

    fn observe(
        &mut self,
        thermostat_id: &str,
        vent_ids: &[String],
        action: HvacAction,
        snapshot: &Snapshot,
        now: Timestamp,
        report: &mut PollReport,
    ) {
        match self.cycles.observe(thermostat_id, action) {
            Transition::Started(mode) => {
                if self.cycles.pending(thermostat_id).is_some() {
                    let entry = self
                        .log
                        .entry(LogLevel::Warn, "finalize_overlap", now)
                        .with_thermostat(thermostat_id)
                        .with_mode(mode.as_str());
                    self.emit(entry);
                    let flushed = self.finalize_thermostat(thermostat_id, snapshot, now);
                    report.absorb(flushed);
                }
                self.begin_cycle(thermostat_id, vent_ids, mode, snapshot, now);
                report.cycles_started.push(thermostat_id.to_string());
            }
            Transition::Continued(mode) => {
                let previous = self.cycles.cycle(thermostat_id).map(|c| c.mode);
                if let Some(previous) = previous
                    && previous != mode
                {
                    let entry = self
                        .log
                        .entry(LogLevel::Info, "mode_changed", now)
                        .with_thermostat(thermostat_id)
                        .with_mode(mode.as_str())
                        .with_details(json!({ "previous": previous.as_str() }));
                    self.emit(entry);
                    self.cycles.schedule_finalize(thermostat_id, previous, now);
                    let flushed = self.finalize_thermostat(thermostat_id, snapshot, now);
                    report.absorb(flushed);
                    self.begin_cycle(thermostat_id, vent_ids, mode, snapshot, now);
                    report.cycles_started.push(thermostat_id.to_string());
                }
            }
            Transition::Ended(mode) => {
                let entry = self
                    .log
                    .entry(LogLevel::Info, "cycle_ended", now)
                    .with_thermostat(thermostat_id)
                    .with_mode(mode.as_str());
                self.emit(entry);
                report.cycles_ended.push(thermostat_id.to_string());
                if let Some(due_at) = self.cycles.schedule_finalize(thermostat_id, mode, now) {
                    let entry = self
                        .log
                        .entry(LogLevel::Debug, "finalize_scheduled", now)
                        .with_thermostat(thermostat_id)
                        .with_mode(mode.as_str())
                        .with_details(json!({ "due_at": due_at.to_rfc3339() }));
                    self.emit(entry);
                }
            }
            Transition::Idle | Transition::Unresolved => {}
        }
    }

    fn begin_cycle(&mut self, thermostat_id: &str, vent_ids: &[String], mode: HvacMode, snapshot: &Snapshot, now: Timestamp) {
        self.pre_adjusted.remove(thermostat_id);
        self.cycles
            .start_cycle(thermostat_id, mode, self.config.control_strategy, now);
        for vent_id in vent_ids {
            let temp = snapshot.room_temperature(vent_id, self.config.vent_assignments.get(vent_id));
            let open = snapshot.vent_percent(vent_id).unwrap_or(0);
            self.vents.entry(vent_id.clone()).or_default().start_cycle(temp, open);
        }
        let entry = self
            .log
            .entry(LogLevel::Info, "cycle_started", now)
            .with_thermostat(thermostat_id)
            .with_mode(mode.as_str())
            .with_strategy(self.config.control_strategy.as_str());
        self.emit(entry);
    }

    /// Compute, redistribute and gate targets for one thermostat's vents.
    fn apply_adjustments(
        &mut self,
        thermostat_id: &str,
        vent_ids: &[String],
        mode: HvacMode,
        snapshot: &Snapshot,
        now: Timestamp,
        track_cycle: bool,
    ) -> PollReport {
        let mut report = PollReport::default();
        let settings = self.config.settings;
        let strategy = self.config.control_strategy;

        let Some(reading) = snapshot.thermostats.get(thermostat_id) else {
            report.errors.push(EngineError::ThermostatUnavailable {
                thermostat_id: thermostat_id.to_string(),
            });
            return report;
        };
        let Some(setpoint) = resolve_setpoint(reading, mode, &settings) else {
            let entry = self
                .log
                .entry(LogLevel::Warn, "setpoint_missing", now)
                .with_thermostat(thermostat_id)
                .with_mode(mode.as_str());
            self.emit(entry);
            report.errors.push(EngineError::MissingSetpoint {
                thermostat_id: thermostat_id.to_string(),
                mode,
            });
            return report;
        };

        let initial_rate = self.config.initial_rate();
        let mut conditions = Vec::with_capacity(vent_ids.len());
        for vent_id in vent_ids {
            let Some(percent) = snapshot.vent_percent(vent_id) else {
                if self.unavailable_logged.insert(vent_id.clone()) {
                    let entry = self
                        .log
                        .entry(LogLevel::Warn, "vent_unavailable", now)
                        .with_thermostat(thermostat_id)
                        .with_vent(vent_id.as_str());
                    self.emit(entry);
                }
                report.skipped_vents.push(vent_id.clone());
                continue;
            };
            self.unavailable_logged.remove(vent_id);

            let rate = self.rates.ensure_rate(vent_id, mode, initial_rate);
            let temp = snapshot.room_temperature(vent_id, self.config.vent_assignments.get(vent_id));
            conditions.push(VentConditions {
                vent_id: vent_id.clone(),
                room_name: snapshot.room_name(vent_id).map(str::to_string),
                temp: temp.unwrap_or(setpoint),
                rate,
                active: snapshot.room_active(vent_id),
                current_percent: Some(f64::from(percent)),
                temp_missing: temp.is_none(),
            });
        }
        if conditions.is_empty() {
            return report;
        }

        let max_running = self
            .max_running_minutes
            .get(thermostat_id)
            .copied()
            .unwrap_or(settings.max_minutes_to_setpoint);
        let horizon = longest_minutes_to_target(
            &conditions,
            mode,
            setpoint,
            max_running,
            self.config.close_inactive_rooms,
        )
        .unwrap_or(max_running);

        let pass = TargetPass {
            mode,
            setpoint,
            horizon,
            strategy,
            close_inactive: self.config.close_inactive_rooms,
            settings: &settings,
        };
        let rates = &self.rates;
        let mut targets = pass.targets(&conditions, |vent_id| rates.fit(vent_id, mode));

        // Vents without a reading take part at the setpoint temperature.
        let temps: Vec<(&str, f64)> = conditions
            .iter()
            .map(|c| (c.vent_id.as_str(), c.temp))
            .collect();
        let redistribution = AirflowRedistributor::new(&settings).redistribute(
            &temps,
            mode,
            &mut targets,
            self.config.conventional_vents(thermostat_id),
        );
        if redistribution.adjusted() {
            let entry = self
                .log
                .entry(LogLevel::Debug, "airflow_redistributed", now)
                .with_thermostat(thermostat_id)
                .with_mode(mode.as_str())
                .with_details(json!({
                    "combined_before": redistribution.combined_before,
                    "added": redistribution.added,
                    "iterations": redistribution.iterations,
                }));
            self.emit(entry);
        }

        let mut changed = 0u32;
        let mut movement = 0.0;
        for vent in &conditions {
            let Some(&target) = targets.get(&vent.vent_id) else {
                continue;
            };
            let current = vent.current_percent.map_or(0, |p| p as u8);
            let error = if vent.temp_missing {
                0.0
            } else {
                temp_error(mode, setpoint, vent.temp)
            };
            let runtime = self.vents.get(&vent.vent_id);
            match self.gate.evaluate(target, current, error, vent.active, runtime, now) {
                GateDecision::Unchanged { .. } => {}
                GateDecision::Suppressed { percent, reason } => {
                    let entry = self
                        .log
                        .entry(LogLevel::Debug, "vent_suppressed", now)
                        .with_thermostat(thermostat_id)
                        .with_vent(vent.vent_id.as_str())
                        .with_percent(percent)
                        .with_details(json!({ "reason": reason.as_str(), "current": current }));
                    self.emit(entry);
                    report.suppressed.push((vent.vent_id.clone(), reason));
                }
                GateDecision::Command {
                    percent,
                    movement: moved,
                    override_reason,
                } => {
                    self.vents
                        .entry(vent.vent_id.clone())
                        .or_default()
                        .record_command(percent, now);
                    self.last_commands
                        .insert(vent.vent_id.clone(), (thermostat_id.to_string(), moved));
                    changed += 1;
                    movement += f64::from(moved);
                    let entry = self
                        .log
                        .entry(LogLevel::Info, "vent_commanded", now)
                        .with_thermostat(thermostat_id)
                        .with_vent(vent.vent_id.as_str())
                        .with_mode(mode.as_str())
                        .with_strategy(strategy.as_str())
                        .with_percent(percent)
                        .with_details(json!({
                            "target": round_big_decimal(target, 3),
                            "previous": current,
                            "override": override_reason,
                        }));
                    self.emit(entry);
                    report.commands.push(SetVentPosition {
                        vent_id: vent.vent_id.clone(),
                        percent,
                    });
                }
            }
        }

        if track_cycle {
            self.cycles
                .record_adjustments(thermostat_id, changed, movement, strategy);
        }
        self.metrics.mark_used(strategy);
        report
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    /// Earliest pending finalize deadline, if any.
    #[must_use]
    pub fn next_finalize_due(&self) -> Option<Timestamp> {
        self.cycles.next_due()
    }

    /// Thermostats whose finalize deadline has passed.
    #[must_use]
    pub fn due_finalizes(&self, now: Timestamp) -> Vec<String> {
        self.cycles.due(now)
    }

    /// Finalize every due cycle against `snapshot`, which should be fetched
    /// after the settle delay.
    pub fn run_due_finalizes(&mut self, snapshot: &Snapshot, now: Timestamp) -> PollReport {
        let mut report = PollReport::default();
        for thermostat_id in self.cycles.due(now) {
            let done = self.finalize_thermostat(&thermostat_id, snapshot, now);
            report.absorb(done);
        }
        report
    }

    /// Drop due finalizes without learning from them (the refresh failed).
    pub fn discard_due_finalizes(&mut self, now: Timestamp, reason: &str) -> Vec<String> {
        let due = self.cycles.due(now);
        for thermostat_id in &due {
            self.cycles.take_for_finalize(thermostat_id);
            let entry = self
                .log
                .entry(LogLevel::Warn, "finalize_cancelled", now)
                .with_thermostat(thermostat_id.as_str())
                .with_details(json!({ "reason": reason }));
            self.emit(entry);
        }
        due
    }

    /// Cancel every pending finalize (shutdown). In-flight learning is dropped.
    pub fn cancel_pending_finalizes(&mut self, now: Timestamp) -> Vec<String> {
        let cancelled = self.cycles.cancel_pending();
        for thermostat_id in &cancelled {
            let entry = self
                .log
                .entry(LogLevel::Info, "finalize_cancelled", now)
                .with_thermostat(thermostat_id.as_str())
                .with_details(json!({ "reason": "shutdown" }));
            self.emit(entry);
        }
        cancelled
    }

    fn finalize_thermostat(&mut self, thermostat_id: &str, snapshot: &Snapshot, now: Timestamp) -> PollReport {
        let mut report = PollReport::default();
        let Some((_, Some(cycle))) = self.cycles.take_for_finalize(thermostat_id) else {
            return report;
        };
        let settings = self.config.settings;
        let vent_ids = self
            .config
            .vents_by_thermostat()
            .remove(thermostat_id)
            .unwrap_or_default();

        let vents: Vec<FinalizeVent> = vent_ids
            .iter()
            .map(|vent_id| {
                let runtime = self.vents.get(vent_id);
                FinalizeVent {
                    vent_id: vent_id.clone(),
                    room_name: snapshot.room_name(vent_id).map(str::to_string),
                    start_temp: runtime.and_then(|r| r.starting_temp),
                    start_open_percent: runtime.map_or(0, |r| r.starting_open_percent),
                    current_temp: snapshot.room_temperature(vent_id, self.config.vent_assignments.get(vent_id)),
                }
            })
            .collect();
        let setpoint = snapshot
            .thermostats
            .get(thermostat_id)
            .and_then(|reading| resolve_setpoint(reading, cycle.mode, &settings));
        let previous_max = self.max_running_minutes.get(thermostat_id).copied();

        let outcome = finalize_cycle(&cycle, &vents, setpoint, previous_max, now, &mut self.rates, &settings);
        self.max_running_minutes
            .insert(thermostat_id.to_string(), outcome.max_running_minutes);

        if self.config.log_efficiency_changes {
            for update in &outcome.updates {
                let before = clamp_efficiency_percent(update.previous.unwrap_or(0.0) * 100.0);
                let after = clamp_efficiency_percent(update.rate * 100.0);
                if (after - before).abs() >= EFFICIENCY_LOG_DELTA {
                    let entry = self
                        .log
                        .entry(LogLevel::Info, "efficiency_changed", now)
                        .with_thermostat(thermostat_id)
                        .with_vent(update.vent_id.as_str())
                        .with_mode(outcome.mode.as_str())
                        .with_details(json!({
                            "previous_percent": round_big_decimal(before, 1),
                            "percent": round_big_decimal(after, 1),
                            "source": update.source.as_str(),
                        }));
                    self.emit(entry);
                }
            }
        }

        if let Some(error) = outcome.mean_temp_error {
            self.metrics
                .record(outcome.strategy, error, outcome.adjustments, outcome.movement, now);
        }

        let entry = self
            .log
            .entry(LogLevel::Info, "cycle_finalized", now)
            .with_thermostat(thermostat_id)
            .with_mode(outcome.mode.as_str())
            .with_strategy(outcome.strategy.as_str())
            .with_details(json!({
                "running_minutes": round_big_decimal(outcome.total_running_minutes, 3),
                "max_running_minutes": round_big_decimal(outcome.max_running_minutes, 3),
                "updated": outcome.updates.len(),
                "skipped": outcome.skipped,
                "mean_temp_error": outcome.mean_temp_error,
                "adjustments": outcome.adjustments,
            }));
        self.emit(entry);

        report.finalized.push(thermostat_id.to_string());
        report.state_changed = true;
        report
    }

    // -----------------------------------------------------------------------
    // Event-driven and manual passes
    // -----------------------------------------------------------------------

    /// React to a push-style thermostat state change.
    ///
    /// While the thermostat is not conditioning, predict its next mode and, if
    /// the room is about to trigger it, position vents ahead of the cycle.
    /// The pre-adjust is latched until the thermostat starts conditioning or
    /// drifts back out of the pre-adjust band.
    pub fn on_thermostat_event(&mut self, thermostat_id: &str, snapshot: &Snapshot, now: Timestamp) -> PollReport {
        let mut report = PollReport::default();
        let Some(reading) = snapshot.thermostats.get(thermostat_id) else {
            report.errors.push(EngineError::ThermostatUnavailable {
                thermostat_id: thermostat_id.to_string(),
            });
            return report;
        };
        let raw_active = reading
            .hvac_action
            .as_deref()
            .is_some_and(|a| HvacAction::from_str_loose(a).is_active());
        if raw_active || self.cycles.active_mode(thermostat_id).is_some() {
            self.pre_adjusted.remove(thermostat_id);
            return report;
        }
        let Some(current) = reading.current_celsius() else {
            return report;
        };
        let Some(mode) = predict_mode(reading) else {
            return report;
        };
        let Some(setpoint) = resolve_setpoint(reading, mode, &self.config.settings) else {
            report.errors.push(EngineError::MissingSetpoint {
                thermostat_id: thermostat_id.to_string(),
                mode,
            });
            return report;
        };

        if !should_pre_adjust(mode, setpoint, current, &self.config.settings) {
            self.pre_adjusted.remove(thermostat_id);
            return report;
        }
        if !self.pre_adjusted.insert(thermostat_id.to_string()) {
            return report;
        }

        let vent_ids: Vec<String> = self
            .config
            .vents_by_thermostat()
            .remove(thermostat_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|v| snapshot.vents.contains_key(v))
            .collect();
        if vent_ids.is_empty() {
            return report;
        }
        let entry = self
            .log
            .entry(LogLevel::Info, "pre_adjust", now)
            .with_thermostat(thermostat_id)
            .with_mode(mode.as_str())
            .with_details(json!({ "current": current, "setpoint": setpoint }));
        self.emit(entry);
        self.last_commands.clear();
        self.apply_adjustments(thermostat_id, &vent_ids, mode, snapshot, now, false)
    }

    /// Manually run an adjustment pass for one thermostat, or all of them,
    /// when actively conditioning. Cycle transitions are not tracked.
    pub fn run_dab(&mut self, thermostat_id: Option<&str>, snapshot: &Snapshot, now: Timestamp) -> PollReport {
        let mut report = PollReport::default();
        self.last_commands.clear();
        for (id, vent_ids) in self.config.vents_by_thermostat() {
            if thermostat_id.is_some_and(|wanted| wanted != id) {
                continue;
            }
            let Some(reading) = snapshot.thermostats.get(&id) else {
                continue;
            };
            let Some(mode) = resolve_action(reading, self.config.settings.thermostat_hysteresis).mode() else {
                continue;
            };
            let pass = self.apply_adjustments(&id, &vent_ids, mode, snapshot, now, true);
            report.absorb(pass);
        }
        report
    }

    // -----------------------------------------------------------------------
    // Command feedback
    // -----------------------------------------------------------------------

    /// Record a failed command: log it and roll back the vent's debounce
    /// record so the next poll may retry. Returns true if a record was undone.
    pub fn command_failed(&mut self, error: &CommandError, now: Timestamp) -> bool {
        let vent_id = error.vent_id().to_string();
        let entry = self
            .log
            .entry(LogLevel::Error, "command_failed", now)
            .with_vent(vent_id.as_str())
            .with_details(json!({ "error": error.to_string() }));
        self.emit(entry);
        self.forget_command(&vent_id)
    }

    /// Undo the most recent command record for `vent_id`.
    pub fn forget_command(&mut self, vent_id: &str) -> bool {
        let undone = self
            .vents
            .get_mut(vent_id)
            .is_some_and(VentRuntimeState::forget_command);
        if let Some((thermostat_id, movement)) = self.last_commands.remove(vent_id) {
            self.cycles
                .retract_adjustment(&thermostat_id, f64::from(movement));
        }
        undone
    }

    // -----------------------------------------------------------------------
    // Learned state
    // -----------------------------------------------------------------------

    /// Efficiency as a percentage of the fastest possible rate, rounded to 0.1.
    /// Unlearned vents report the configured initial efficiency.
    #[must_use]
    pub fn vent_efficiency_percent(&self, vent_id: &str, mode: HvacMode) -> f64 {
        let rate = self.rates.get_rate(vent_id, mode);
        let percent = if rate <= 0.0 {
            clamp_efficiency_percent(self.config.initial_efficiency_percent)
        } else {
            clamp_efficiency_percent(rate * 100.0)
        };
        round_big_decimal(percent, 1)
    }

    #[must_use]
    pub fn export_efficiency(&self, snapshot: Option<&Snapshot>, now: Timestamp) -> EfficiencyExport {
        EfficiencyExport::build(&self.rates, snapshot, self.config.structure_id.as_deref(), now)
    }

    /// Import an efficiency payload. Nothing is applied on error.
    pub fn import_efficiency(
        &mut self,
        payload: &serde_json::Value,
        snapshot: &Snapshot,
        now: Timestamp,
    ) -> Result<ImportSummary, EngineError> {
        let summary = import_efficiency(payload, snapshot, &mut self.rates)?;
        let entry = self
            .log
            .entry(LogLevel::Info, "import_applied", now)
            .with_details(json!(summary));
        self.emit(entry);
        Ok(summary)
    }

    /// Copy of everything that must be persisted.
    #[must_use]
    pub fn learned_state(&self) -> LearnedState {
        LearnedState {
            rates: self.rates.clone(),
            max_running_minutes: self.max_running_minutes.clone(),
            strategy_metrics: self.metrics.clone(),
        }
    }

    /// Replace learned state (startup load).
    pub fn restore(&mut self, state: LearnedState) {
        self.rates = state.rates;
        self.max_running_minutes = state.max_running_minutes;
        self.metrics = state.strategy_metrics;
    }

    /// Log a failed snapshot fetch. The poll is skipped.
    pub fn record_fetch_failure(&mut self, error: &FetchError, now: Timestamp) {
        let entry = self
            .log
            .entry(LogLevel::Warn, "snapshot_unavailable", now)
            .with_details(json!({ "error": error.to_string() }));
        self.emit(entry);
    }

    /// Log the outcome of a save attempt.
    pub fn record_save(&mut self, result: Result<(), &PersistenceError>, now: Timestamp) {
        let entry = match result {
            Ok(()) => self.log.entry(LogLevel::Debug, "state_saved", now),
            Err(err) => self
                .log
                .entry(LogLevel::Error, "state_save_failed", now)
                .with_details(json!({ "error": err.to_string() })),
        };
        self.emit(entry);
    }

    pub fn flush_log(&mut self) -> std::io::Result<()> {
        self.log.flush()
    }

    fn emit(&mut self, entry: LogEntry) {
        // Logging is best effort; the control path never fails on a log write.
        let _ = self.log.emit_entry(entry);
    }
}
