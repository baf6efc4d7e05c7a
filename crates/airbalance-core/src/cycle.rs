//! Per-thermostat HVAC cycle tracking and the finalize pass that turns one
//! cycle's observations into learned rates.
//!
//! Lifecycle per thermostat: `Idle -> Running(mode) -> Idle`.
//! - First active observation: a [`CycleState`] is opened and every vent's
//!   starting temperature and opening are captured.
//! - First inactive observation: a finalize is scheduled `settle` later. The
//!   deadline lives here and is checked by the caller on every poll; there is
//!   no background timer.
//! - Finalize: the cycle is consumed, rates are blended, regression samples
//!   appended and the learned cycle length updated.
//!
//! At most one cycle and one pending finalize exist per thermostat.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ControlStrategy, DabSettings};
use crate::math::{
    calculate_room_change_rate, has_room_reached_setpoint, rolling_average, round_big_decimal,
    temp_error,
};
use crate::rate_model::RateModel;
use crate::units::{HvacAction, HvacMode, Timestamp};

/// Window and weight for the learned cycle length.
const RUNNING_MINUTES_WINDOW: u32 = 6;
/// Window for per-vent rate blending.
const RATE_WINDOW: u32 = 4;
const RATE_DECIMALS: u32 = 6;

/// One live heating or cooling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub mode: HvacMode,
    pub cycle_start: Timestamp,
    pub running_start: Timestamp,
    pub adjustments_applied: u32,
    pub total_movement: f64,
    pub strategy_used: ControlStrategy,
}

/// A scheduled finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFinalize {
    pub mode: HvacMode,
    pub ended_at: Timestamp,
    pub due_at: Timestamp,
}

/// What an observation did to a thermostat's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle to active. The caller flushes any pending finalize, then opens a cycle.
    Started(HvacMode),
    /// Still active.
    Continued(HvacMode),
    /// Active to idle.
    Ended(HvacMode),
    /// Still idle.
    Idle,
    /// The action could not be resolved; the lifecycle is unchanged.
    Unresolved,
}

#[derive(Debug, Clone, Default)]
struct ThermostatTrack {
    last_mode: Option<HvacMode>,
    cycle: Option<CycleState>,
    pending: Option<PendingFinalize>,
}

/// Lifecycle state for every tracked thermostat.
#[derive(Debug, Clone)]
pub struct CycleStateMachine {
    settle_ms: u64,
    tracks: BTreeMap<String, ThermostatTrack>,
}

impl CycleStateMachine {
    #[must_use]
    pub fn new(settings: &DabSettings) -> Self {
        Self {
            settle_ms: settings.finalize_settle_secs.saturating_mul(1000),
            tracks: BTreeMap::new(),
        }
    }

    /// Record the latest resolved action and report the transition.
    /// `Unknown` is not evidence of anything: only a resolved idle ends a cycle.
    pub fn observe(&mut self, thermostat_id: &str, action: HvacAction) -> Transition {
        if action == HvacAction::Unknown {
            return Transition::Unresolved;
        }
        let track = self.tracks.entry(thermostat_id.to_string()).or_default();
        let previous = track.last_mode;
        let current = action.mode();
        track.last_mode = current;
        match (previous, current) {
            (None, Some(mode)) => Transition::Started(mode),
            (Some(_), Some(mode)) => Transition::Continued(mode),
            (Some(mode), None) => Transition::Ended(mode),
            (None, None) => Transition::Idle,
        }
    }

    /// Open a cycle. Replaces nothing: callers flush a pending finalize first.
    pub fn start_cycle(&mut self, thermostat_id: &str, mode: HvacMode, strategy: ControlStrategy, now: Timestamp) {
        let track = self.tracks.entry(thermostat_id.to_string()).or_default();
        track.cycle = Some(CycleState {
            mode,
            cycle_start: now,
            running_start: now,
            adjustments_applied: 0,
            total_movement: 0.0,
            strategy_used: strategy,
        });
    }

    /// Schedule a finalize `settle` from `now`. A second request while one is
    /// pending is a no-op and returns `None`.
    pub fn schedule_finalize(&mut self, thermostat_id: &str, mode: HvacMode, now: Timestamp) -> Option<Timestamp> {
        let track = self.tracks.entry(thermostat_id.to_string()).or_default();
        if track.pending.is_some() {
            return None;
        }
        let due_at = now.plus_millis(self.settle_ms);
        track.pending = Some(PendingFinalize {
            mode,
            ended_at: now,
            due_at,
        });
        Some(due_at)
    }

    /// Thermostats whose finalize deadline has passed, sorted by id.
    #[must_use]
    pub fn due(&self, now: Timestamp) -> Vec<String> {
        self.tracks
            .iter()
            .filter(|(_, t)| t.pending.is_some_and(|p| p.due_at <= now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Earliest pending finalize deadline.
    #[must_use]
    pub fn next_due(&self) -> Option<Timestamp> {
        self.tracks
            .values()
            .filter_map(|t| t.pending.map(|p| p.due_at))
            .min()
    }

    /// Remove the pending finalize and its cycle. The cycle is `None` when
    /// the finalize was scheduled without a cycle ever being opened.
    pub fn take_for_finalize(&mut self, thermostat_id: &str) -> Option<(PendingFinalize, Option<CycleState>)> {
        let track = self.tracks.get_mut(thermostat_id)?;
        let pending = track.pending.take()?;
        Some((pending, track.cycle.take()))
    }

    /// Drop every pending finalize along with its ended cycle. Learning for
    /// those cycles is lost; no partial update is applied. Returns the ids.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for (id, track) in &mut self.tracks {
            if track.pending.take().is_some() {
                track.cycle = None;
                cancelled.push(id.clone());
            }
        }
        cancelled
    }

    /// Fold one adjustment pass into the live cycle, if any.
    pub fn record_adjustments(&mut self, thermostat_id: &str, adjustments: u32, movement: f64, strategy: ControlStrategy) {
        if let Some(cycle) = self
            .tracks
            .get_mut(thermostat_id)
            .and_then(|t| t.cycle.as_mut())
        {
            cycle.adjustments_applied += adjustments;
            cycle.total_movement += movement;
            cycle.strategy_used = strategy;
        }
    }

    /// Roll back a failed command's contribution to the live cycle.
    pub fn retract_adjustment(&mut self, thermostat_id: &str, movement: f64) {
        if let Some(cycle) = self
            .tracks
            .get_mut(thermostat_id)
            .and_then(|t| t.cycle.as_mut())
        {
            cycle.adjustments_applied = cycle.adjustments_applied.saturating_sub(1);
            cycle.total_movement = (cycle.total_movement - movement).max(0.0);
        }
    }

    #[must_use]
    pub fn cycle(&self, thermostat_id: &str) -> Option<&CycleState> {
        self.tracks.get(thermostat_id)?.cycle.as_ref()
    }

    #[must_use]
    pub fn pending(&self, thermostat_id: &str) -> Option<&PendingFinalize> {
        self.tracks.get(thermostat_id)?.pending.as_ref()
    }

    /// Mode of the last observation, when it was active.
    #[must_use]
    pub fn active_mode(&self, thermostat_id: &str) -> Option<HvacMode> {
        self.tracks.get(thermostat_id)?.last_mode
    }

    /// True while any thermostat's last observation was active.
    #[must_use]
    pub fn any_active(&self) -> bool {
        self.tracks.values().any(|t| t.last_mode.is_some())
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.tracks.values().any(|t| t.pending.is_some())
    }
}

/// One vent's observations at finalize time.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeVent {
    pub vent_id: String,
    pub room_name: Option<String>,
    pub start_temp: Option<f64>,
    pub start_open_percent: u8,
    pub current_temp: Option<f64>,
}

/// Where a vent's new rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Observed,
    /// Copied from an earlier vent in the same room.
    SharedRoom,
    /// No usable signal but the room reached setpoint; prior rate kept.
    SetpointReached,
    /// No usable signal from an open vent; floor rate.
    FloorRate,
    /// Closed vent with no history; seeded from the global ceiling.
    CeilingSeed,
}

impl RateSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::SharedRoom => "shared_room",
            Self::SetpointReached => "setpoint_reached",
            Self::FloorRate => "floor_rate",
            Self::CeilingSeed => "ceiling_seed",
        }
    }
}

/// A rate written during finalize.
#[derive(Debug, Clone, PartialEq)]
pub struct RateUpdate {
    pub vent_id: String,
    pub previous: Option<f64>,
    pub rate: f64,
    pub source: RateSource,
}

/// Summary of one finalize.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeOutcome {
    pub mode: HvacMode,
    pub total_running_minutes: f64,
    pub total_cycle_minutes: f64,
    pub max_running_minutes: f64,
    pub updates: Vec<RateUpdate>,
    /// Vents left unchanged (missing readings or no usable signal).
    pub skipped: Vec<String>,
    pub mean_temp_error: Option<f64>,
    pub adjustments: u32,
    pub movement: f64,
    pub strategy: ControlStrategy,
}

/// Convert one finished cycle into learned rates.
///
/// `setpoint` is the effective setpoint at finalize time, when resolvable.
/// `previous_max_running` is the thermostat's learned cycle length.
pub fn finalize_cycle(
    cycle: &CycleState,
    vents: &[FinalizeVent],
    setpoint: Option<f64>,
    previous_max_running: Option<f64>,
    now: Timestamp,
    model: &mut RateModel,
    settings: &DabSettings,
) -> FinalizeOutcome {
    let mode = cycle.mode;
    let total_running_minutes = now.minutes_since(cycle.running_start);
    let total_cycle_minutes = now.minutes_since(cycle.cycle_start);
    let max_running_minutes = rolling_average(
        Some(previous_max_running.unwrap_or(settings.max_minutes_to_setpoint)),
        total_running_minutes,
        1.0,
        RUNNING_MINUTES_WINDOW,
    );

    let mut room_rates: BTreeMap<&str, f64> = BTreeMap::new();
    let mut updates = Vec::new();
    let mut skipped = Vec::new();

    for vent in vents {
        let previous = model.learned_rate(&vent.vent_id, mode);

        if let Some(shared) = vent.room_name.as_deref().and_then(|name| room_rates.get(name)) {
            model.set_rate(&vent.vent_id, mode, *shared);
            updates.push(RateUpdate {
                vent_id: vent.vent_id.clone(),
                previous,
                rate: *shared,
                source: RateSource::SharedRoom,
            });
            continue;
        }

        let (Some(start_temp), Some(current_temp)) = (vent.start_temp, vent.current_temp) else {
            skipped.push(vent.vent_id.clone());
            continue;
        };
        let percent_open = vent.start_open_percent;
        let current_rate = previous.unwrap_or(0.0);

        let inferred = calculate_room_change_rate(
            start_temp,
            current_temp,
            total_cycle_minutes,
            percent_open,
            current_rate,
            settings,
        );
        let resolved = match inferred {
            Some(rate) if rate > 0.0 => Some((rate, RateSource::Observed)),
            _ => {
                let reached = setpoint.is_some_and(|sp| has_room_reached_setpoint(mode, sp, current_temp, 0.0));
                if reached {
                    (current_rate > 0.0).then_some((current_rate, RateSource::SetpointReached))
                } else if percent_open > 0 {
                    Some((settings.min_temp_change_rate, RateSource::FloorRate))
                } else if current_rate == 0.0 {
                    Some((model.ceiling().fallback_seed(mode, settings), RateSource::CeilingSeed))
                } else {
                    None
                }
            }
        };
        let Some((new_rate, source)) = resolved else {
            skipped.push(vent.vent_id.clone());
            continue;
        };

        let weight = f64::from(percent_open) / 100.0;
        let blended = round_big_decimal(rolling_average(previous, new_rate, weight, RATE_WINDOW), RATE_DECIMALS);
        model.set_rate(&vent.vent_id, mode, blended);
        model.ceiling_mut().observe(mode, blended);
        if let Some(name) = vent.room_name.as_deref() {
            room_rates.insert(name, blended);
        }

        if total_cycle_minutes > 0.0 && percent_open > 0 {
            let observed = (current_temp - start_temp).abs() / total_cycle_minutes;
            model.update_regression(&vent.vent_id, mode, f64::from(percent_open), observed);
        }

        updates.push(RateUpdate {
            vent_id: vent.vent_id.clone(),
            previous,
            rate: blended,
            source,
        });
    }

    let mean_temp_error = setpoint.and_then(|sp| {
        let errors: Vec<f64> = vents
            .iter()
            .filter_map(|v| v.current_temp)
            .map(|t| temp_error(mode, sp, t))
            .collect();
        (!errors.is_empty()).then(|| errors.iter().sum::<f64>() / errors.len() as f64)
    });

    FinalizeOutcome {
        mode,
        total_running_minutes,
        total_cycle_minutes,
        max_running_minutes,
        updates,
        skipped,
        mean_temp_error,
        adjustments: cycle.adjustments_applied,
        movement: cycle.total_movement,
        strategy: cycle.strategy_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> CycleStateMachine {
        CycleStateMachine::new(&DabSettings::default())
    }

    fn cycle(mode: HvacMode, start: Timestamp) -> CycleState {
        CycleState {
            mode,
            cycle_start: start,
            running_start: start,
            adjustments_applied: 3,
            total_movement: 45.0,
            strategy_used: ControlStrategy::Hybrid,
        }
    }

    fn vent(id: &str, room: &str, start: Option<f64>, open: u8, now: Option<f64>) -> FinalizeVent {
        FinalizeVent {
            vent_id: id.to_string(),
            room_name: Some(room.to_string()),
            start_temp: start,
            start_open_percent: open,
            current_temp: now,
        }
    }

    #[test]
    fn transitions_follow_observed_action() {
        let mut m = machine();
        assert_eq!(m.observe("t1", HvacAction::Idle), Transition::Idle);
        assert_eq!(m.observe("t1", HvacAction::Heating), Transition::Started(HvacMode::Heating));
        assert_eq!(m.observe("t1", HvacAction::Heating), Transition::Continued(HvacMode::Heating));
        assert!(m.any_active());
        assert_eq!(m.observe("t1", HvacAction::Unknown), Transition::Unresolved);
        assert!(m.any_active());
        assert_eq!(m.observe("t1", HvacAction::Heating), Transition::Continued(HvacMode::Heating));
        assert_eq!(m.observe("t1", HvacAction::Idle), Transition::Ended(HvacMode::Heating));
        assert!(!m.any_active());
    }

    #[test]
    fn finalize_is_scheduled_once() {
        let mut m = machine();
        m.observe("t1", HvacAction::Cooling);
        m.start_cycle("t1", HvacMode::Cooling, ControlStrategy::Hybrid, Timestamp::from_secs(0));
        m.observe("t1", HvacAction::Idle);
        let due = m.schedule_finalize("t1", HvacMode::Cooling, Timestamp::from_secs(600));
        assert_eq!(due, Some(Timestamp::from_secs(630)));
        assert_eq!(m.schedule_finalize("t1", HvacMode::Cooling, Timestamp::from_secs(605)), None);
        assert!(m.due(Timestamp::from_secs(629)).is_empty());
        assert_eq!(m.due(Timestamp::from_secs(630)), vec!["t1".to_string()]);

        let (pending, cycle) = m.take_for_finalize("t1").unwrap();
        assert_eq!(pending.ended_at, Timestamp::from_secs(600));
        assert_eq!(cycle.unwrap().mode, HvacMode::Cooling);
        assert!(m.take_for_finalize("t1").is_none());
        assert!(m.cycle("t1").is_none());
    }

    #[test]
    fn cancel_drops_pending_and_ended_cycle() {
        let mut m = machine();
        m.start_cycle("t1", HvacMode::Heating, ControlStrategy::Dab, Timestamp(0));
        m.schedule_finalize("t1", HvacMode::Heating, Timestamp(1_000));
        m.start_cycle("t2", HvacMode::Cooling, ControlStrategy::Dab, Timestamp(0));
        assert_eq!(m.cancel_pending(), vec!["t1".to_string()]);
        assert!(m.cycle("t1").is_none());
        assert!(m.cycle("t2").is_some());
        assert!(!m.has_pending());
    }

    #[test]
    fn adjustments_accumulate_into_live_cycle() {
        let mut m = machine();
        m.record_adjustments("t1", 2, 30.0, ControlStrategy::Cost);
        assert!(m.cycle("t1").is_none());
        m.start_cycle("t1", HvacMode::Heating, ControlStrategy::Hybrid, Timestamp(0));
        m.record_adjustments("t1", 2, 30.0, ControlStrategy::Cost);
        m.record_adjustments("t1", 1, 10.0, ControlStrategy::Cost);
        m.retract_adjustment("t1", 10.0);
        let c = m.cycle("t1").unwrap();
        assert_eq!(c.adjustments_applied, 2);
        assert!((c.total_movement - 30.0).abs() < 1e-12);
        assert_eq!(c.strategy_used, ControlStrategy::Cost);
    }

    #[test]
    fn finalize_learns_observed_rate() {
        let settings = DabSettings::default();
        let mut model = RateModel::new();
        let start = Timestamp::from_secs(0);
        let now = Timestamp::from_secs(20 * 60);
        // 2 degrees in 20 minutes at 100%: rate 0.1, normalized 1.0.
        let vents = [vent("v1", "Office", Some(20.0), 100, Some(22.0))];
        let out = finalize_cycle(&cycle(HvacMode::Heating, start), &vents, Some(24.7), None, now, &mut model, &settings);

        assert_eq!(out.updates.len(), 1);
        assert_eq!(out.updates[0].source, RateSource::Observed);
        assert_eq!(model.get_rate("v1", HvacMode::Heating), 1.0);
        assert_eq!(model.ceiling().get(HvacMode::Heating), Some(1.0));
        let stats = model.regression_stats("v1", HvacMode::Heating).unwrap();
        assert_eq!(stats.n, 1);
        assert!((stats.sum_y - 0.1).abs() < 1e-12);
        // (60 * 5 + 20) / 6
        assert!((out.max_running_minutes - 320.0 / 6.0).abs() < 1e-9);
        assert!((out.mean_temp_error.unwrap() - 2.7).abs() < 1e-9);
        assert_eq!(out.adjustments, 3);
    }

    #[test]
    fn finalize_blends_with_prior_rate() {
        let settings = DabSettings::default();
        let mut model = RateModel::new();
        model.set_rate("v1", HvacMode::Cooling, 0.5);
        let vents = [vent("v1", "Office", Some(26.0), 50, Some(25.0))];
        let now = Timestamp::from_secs(10 * 60);
        finalize_cycle(&cycle(HvacMode::Cooling, Timestamp(0)), &vents, Some(23.3), None, now, &mut model, &settings);
        // observed 0.1/min, max(0.1, 0.5) = 0.5, (0.2) / 0.5 = 0.4
        // rolling_average(0.5, 0.4, 0.5, 4) = (0.5 * 4 + (-0.1 * 0.5)) / 4 = 0.4875
        assert!((model.get_rate("v1", HvacMode::Cooling) - 0.4875).abs() < 1e-12);
    }

    #[test]
    fn rooms_with_multiple_vents_share_one_rate() {
        let settings = DabSettings::default();
        let mut model = RateModel::new();
        let vents = [
            vent("v1", "Office", Some(20.0), 100, Some(22.0)),
            vent("v2", "Office", Some(20.0), 20, Some(20.5)),
        ];
        let now = Timestamp::from_secs(20 * 60);
        let out = finalize_cycle(&cycle(HvacMode::Heating, Timestamp(0)), &vents, Some(24.7), None, now, &mut model, &settings);
        assert_eq!(out.updates[1].source, RateSource::SharedRoom);
        assert_eq!(model.get_rate("v2", HvacMode::Heating), model.get_rate("v1", HvacMode::Heating));
        assert!(model.regression_stats("v2", HvacMode::Heating).is_none());
    }

    #[test]
    fn fallbacks_when_no_signal() {
        let settings = DabSettings::default();
        let mut model = RateModel::new();
        model.set_rate("reached", HvacMode::Heating, 0.3);
        model.set_rate("closed-known", HvacMode::Heating, 0.2);
        let vents = [
            // Too short a cycle for every vent: 3 minutes.
            vent("reached", "A", Some(24.0), 50, Some(25.0)),
            vent("open", "B", Some(20.0), 40, Some(20.5)),
            vent("closed-new", "C", Some(20.0), 0, Some(20.5)),
            vent("closed-known", "D", Some(20.0), 0, Some(20.5)),
            vent("blind", "E", None, 50, Some(20.5)),
        ];
        let now = Timestamp::from_secs(3 * 60);
        let out = finalize_cycle(&cycle(HvacMode::Heating, Timestamp(0)), &vents, Some(24.7), None, now, &mut model, &settings);

        let source = |id: &str| out.updates.iter().find(|u| u.vent_id == id).map(|u| u.source);
        assert_eq!(source("reached"), Some(RateSource::SetpointReached));
        assert_eq!(model.get_rate("reached", HvacMode::Heating), 0.3);
        assert_eq!(source("open"), Some(RateSource::FloorRate));
        assert_eq!(model.get_rate("open", HvacMode::Heating), 0.001);
        assert_eq!(source("closed-new"), Some(RateSource::CeilingSeed));
        // Ceiling is 0.3 after "reached", seed 10% of it, weight 0 keeps the seed.
        assert!((model.get_rate("closed-new", HvacMode::Heating) - 0.03).abs() < 1e-12);
        assert_eq!(source("closed-known"), None);
        assert_eq!(model.get_rate("closed-known", HvacMode::Heating), 0.2);
        assert_eq!(out.skipped, vec!["closed-known".to_string(), "blind".to_string()]);
    }

    #[test]
    fn reached_setpoint_without_history_is_skipped() {
        let settings = DabSettings::default();
        let mut model = RateModel::new();
        let vents = [vent("v1", "A", Some(24.0), 50, Some(25.0))];
        let out = finalize_cycle(
            &cycle(HvacMode::Heating, Timestamp(0)),
            &vents,
            Some(24.7),
            Some(30.0),
            Timestamp::from_secs(60),
            &mut model,
            &settings,
        );
        assert!(out.updates.is_empty());
        assert_eq!(model.learned_rate("v1", HvacMode::Heating), None);
    }
}
