//! Debounce rules deciding which computed targets become commands.
//!
//! A target is rounded to the configured granularity first. Small or recent
//! changes are suppressed unless the room is far enough from its setpoint,
//! or the change reopens an inactive room for airflow safety.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::math::round_to_nearest_multiple;
use crate::units::Timestamp;

/// Per-vent state that outlives a single pass.
///
/// `starting_*` are captured when a cycle starts and read at finalize.
/// `last_commanded_*` persist across cycles for the interval debounce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VentRuntimeState {
    pub starting_temp: Option<f64>,
    pub starting_open_percent: u8,
    pub last_commanded_percent: Option<u8>,
    pub last_commanded_at: Option<Timestamp>,
    #[serde(skip)]
    rollback: Option<(Option<u8>, Option<Timestamp>)>,
}

impl VentRuntimeState {
    /// Capture cycle-start conditions.
    pub fn start_cycle(&mut self, temp: Option<f64>, open_percent: u8) {
        self.starting_temp = temp;
        self.starting_open_percent = open_percent;
    }

    /// Record an emitted command, remembering the previous record for rollback.
    pub fn record_command(&mut self, percent: u8, now: Timestamp) {
        self.rollback = Some((self.last_commanded_percent, self.last_commanded_at));
        self.last_commanded_percent = Some(percent);
        self.last_commanded_at = Some(now);
    }

    /// Undo the most recent [`record_command`](Self::record_command).
    /// Returns false when there is nothing to undo.
    pub fn forget_command(&mut self) -> bool {
        match self.rollback.take() {
            Some((percent, at)) => {
                self.last_commanded_percent = percent;
                self.last_commanded_at = at;
                true
            }
            None => false,
        }
    }
}

/// Why a change bypassed debouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideReason {
    TempError,
    InactiveRoomSafety,
}

/// Why a change was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    BelowMinimumChange,
    WithinInterval,
}

impl SuppressReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BelowMinimumChange => "below_minimum_change",
            Self::WithinInterval => "within_interval",
        }
    }
}

/// Outcome of gating one vent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Rounded target equals the current opening.
    Unchanged { percent: u8 },
    Suppressed { percent: u8, reason: SuppressReason },
    Command {
        percent: u8,
        movement: u8,
        override_reason: Option<OverrideReason>,
    },
}

/// Debounce policy derived from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentGate {
    pub granularity: u32,
    pub min_adjustment_percent: u32,
    pub min_interval_minutes: u32,
    pub temp_error_override: f64,
    pub close_inactive: bool,
}

impl AdjustmentGate {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            granularity: config.vent_granularity,
            min_adjustment_percent: config.min_adjustment_percent,
            min_interval_minutes: config.min_adjustment_interval_minutes,
            temp_error_override: config.temp_error_override,
            close_inactive: config.close_inactive_rooms,
        }
    }

    /// Round a raw target to the configured granularity, within `0..=100`.
    #[must_use]
    pub fn round_target(&self, target: f64) -> u8 {
        round_to_nearest_multiple(target, self.granularity).clamp(0, 100) as u8
    }

    /// Decide whether `target` should be sent to a vent currently at `current`.
    #[must_use]
    pub fn evaluate(
        &self,
        target: f64,
        current: u8,
        temp_error: f64,
        room_active: bool,
        runtime: Option<&VentRuntimeState>,
        now: Timestamp,
    ) -> GateDecision {
        let percent = self.round_target(target);
        if percent == current {
            return GateDecision::Unchanged { percent };
        }

        let override_reason = if temp_error >= self.temp_error_override {
            Some(OverrideReason::TempError)
        } else if self.close_inactive && !room_active && percent > 0 {
            Some(OverrideReason::InactiveRoomSafety)
        } else {
            None
        };

        let movement = percent.abs_diff(current);
        if override_reason.is_none() {
            if self.min_adjustment_percent > 0 && u32::from(movement) < self.min_adjustment_percent {
                return GateDecision::Suppressed {
                    percent,
                    reason: SuppressReason::BelowMinimumChange,
                };
            }
            let last = runtime.and_then(|state| state.last_commanded_at);
            if let Some(last) = last
                && now.minutes_since(last) < f64::from(self.min_interval_minutes)
            {
                return GateDecision::Suppressed {
                    percent,
                    reason: SuppressReason::WithinInterval,
                };
            }
        }

        GateDecision::Command {
            percent,
            movement,
            override_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AdjustmentGate {
        AdjustmentGate::from_config(&EngineConfig::default())
    }

    fn commanded_at(percent: u8, at: Timestamp) -> VentRuntimeState {
        let mut state = VentRuntimeState::default();
        state.record_command(percent, at);
        state
    }

    #[test]
    fn rounds_to_granularity_and_clamps() {
        let g = gate();
        assert_eq!(g.round_target(12.5), 15);
        assert_eq!(g.round_target(12.4), 10);
        assert_eq!(g.round_target(-3.0), 0);
        let coarse = AdjustmentGate { granularity: 30, ..gate() };
        assert_eq!(coarse.round_target(100.0), 90);
        let odd = AdjustmentGate { granularity: 7, ..gate() };
        assert_eq!(odd.round_target(99.0), 98);
        assert_eq!(odd.round_target(102.0), 100);
    }

    #[test]
    fn unchanged_target_is_skipped() {
        let decision = gate().evaluate(51.0, 50, 0.0, true, None, Timestamp(0));
        assert_eq!(decision, GateDecision::Unchanged { percent: 50 });
    }

    #[test]
    fn recent_small_change_is_suppressed() {
        let now = Timestamp::from_secs(10_000);
        let state = commanded_at(50, Timestamp::from_secs(9_999));
        let decision = gate().evaluate(53.0, 50, 0.1, true, Some(&state), now);
        assert_eq!(
            decision,
            GateDecision::Suppressed {
                percent: 55,
                reason: SuppressReason::BelowMinimumChange
            }
        );
    }

    #[test]
    fn interval_debounce() {
        let g = gate();
        let state = commanded_at(20, Timestamp::from_secs(0));
        let soon = Timestamp::from_secs(29 * 60);
        assert_eq!(
            g.evaluate(80.0, 20, 0.0, true, Some(&state), soon),
            GateDecision::Suppressed {
                percent: 80,
                reason: SuppressReason::WithinInterval
            }
        );
        let later = Timestamp::from_secs(30 * 60);
        assert!(matches!(
            g.evaluate(80.0, 20, 0.0, true, Some(&state), later),
            GateDecision::Command { percent: 80, movement: 60, override_reason: None }
        ));
    }

    #[test]
    fn temp_error_overrides_debounce() {
        let state = commanded_at(50, Timestamp::from_secs(0));
        let decision = gate().evaluate(55.0, 50, 0.6, true, Some(&state), Timestamp::from_secs(1));
        assert_eq!(
            decision,
            GateDecision::Command {
                percent: 55,
                movement: 5,
                override_reason: Some(OverrideReason::TempError)
            }
        );
    }

    #[test]
    fn reopening_inactive_room_bypasses_debounce() {
        let state = commanded_at(0, Timestamp::from_secs(0));
        let decision = gate().evaluate(5.0, 0, 0.0, false, Some(&state), Timestamp::from_secs(1));
        assert!(matches!(
            decision,
            GateDecision::Command {
                override_reason: Some(OverrideReason::InactiveRoomSafety),
                ..
            }
        ));
        let policy_off = AdjustmentGate { close_inactive: false, ..gate() };
        assert!(matches!(
            policy_off.evaluate(5.0, 0, 0.0, false, Some(&state), Timestamp::from_secs(1)),
            GateDecision::Suppressed { .. }
        ));
    }

    #[test]
    fn forget_command_restores_previous_record() {
        let mut state = commanded_at(40, Timestamp::from_secs(5));
        state.record_command(70, Timestamp::from_secs(50));
        assert!(state.forget_command());
        assert_eq!(state.last_commanded_percent, Some(40));
        assert_eq!(state.last_commanded_at, Some(Timestamp::from_secs(5)));
        assert!(!state.forget_command());

        let mut fresh = VentRuntimeState::default();
        fresh.record_command(30, Timestamp::from_secs(1));
        assert!(fresh.forget_command());
        assert_eq!(fresh.last_commanded_at, None);
    }
}
