//! Dynamic Airflow Balancing (DAB) engine.
//!
//! This crate provides:
//! - Rate learning: per-vent, per-mode thermal rates plus streaming regression stats
//! - Target computation: exponential, linear-cost, regression and hybrid strategies
//! - Airflow safety: minimum combined-flow redistribution across managed and conventional vents
//! - Cycle tracking: per-thermostat HVAC lifecycle with a deferred, deterministic finalize
//! - Adjustment gating: debounce and override rules deciding which vents get commanded
//! - Ambient plumbing: JSONL event log, checksummed state store, bounded command dispatch

#![deny(unsafe_code)]

pub mod airflow;
pub mod config;
pub mod control_loop;
pub mod cost;
pub mod cycle;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod export;
pub mod gate;
pub mod hvac;
pub mod math;
pub mod metrics;
pub mod persistence;
pub mod rate_model;
pub mod snapshot;
pub mod structured_log;
pub mod units;

pub use config::{ControlStrategy, DabSettings, EngineConfig, VentAssignment};
pub use control_loop::{ControlLoop, SnapshotSource, TickReport};
pub use dispatch::{CommandOutcome, DispatchReport, VentCommander};
pub use engine::{Engine, PollReport, SetVentPosition};
pub use error::{CommandError, EngineError, FetchError, ImportError, PersistenceError};
pub use export::{EfficiencyExport, ImportSummary};
pub use persistence::{LearnedState, StateStore};
pub use rate_model::{GlobalRateCeiling, RateEntry, RateModel, RegressionStats};
pub use snapshot::{RoomReading, SensorReading, Snapshot, ThermostatReading, VentReading};
pub use units::{HvacAction, HvacMode, TemperatureUnit, ThermostatMode, Timestamp};
