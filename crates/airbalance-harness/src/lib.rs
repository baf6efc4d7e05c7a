//! Verification and operator tooling for the airbalance engine.
//!
//! This crate provides:
//! - Fixture verify: evaluate the engine's numeric helpers against JSON reference values
//! - Scenario simulation: replay a scripted sequence of snapshots through the control loop
//! - State tooling: efficiency export/import against a persisted state file

#![forbid(unsafe_code)]

pub mod error;
pub mod fixtures;
pub mod runner;
pub mod scenario;
pub mod verify;

pub use error::HarnessError;
pub use fixtures::{FixtureCase, FixtureSet};
pub use runner::TestRunner;
pub use scenario::{Scenario, ScenarioReport};
pub use verify::{VerificationResult, VerificationSummary};
