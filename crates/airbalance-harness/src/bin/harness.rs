//! CLI entrypoint for the airbalance harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use airbalance_core::structured_log::{LogEmitter, validate_log_file};
use airbalance_core::{Engine, EngineConfig, Snapshot, StateStore, Timestamp};
use airbalance_harness::{FixtureSet, HarnessError, Scenario, TestRunner, VerificationSummary};

/// Verification and state tooling for the airbalance engine.
#[derive(Debug, Parser)]
#[command(name = "airbalance-harness")]
#[command(about = "Fixture verification, scenario simulation and state tooling for airbalance")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate engine functions against reference fixtures.
    VerifyFixtures {
        /// Directory containing fixture JSON files.
        #[arg(long, default_value = "crates/airbalance-harness/fixtures")]
        fixture: PathBuf,
        /// Output report path (markdown). A JSON copy is written alongside.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Replay a scripted scenario through the control loop.
    Simulate {
        /// Scenario JSON path.
        #[arg(long)]
        scenario: PathBuf,
        /// Structured JSONL log output path (if omitted, the log goes to stderr).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Learned-state file to load before and save during the replay.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Output JSON report path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Export learned efficiencies from a state file.
    ExportEfficiency {
        /// Learned-state file.
        #[arg(long)]
        state: PathBuf,
        /// Engine configuration JSON (for the structure id).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Snapshot JSON used to attach room ids and names.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import an efficiency export into a state file.
    ImportEfficiency {
        /// Learned-state file, updated in place.
        #[arg(long)]
        state: PathBuf,
        /// Efficiency export JSON.
        #[arg(long)]
        input: PathBuf,
        /// Snapshot JSON used to match entries to vents.
        #[arg(long)]
        snapshot: PathBuf,
        /// Engine configuration JSON.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a JSONL event log against the required-field schema.
    ValidateLog {
        /// JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, HarnessError> {
    let content = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| HarnessError::Json {
        path: path.display().to_string(),
        source,
    })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, HarnessError> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn write_or_print(output: Option<&Path>, text: &str) -> Result<(), HarnessError> {
    match output {
        Some(path) => std::fs::write(path, text).map_err(|source| HarnessError::Io {
            path: path.display().to_string(),
            source,
        }),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn run_id() -> String {
    format!("harness-{}", std::process::id())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::VerifyFixtures { fixture, report } => {
            eprintln!("Verifying against fixtures in {}", fixture.display());
            let sets = FixtureSet::load_dir(&fixture)?;
            let mut results = TestRunner::new("fixture-verify").run_all(&sets);
            results.sort_by(|a, b| {
                a.family
                    .cmp(&b.family)
                    .then_with(|| a.case_name.cmp(&b.case_name))
            });
            let summary = VerificationSummary::from_results(results);
            eprintln!(
                "Verification complete: total={}, passed={}, failed={}",
                summary.total, summary.passed, summary.failed
            );
            if let Some(report_path) = report {
                eprintln!("Writing report to {}", report_path.display());
                std::fs::write(&report_path, summary.to_markdown("airbalance fixture verification"))?;
                std::fs::write(
                    report_path.with_extension("json"),
                    serde_json::to_string_pretty(&summary)?,
                )?;
            }
            if !summary.all_passed() {
                return Err("Fixture verification failed".into());
            }
        }
        Command::Simulate {
            scenario,
            log,
            state,
            output,
        } => {
            let scenario = Scenario::from_file(&scenario)?;
            let emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id())?,
                None => LogEmitter::to_stderr(&run_id()),
            };
            let report = scenario.run(emitter, state.map(StateStore::new))?;
            eprintln!(
                "Scenario {}: {} steps, {} commands",
                report.name,
                report.steps.len(),
                report.command_count()
            );
            write_or_print(output.as_deref(), &serde_json::to_string_pretty(&report)?)?;
        }
        Command::ExportEfficiency {
            state,
            config,
            snapshot,
            output,
        } => {
            let mut engine = Engine::new(load_config(config.as_deref())?);
            engine.restore(StateStore::new(state).load()?);
            let snapshot: Option<Snapshot> = snapshot.as_deref().map(read_json).transpose()?;
            let export = engine.export_efficiency(snapshot.as_ref(), Timestamp::now());
            write_or_print(output.as_deref(), &export.to_json_pretty()?)?;
        }
        Command::ImportEfficiency {
            state,
            input,
            snapshot,
            config,
        } => {
            let store = StateStore::new(state);
            let mut engine = Engine::new(load_config(config.as_deref())?)
                .with_log(LogEmitter::to_stderr(&run_id()));
            engine.restore(store.load()?);
            let payload: serde_json::Value = read_json(&input)?;
            let snapshot: Snapshot = read_json(&snapshot)?;
            let summary = engine.import_efficiency(&payload, &snapshot, Timestamp::now())?;
            store.save(&engine.learned_state())?;
            eprintln!(
                "Imported {} of {} entries ({} unmatched) into {}",
                summary.applied,
                summary.entries,
                summary.unmatched,
                store.path().display()
            );
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{} lines checked, {} errors", lines, errors.len());
            if !errors.is_empty() {
                return Err("Log validation failed".into());
            }
        }
    }

    Ok(())
}
