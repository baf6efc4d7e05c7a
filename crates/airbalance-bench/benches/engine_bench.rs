//! Control-pass benchmarks.

use std::collections::BTreeMap;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};

use airbalance_core::airflow::AirflowRedistributor;
use airbalance_core::cost::{exponential_open_percent, linear_open_percent};
use airbalance_core::{DabSettings, Engine, EngineConfig, HvacMode, Snapshot, ThermostatReading, Timestamp};

/// One heating thermostat serving `vents` rooms spread between 18 and 23 °C.
fn house(vents: usize) -> (EngineConfig, Snapshot) {
    let mut config = EngineConfig::default();
    let mut snapshot = Snapshot::new().with_thermostat("t1", ThermostatReading::heating(20.0, 24.0));
    for i in 0..vents {
        let vent = format!("v{i}");
        let room = format!("r{i}");
        let temp = 18.0 + (i % 11) as f64 * 0.5;
        config = config.with_vent(vent.as_str(), "t1");
        snapshot = snapshot
            .with_room(room.as_str(), format!("Room {i}"), Some(temp))
            .with_vent(vent, room, Some(50));
    }
    (config, snapshot)
}

fn bench_poll_cycle_start(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll_cycle_start");
    for vents in [4usize, 16, 64] {
        let (config, snapshot) = house(vents);
        group.bench_with_input(BenchmarkId::from_parameter(vents), &vents, |b, _| {
            b.iter_batched(
                || Engine::new(config.clone()),
                |mut engine| criterion::black_box(engine.poll(&snapshot, Timestamp::from_secs(600))),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_redistribute(c: &mut Criterion) {
    let settings = DabSettings::default();
    let mut group = c.benchmark_group("redistribute");
    for vents in [2usize, 8, 32] {
        let temps: Vec<(String, f64)> = (0..vents)
            .map(|i| (format!("v{i}"), 18.0 + i as f64 * 0.25))
            .collect();
        let targets: BTreeMap<String, f64> = temps.iter().map(|(id, _)| (id.clone(), 0.0)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(vents), &vents, |b, _| {
            let temps: Vec<(&str, f64)> = temps.iter().map(|(id, t)| (id.as_str(), *t)).collect();
            b.iter_batched(
                || targets.clone(),
                |mut targets| {
                    let report = AirflowRedistributor::new(&settings).redistribute(&temps, HvacMode::Heating, &mut targets, 0);
                    criterion::black_box((targets, report))
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_open_percent(c: &mut Criterion) {
    let settings = DabSettings::default();
    let mut group = c.benchmark_group("open_percent");
    group.bench_function("exponential", |b| {
        b.iter(|| {
            exponential_open_percent(
                criterion::black_box(20.0),
                24.7,
                HvacMode::Heating,
                0.5,
                9.4,
                &settings,
            )
        });
    });
    group.bench_function("linear", |b| {
        b.iter(|| linear_open_percent(criterion::black_box(20.0), 24.7, 0.5, 9.4));
    });
    group.finish();
}

criterion_group!(benches, bench_poll_cycle_start, bench_redistribute, bench_open_percent);
criterion_main!(benches);
