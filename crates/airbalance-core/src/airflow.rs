//! Minimum combined-airflow enforcement.
//!
//! Closing too many registers on one duct system starves the air handler.
//! After targets are computed, the mean opening across managed vents plus
//! conventional vents (counted at their fixed default opening) must reach
//! `min_combined_vent_flow`. When it does not, openings are raised in small
//! steps weighted toward the rooms furthest from comfort: hotter rooms when
//! cooling, colder rooms when heating.

use std::collections::BTreeMap;

use crate::config::DabSettings;
use crate::units::HvacMode;

const FALLBACK_MIN_TEMP: f64 = 20.0;
const FALLBACK_MAX_TEMP: f64 = 25.0;

/// What one redistribution pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RedistributionReport {
    /// Mean opening across managed and conventional vents before the pass.
    pub combined_before: f64,
    /// Percentage points added across all managed vents.
    pub added: f64,
    pub iterations: u32,
}

impl RedistributionReport {
    #[must_use]
    pub fn adjusted(&self) -> bool {
        self.added > 0.0
    }
}

/// Raises targets until the duct system's combined flow meets the floor.
#[derive(Debug, Clone, Copy)]
pub struct AirflowRedistributor<'a> {
    settings: &'a DabSettings,
}

impl<'a> AirflowRedistributor<'a> {
    #[must_use]
    pub const fn new(settings: &'a DabSettings) -> Self {
        Self { settings }
    }

    /// Redistribute in place.
    ///
    /// `temps` lists each managed vent with its room temperature, in the order
    /// increments are handed out. `targets` holds the computed openings; vents
    /// missing from it count as closed. No vent is pushed above 100%, and the
    /// pass stops after `max_iterations` rounds even if the floor is unmet.
    pub fn redistribute(
        &self,
        temps: &[(&str, f64)],
        mode: HvacMode,
        targets: &mut BTreeMap<String, f64>,
        conventional_vents: u32,
    ) -> RedistributionReport {
        let s = self.settings;
        let mut device_count = f64::from(conventional_vents);
        let mut sum = device_count * s.standard_vent_default_open;
        for percent in targets.values() {
            device_count += 1.0;
            sum += *percent;
        }
        if device_count <= 0.0 {
            return RedistributionReport::default();
        }

        let combined = sum / device_count;
        let mut report = RedistributionReport {
            combined_before: combined,
            ..RedistributionReport::default()
        };
        if combined >= s.min_combined_vent_flow {
            return report;
        }

        let (min_temp, max_temp) = temperature_bounds(temps, s.temp_boundary_adjustment);
        let span = max_temp - min_temp;
        let mut deficit = s.min_combined_vent_flow * device_count - sum;

        while deficit > 0.0 && report.iterations < s.max_iterations {
            report.iterations += 1;
            for (vent_id, temp) in temps {
                let current = targets.get(*vent_id).copied().unwrap_or(0.0);
                if current >= 100.0 {
                    continue;
                }
                let proportion = if span == 0.0 {
                    0.0
                } else {
                    match mode {
                        HvacMode::Cooling => (temp - min_temp) / span,
                        HvacMode::Heating => (max_temp - temp) / span,
                    }
                };
                let next = (current + s.increment_percentage * proportion).min(100.0);
                let step = next - current;
                targets.insert((*vent_id).to_string(), next);
                report.added += step;
                deficit -= step;
                if deficit <= 0.0 {
                    break;
                }
            }
        }
        report
    }
}

fn temperature_bounds(temps: &[(&str, f64)], pad: f64) -> (f64, f64) {
    if temps.is_empty() {
        return (FALLBACK_MIN_TEMP, FALLBACK_MAX_TEMP);
    }
    let (lo, hi) = temps
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, t)| (lo.min(*t), hi.max(*t)));
    (lo - pad, hi + pad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        temps: &[(&str, f64)],
        percents: &[(&str, f64)],
        mode: HvacMode,
        conventional: u32,
    ) -> (BTreeMap<String, f64>, RedistributionReport) {
        let settings = DabSettings::default();
        let mut targets: BTreeMap<String, f64> =
            percents.iter().map(|(id, p)| ((*id).to_string(), *p)).collect();
        let report = AirflowRedistributor::new(&settings).redistribute(temps, mode, &mut targets, conventional);
        (targets, report)
    }

    const SEVEN_TEMPS: [(&str, f64); 7] = [
        ("122127", 80.0),
        ("122129", 70.0),
        ("122128", 75.0),
        ("122133", 72.0),
        ("129424", 78.0),
        ("122132", 79.0),
        ("122131", 76.0),
    ];

    #[test]
    fn empty_input_is_untouched() {
        let (targets, report) = run(&[], &[], HvacMode::Cooling, 5);
        assert!(targets.is_empty());
        assert!(!report.adjusted());
    }

    #[test]
    fn satisfied_floor_is_untouched() {
        let (targets, report) = run(&[("a", 22.0), ("b", 24.0)], &[("a", 40.0), ("b", 20.0)], HvacMode::Cooling, 0);
        assert_eq!(targets["a"], 40.0);
        assert_eq!(targets["b"], 20.0);
        assert_eq!(report.iterations, 0);
        assert!((report.combined_before - 30.0).abs() < 1e-12);
    }

    #[test]
    fn single_vent_reference_value() {
        let (targets, _) = run(&[("122127", 80.0)], &[("122127", 5.0)], HvacMode::Cooling, 0);
        assert!((targets["122127"] - 30.5).abs() < 0.01);
    }

    #[test]
    fn multiple_vents_reference_values() {
        let percents = [
            ("122127", 10.0),
            ("122129", 5.0),
            ("122128", 10.0),
            ("122133", 25.0),
            ("129424", 100.0),
            ("122132", 5.0),
            ("122131", 5.0),
        ];
        let (targets, _) = run(&SEVEN_TEMPS, &percents, HvacMode::Cooling, 0);
        let expected = [
            ("122127", 26.338_235_293_6),
            ("122129", 5.161_764_706_4),
            ("122128", 18.25),
            ("122133", 28.088_235_293_5),
            ("129424", 100.0),
            ("122132", 18.382_352_940_5),
            ("122131", 13.970_588_235_5),
        ];
        for (id, value) in expected {
            assert!((targets[id] - value).abs() < 0.01, "{id}: {}", targets[id]);
        }
    }

    #[test]
    fn conventional_vents_reference_values() {
        let percents = [
            ("122127", 0.0),
            ("122129", 5.0),
            ("122128", 0.0),
            ("122133", 5.0),
            ("129424", 20.0),
            ("122132", 0.0),
            ("122131", 5.0),
        ];
        let (targets, _) = run(&SEVEN_TEMPS, &percents, HvacMode::Cooling, 4);
        let expected = [
            ("122127", 23.764_705_881_6),
            ("122129", 5.235_294_118_4),
            ("122128", 12.0),
            ("122133", 9.941_176_469_6),
            ("129424", 39.058_823_530_4),
            ("122132", 21.411_764_704_8),
            ("122131", 19.352_941_176_8),
        ];
        for (id, value) in expected {
            assert!((targets[id] - value).abs() < 0.01, "{id}: {}", targets[id]);
        }
    }

    #[test]
    fn cooling_favors_hot_rooms_heating_favors_cold_rooms() {
        let temps = [("hot", 30.0), ("cold", 15.0)];
        let percents = [("hot", 5.0), ("cold", 5.0)];
        let (cooling, _) = run(&temps, &percents, HvacMode::Cooling, 0);
        assert!(cooling["hot"] > cooling["cold"]);
        let (heating, _) = run(&temps, &percents, HvacMode::Heating, 0);
        assert!(heating["cold"] > heating["hot"]);
    }

    #[test]
    fn identical_temperatures_exit_via_iteration_cap() {
        let temps = [("a", 22.0), ("b", 22.0)];
        // Bounds are padded, so identical temperatures still give proportion 0.5.
        let (targets, report) = run(&temps, &[("a", 0.0), ("b", 0.0)], HvacMode::Cooling, 0);
        assert!(targets["a"] > 0.0);
        assert!(report.iterations < DabSettings::default().max_iterations);

        let mut settings = DabSettings::default();
        settings.temp_boundary_adjustment = 0.0;
        let mut flat: BTreeMap<String, f64> = [("a".to_string(), 0.0), ("b".to_string(), 0.0)].into();
        let report = AirflowRedistributor::new(&settings).redistribute(&temps, HvacMode::Cooling, &mut flat, 0);
        assert_eq!(report.iterations, settings.max_iterations);
        assert_eq!(flat["a"], 0.0);
    }

    #[test]
    fn never_exceeds_one_hundred_percent() {
        let temps = [("hot", 30.0), ("c1", 20.0), ("c2", 20.0), ("c3", 20.0), ("c4", 20.0)];
        let percents = [("hot", 99.5), ("c1", 0.0), ("c2", 0.0), ("c3", 0.0), ("c4", 0.0)];
        let (targets, _) = run(&temps, &percents, HvacMode::Cooling, 0);
        assert!(targets.values().all(|p| *p <= 100.0));
        assert_eq!(targets["hot"], 100.0);
    }

    #[test]
    fn overshoot_is_bounded_by_one_increment() {
        let settings = DabSettings::default();
        let temps: Vec<(String, f64)> = (0..10).map(|i| (format!("vent{i}"), 20.0 + f64::from(i))).collect();
        let temps_ref: Vec<(&str, f64)> = temps.iter().map(|(id, t)| (id.as_str(), *t)).collect();
        let percents: Vec<(&str, f64)> = temps_ref.iter().map(|(id, _)| (*id, 1.0)).collect();
        let (targets, report) = run(&temps_ref, &percents, HvacMode::Cooling, 0);
        assert_eq!(targets.len(), 10);
        assert!(targets.values().all(|p| *p > 1.0));
        let combined: f64 = targets.values().sum::<f64>() / 10.0;
        assert!(combined >= settings.min_combined_vent_flow);
        assert!(combined <= settings.min_combined_vent_flow + settings.increment_percentage);
        assert!(report.adjusted());
    }
}
