use std::path::PathBuf;

use airbalance_harness::{FixtureSet, TestRunner, VerificationSummary};

fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

#[test]
fn bundled_fixtures_all_pass() {
    let sets = FixtureSet::load_dir(&fixture_dir()).expect("fixture directory loads");
    assert!(!sets.is_empty());

    let summary = VerificationSummary::from_results(TestRunner::new("ci").run_all(&sets));
    let failures: Vec<_> = summary
        .results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| format!("{}: {}", r.case_name, r.diff.as_deref().unwrap_or("?")))
        .collect();
    assert!(failures.is_empty(), "failing cases: {failures:#?}");
    assert_eq!(summary.total, summary.passed);
}

#[test]
fn report_lists_every_case() {
    let sets = FixtureSet::load_dir(&fixture_dir()).unwrap();
    let summary = VerificationSummary::from_results(TestRunner::new("ci").run_all(&sets));
    let markdown = summary.to_markdown("fixtures");
    assert!(markdown.starts_with("# fixtures"));
    assert!(markdown.contains("| dab/math | redistribute_two_vents_no_conventional | redistribute | PASS |"));
    assert!(!markdown.contains("## Failures"));
}

#[test]
fn missing_directory_is_an_error() {
    let err = FixtureSet::load_dir(&fixture_dir().join("does-not-exist")).unwrap_err();
    assert!(err.to_string().contains("does-not-exist"));
}
