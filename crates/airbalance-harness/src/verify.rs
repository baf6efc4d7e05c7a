//! Verification results and their summary.

use serde::{Deserialize, Serialize};

/// Outcome of one fixture case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub family: String,
    pub case_name: String,
    pub function: String,
    pub passed: bool,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
    /// Human-readable mismatch description, when the case failed.
    pub diff: Option<String>,
}

/// Aggregate over a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<VerificationResult>,
}

impl VerificationSummary {
    #[must_use]
    pub fn from_results(results: Vec<VerificationResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Markdown table of every case.
    #[must_use]
    pub fn to_markdown(&self, title: &str) -> String {
        let mut out = format!(
            "# {title}\n\n- total: {}\n- passed: {}\n- failed: {}\n\n| family | case | function | status |\n|---|---|---|---|\n",
            self.total, self.passed, self.failed
        );
        for r in &self.results {
            let status = if r.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!("| {} | {} | {} | {status} |\n", r.family, r.case_name, r.function));
        }
        let failures: Vec<_> = self.results.iter().filter(|r| !r.passed).collect();
        if !failures.is_empty() {
            out.push_str("\n## Failures\n\n");
            for r in failures {
                out.push_str(&format!(
                    "- `{}`: {}\n",
                    r.case_name,
                    r.diff.as_deref().unwrap_or("mismatch")
                ));
            }
        }
        out
    }
}
