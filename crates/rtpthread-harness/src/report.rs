//! Scenario reports.

use serde::{Deserialize, Serialize};

/// Outcome of one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub elapsed_us: u64,
    /// Failure detail; absent when the scenario passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    /// Diagnostic lock timeout in milliseconds; `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
    pub passed: usize,
    pub failed: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn new(lock_timeout_ms: Option<u64>, scenarios: Vec<ScenarioReport>) -> Self {
        let passed = scenarios.iter().filter(|s| s.passed).count();
        Self {
            lock_timeout_ms,
            passed,
            failed: scenarios.len() - passed,
            scenarios,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_serializes() {
        let report = SuiteReport::new(
            Some(250),
            vec![
                ScenarioReport {
                    name: "a".into(),
                    passed: true,
                    elapsed_us: 3,
                    detail: None,
                },
                ScenarioReport {
                    name: "b".into(),
                    passed: false,
                    elapsed_us: 4,
                    detail: Some("boom".into()),
                },
            ],
        );
        assert_eq!((report.passed, report.failed), (1, 1));
        assert!(!report.all_passed());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["lock_timeout_ms"], 250);
        assert!(json["scenarios"][0].get("detail").is_none());
        assert_eq!(json["scenarios"][1]["detail"], "boom");
        let back: SuiteReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
