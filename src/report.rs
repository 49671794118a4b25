use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of one test method in a structured report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MethodVerdict {
    Passed,
    Failed { message: String },
    TimedOut,
}

/// Structured test report: per-method pass/fail/timeout keyed by the
/// fully-qualified method name (`Class.method`) as emitted by the runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub outcomes: BTreeMap<String, MethodVerdict>,
}

impl TestReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes
            .values()
            .all(|v| matches!(v, MethodVerdict::Passed))
    }

    /// Failing method names with their failure messages. Timeouts are
    /// reported separately via `timed_out`.
    pub fn failing(&self) -> Vec<(String, String)> {
        self.outcomes
            .iter()
            .filter_map(|(name, v)| match v {
                MethodVerdict::Failed { message } => Some((name.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn timed_out(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|(name, v)| match v {
                MethodVerdict::TimedOut => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodCoverage {
    pub line_covered: u64,
    pub line_missed: u64,
    pub branch_covered: u64,
    pub branch_missed: u64,
}

/// Per-method coverage keyed by fully-qualified method name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub methods: BTreeMap<String, MethodCoverage>,
}

impl CoverageReport {
    pub fn line_rate(&self) -> f64 {
        let (covered, missed) = self.methods.values().fold((0u64, 0u64), |(c, m), v| {
            (c + v.line_covered, m + v.line_missed)
        });
        rate(covered, missed)
    }

    pub fn branch_rate(&self) -> f64 {
        let (covered, missed) = self.methods.values().fold((0u64, 0u64), |(c, m), v| {
            (c + v.branch_covered, m + v.branch_missed)
        });
        rate(covered, missed)
    }
}

fn rate(covered: u64, missed: u64) -> f64 {
    let total = covered + missed;
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// Parse the runner's JSON test report. None if the content is not a valid
/// report, which callers treat as "no structured report exists".
pub fn parse_test_report(content: &str) -> Option<TestReport> {
    serde_json::from_str(content).ok()
}

pub fn parse_coverage_report(content: &str) -> Option<CoverageReport> {
    serde_json::from_str(content).ok()
}
