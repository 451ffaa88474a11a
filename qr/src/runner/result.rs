//! Run result types
//!
//! Everything a reporter or embedder receives when a run finishes. All
//! types round-trip through serde.

use serde::{Deserialize, Serialize};

use questplugin::ProtocolResponse;

use crate::collection::model::CollectionInfo;
use crate::error::ValidationIssue;

/// Outcome of one `quest.test(...)` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

/// A recorded test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Plugin event name, for assertions made inside event scripts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Passed,
            error: None,
            event: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Failed,
            error: Some(error.into()),
            event: None,
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Skipped,
            error: None,
            event: None,
        }
    }
}

/// Result of one request node (executed or skipped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResult {
    pub id: String,
    pub name: String,
    /// Typed path, e.g. `request:/Users/Get User`
    pub path: String,
    pub iteration: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ProtocolResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestResult>,
    /// Failure or skip reason ("Skipped by condition", "Skipped by bail",
    /// or a script error message)
    #[serde(rename = "scriptError", default, skip_serializing_if = "Option::is_none")]
    pub script_error: Option<String>,
    #[serde(rename = "durationMs", default)]
    pub duration_ms: u64,
}

impl RequestResult {
    /// A request skipped before any phase ran
    pub fn skipped(id: impl Into<String>, name: impl Into<String>, path: impl Into<String>, iteration: u32, reason: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            iteration,
            success: false,
            response: None,
            tests: Vec::new(),
            script_error: Some(reason.to_string()),
            duration_ms: 0,
        }
    }

    pub fn failed_tests(&self) -> usize {
        self.tests.iter().filter(|t| t.status == TestStatus::Failed).count()
    }
}

/// A history entry exposed to post-scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: u16,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

/// Aggregate totals for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(rename = "totalRequests")]
    pub total_requests: usize,
    #[serde(rename = "failedRequests")]
    pub failed_requests: usize,
    #[serde(rename = "totalTests")]
    pub total_tests: usize,
    #[serde(rename = "passedTests")]
    pub passed_tests: usize,
    #[serde(rename = "failedTests")]
    pub failed_tests: usize,
    #[serde(rename = "skippedTests")]
    pub skipped_tests: usize,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

impl RunSummary {
    /// Fold a request result into the totals
    pub fn absorb(&mut self, result: &RequestResult) {
        self.total_requests += 1;
        if !result.success {
            self.failed_requests += 1;
        }
        for test in &result.tests {
            self.total_tests += 1;
            match test.status {
                TestStatus::Passed => self.passed_tests += 1,
                TestStatus::Failed => self.failed_tests += 1,
                TestStatus::Skipped => self.skipped_tests += 1,
            }
        }
    }
}

/// The complete outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub collection: CollectionInfo,
    /// Iterations actually executed
    pub iterations: u32,
    pub results: Vec<RequestResult>,
    pub summary: RunSummary,
    pub aborted: bool,
    #[serde(rename = "abortReason", default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(rename = "validationErrors", default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationIssue>,
    /// Static count of expected `quest.test` calls; -1 when dynamic
    #[serde(rename = "expectedTests", default)]
    pub expected_tests: i64,
}

impl RunResult {
    /// True when the run completed with no failed tests and no aborts
    pub fn passed(&self) -> bool {
        !self.aborted && self.validation_errors.is_empty() && self.summary.failed_tests == 0 && self.summary.failed_requests == 0
    }
}
