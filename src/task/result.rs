//! Canonical task result and the structured artifact agents write.
//!
//! Every resolution path (per-task artifact, legacy artifact, transcript
//! heuristics, scheduler-synthesised failure) normalises into [`TaskResult`].

use serde::{Deserialize, Serialize};

/// How much a result can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Read from a structured artifact written by the agent
    Structured,
    /// Extracted from free text by pattern matching
    Heuristic,
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Task-scoped artifact under the results directory
    TaskArtifact,
    /// Shared legacy artifact
    LegacyArtifact,
    /// Pattern matching over the captured transcript
    Transcript,
    /// Synthesised by the orchestrator (spawn failure, runner error, panic, cancellation)
    Orchestrator,
}

impl ResultSource {
    pub fn confidence(self) -> Confidence {
        match self {
            ResultSource::TaskArtifact | ResultSource::LegacyArtifact => Confidence::Structured,
            ResultSource::Transcript | ResultSource::Orchestrator => Confidence::Heuristic,
        }
    }
}

/// Coverage percentages per metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageBreakdown {
    #[serde(default)]
    pub lines: Option<f64>,
    #[serde(default)]
    pub statements: Option<f64>,
    #[serde(default)]
    pub functions: Option<f64>,
    #[serde(default)]
    pub branches: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    /// Overall percentage, if reported
    pub percent: Option<f64>,
    pub breakdown: Option<CoverageBreakdown>,
}

/// One executed test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Details of one failing test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub name: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub error: String,
    #[serde(default, alias = "stackTrace")]
    pub stack_trace: Option<String>,
}

/// The canonical outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub pass: bool,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub coverage: Option<Coverage>,
    pub summary: String,
    pub error_excerpt: Option<String>,
    pub duration_ms: u64,
    pub tests: Vec<TestCase>,
    pub failures: Vec<FailureDetail>,
    pub confidence: Confidence,
    pub source: ResultSource,
}

impl TaskResult {
    /// Create an orchestrator-synthesised failure.
    pub fn failure(summary: impl Into<String>, error_excerpt: Option<String>) -> Self {
        Self {
            pass: false,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            coverage: None,
            summary: summary.into(),
            error_excerpt,
            duration_ms: 0,
            tests: Vec::new(),
            failures: Vec::new(),
            confidence: ResultSource::Orchestrator.confidence(),
            source: ResultSource::Orchestrator,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Re-tag the result, keeping confidence consistent with the source.
    pub fn with_source(mut self, source: ResultSource) -> Self {
        self.source = source;
        self.confidence = source.confidence();
        self
    }

    pub fn is_structured(&self) -> bool {
        self.confidence == Confidence::Structured
    }
}

/// JSON document an agent writes to report a task's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    #[serde(default, alias = "taskId", alias = "task_identifier")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub pass: bool,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "errorOutput")]
    pub error_output: Option<String>,
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default, alias = "coverageBreakdown")]
    pub coverage_breakdown: Option<CoverageBreakdown>,
    /// Milliseconds
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default, alias = "individualTests")]
    pub individual_tests: Vec<TestCase>,
    #[serde(default, alias = "failedTestDetails")]
    pub failed_test_details: Vec<FailureDetail>,
}

impl ResultArtifact {
    /// Normalise into a [`TaskResult`] tagged with `source`.
    ///
    /// A zero `total` is recomputed from the individual counts (saturating at
    /// `u32::MAX`); counts are otherwise kept as written.
    pub fn into_result(self, source: ResultSource) -> TaskResult {
        let total = if self.total == 0 {
            self.passed.saturating_add(self.failed).saturating_add(self.skipped)
        } else {
            self.total
        };

        let coverage = match (self.coverage, self.coverage_breakdown) {
            (None, None) => None,
            (percent, breakdown) => Some(Coverage { percent, breakdown }),
        };

        let error_excerpt = self
            .error_output
            .filter(|e| !e.trim().is_empty())
            .or_else(|| {
                self.failed_test_details
                    .first()
                    .map(|f| f.error.clone())
                    .filter(|e| !e.is_empty())
            });

        TaskResult {
            pass: self.pass,
            total,
            passed: self.passed,
            failed: self.failed,
            skipped: self.skipped,
            coverage,
            summary: self.summary,
            error_excerpt,
            duration_ms: self.duration.unwrap_or(0),
            tests: self.individual_tests,
            failures: self.failed_test_details,
            confidence: source.confidence(),
            source,
        }
    }
}
