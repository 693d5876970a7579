//! Test outcome model.
//!
//! Results are collected bottom-up: assertion-level [`TestResult`]s make up a
//! [`TestCase`], test cases plus logs and errors make up a per-file
//! [`TestFileSummary`], and file summaries are appended to the run-wide
//! [`TestCaseSummary`].
//!
//! ```text
//! TestCaseSummary
//! └── TestFileSummary (one per test file)
//!     ├── TestCase ── TestResult*
//!     ├── TestLog*
//!     └── TestError*
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How an engine process ended.
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All tests passed |
/// | 1 | Some tests failed |
/// | 2 | Unknown error (also any unrecognised code) |
/// | 3 | Timeout |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestProcessExitCode {
    /// Every test passed.
    AllPassed,
    /// At least one test failed.
    SomeFailed,
    /// The engine failed for a reason it could not report.
    UnknownError,
    /// The run exceeded its timeout.
    Timeout,
}

impl TestProcessExitCode {
    /// Maps a raw process exit code.
    ///
    /// # Example
    ///
    /// ```
    /// use chutzpah::summary::TestProcessExitCode;
    ///
    /// assert_eq!(TestProcessExitCode::from_code(1), TestProcessExitCode::SomeFailed);
    /// assert_eq!(TestProcessExitCode::from_code(9), TestProcessExitCode::UnknownError);
    /// ```
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TestProcessExitCode::AllPassed,
            1 => TestProcessExitCode::SomeFailed,
            3 => TestProcessExitCode::Timeout,
            _ => TestProcessExitCode::UnknownError,
        }
    }

    /// The numeric code for this disposition.
    pub fn code(&self) -> i32 {
        match self {
            TestProcessExitCode::AllPassed => 0,
            TestProcessExitCode::SomeFailed => 1,
            TestProcessExitCode::UnknownError => 2,
            TestProcessExitCode::Timeout => 3,
        }
    }

    /// Returns `true` for codes that mean the engine itself failed.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TestProcessExitCode::UnknownError | TestProcessExitCode::Timeout
        )
    }
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    /// Every assertion passed.
    Passed,
    /// At least one assertion failed.
    Failed,
    /// The test was not run.
    Skipped,
}

/// One assertion reported by a test case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestResult {
    pub passed: bool,
    pub message: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub stack_trace: Option<String>,
}

/// A test as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCase {
    /// Test file that defined the test.
    pub input_test_file: PathBuf,

    /// Module (suite) name. Empty when the framework has none.
    pub module_name: String,

    /// Test name.
    pub test_name: String,

    /// Time the test took, as reported by the engine.
    pub time_taken: Duration,

    /// Assertion results.
    pub results: Vec<TestResult>,

    /// The test was skipped or only discovered.
    pub skipped: bool,
}

impl TestCase {
    /// Fully qualified display name.
    pub fn display_name(&self) -> String {
        if self.module_name.is_empty() {
            self.test_name.clone()
        } else {
            format!("{} {}", self.module_name, self.test_name)
        }
    }

    /// Derives the outcome from the assertion results.
    pub fn outcome(&self) -> TestOutcome {
        if self.skipped {
            TestOutcome::Skipped
        } else if self.results.iter().all(|r| r.passed) {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed
        }
    }

    /// First failure message, if any.
    pub fn failure_message(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| !r.passed)
            .and_then(|r| r.message.as_deref())
    }
}

/// A log line written by the code under test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestLog {
    pub input_test_file: PathBuf,
    pub message: String,
}

/// A file-level error: script errors, engine failures, compile problems.
#[derive(Debug, Clone, PartialEq)]
pub struct TestError {
    pub input_test_file: PathBuf,
    pub message: String,
    pub stack_as_string: Option<String>,
}

impl TestError {
    /// Creates an error without a stack.
    pub fn new(input_test_file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            input_test_file: input_test_file.into(),
            message: message.into(),
            stack_as_string: None,
        }
    }
}

/// Results for one test file.
#[derive(Debug, Clone, Default)]
pub struct TestFileSummary {
    /// The test file.
    pub path: PathBuf,

    pub tests: Vec<TestCase>,
    pub logs: Vec<TestLog>,
    pub errors: Vec<TestError>,

    /// Raw coverage object reported by the engine.
    pub coverage: Option<serde_json::Value>,

    /// Time the file took, as reported by the engine.
    pub time_taken: Duration,

    /// How the engine process ended, once known.
    pub exit_code: Option<TestProcessExitCode>,
}

impl TestFileSummary {
    /// Creates an empty summary for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// A summary for a file that could not run: zero tests and one error.
    pub fn failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        let path = path.into();
        let error = TestError::new(path.clone(), message);
        Self {
            errors: vec![error],
            ..Self::new(path)
        }
    }

    pub fn passed_count(&self) -> usize {
        self.count(TestOutcome::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(TestOutcome::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(TestOutcome::Skipped)
    }

    fn count(&self, outcome: TestOutcome) -> usize {
        self.tests.iter().filter(|t| t.outcome() == outcome).count()
    }

    /// No failed tests and no errors.
    pub fn success(&self) -> bool {
        self.failed_count() == 0 && self.errors.is_empty()
    }
}

/// Aggregated results of a whole run.
#[derive(Debug, Clone, Default)]
pub struct TestCaseSummary {
    files: Vec<TestFileSummary>,

    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl TestCaseSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a file's results.
    pub fn append(&mut self, file: TestFileSummary) {
        self.files.push(file);
    }

    /// File summaries in the order they were appended.
    pub fn files(&self) -> &[TestFileSummary] {
        &self.files
    }

    /// Looks up the summary for one test file.
    pub fn file(&self, path: &Path) -> Option<&TestFileSummary> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn total_count(&self) -> usize {
        self.files.iter().map(|f| f.tests.len()).sum()
    }

    pub fn passed_count(&self) -> usize {
        self.files.iter().map(TestFileSummary::passed_count).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.files.iter().map(TestFileSummary::failed_count).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.files.iter().map(TestFileSummary::skipped_count).sum()
    }

    /// Every file-level error across the run.
    pub fn errors(&self) -> impl Iterator<Item = &TestError> {
        self.files.iter().flat_map(|f| f.errors.iter())
    }

    /// No failed tests and no errors anywhere.
    pub fn success(&self) -> bool {
        self.files.iter().all(TestFileSummary::success)
    }

    /// Process exit code for the CLI: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}
