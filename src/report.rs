//! Test reporting and output generation.
//!
//! Reporters are [`RunnerCallback`]s. The console reporter follows the run
//! as it happens; the JUnit reporter writes a file once the suite finishes.
//! [`MultiReporter`] fans one notification stream out to several of them.

pub mod console;
pub mod junit;

use std::path::Path;

use crate::callback::RunnerCallback;
use crate::summary::{TestCase, TestCaseSummary, TestError, TestFileSummary, TestLog};

pub use console::ConsoleReporter;
pub use junit::JUnitReporter;

/// A reporter that forwards every notification to each of its reporters,
/// in the order they were added.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn RunnerCallback>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: RunnerCallback + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl RunnerCallback for MultiReporter {
    fn test_suite_started(&mut self) {
        for reporter in &mut self.reporters {
            reporter.test_suite_started();
        }
    }

    fn test_suite_finished(&mut self, summary: &TestCaseSummary) {
        for reporter in &mut self.reporters {
            reporter.test_suite_finished(summary);
        }
    }

    fn file_started(&mut self, path: &Path) {
        for reporter in &mut self.reporters {
            reporter.file_started(path);
        }
    }

    fn file_finished(&mut self, path: &Path, summary: &TestFileSummary) {
        for reporter in &mut self.reporters {
            reporter.file_finished(path, summary);
        }
    }

    fn test_started(&mut self, test: &TestCase) {
        for reporter in &mut self.reporters {
            reporter.test_started(test);
        }
    }

    fn test_finished(&mut self, test: &TestCase) {
        for reporter in &mut self.reporters {
            reporter.test_finished(test);
        }
    }

    fn file_log(&mut self, log: &TestLog) {
        for reporter in &mut self.reporters {
            reporter.file_log(log);
        }
    }

    fn file_error(&mut self, error: &TestError) {
        for reporter in &mut self.reporters {
            reporter.file_error(error);
        }
    }

    fn exception_thrown(&mut self, message: &str, path: &Path) {
        for reporter in &mut self.reporters {
            reporter.exception_thrown(message, path);
        }
    }
}
