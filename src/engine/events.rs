//! Builds file summaries from a decoded event stream.
//!
//! Each `FileStart` opens a summary for the next input file of the context;
//! `FileDone` closes it. Once the summary for the last input file is closed
//! the stream is terminal and anything that still arrives is ignored.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::callback::CallbackSender;
use crate::context::TestContext;
use crate::protocol::{Event, Line, ProtocolResult, TestCasePayload, TestResultPayload};
use crate::summary::{TestCase, TestError, TestFileSummary, TestLog, TestResult};

/// Consumes one stream's lines and reports progress through a callback.
pub struct EventProcessor {
    input_files: Vec<PathBuf>,
    started: usize,
    current: Option<TestFileSummary>,
    finished: Vec<TestFileSummary>,
    callback: CallbackSender,
    stream_output: bool,
    terminal: bool,
}

impl EventProcessor {
    pub fn new(context: &TestContext, callback: CallbackSender, stream_output: bool) -> Self {
        let mut input_files = context.input_test_files.clone();
        if input_files.is_empty() {
            input_files.push(context.first_input_file().to_path_buf());
        }
        Self {
            input_files,
            started: 0,
            current: None,
            finished: Vec::new(),
            callback,
            stream_output,
            terminal: false,
        }
    }

    /// `true` once the final `FileDone` was seen.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Handles one decoded line. Returns whether it refreshes liveness.
    pub fn handle(&mut self, line: ProtocolResult<Line>) -> bool {
        if self.terminal {
            trace!("Ignoring output after final FileDone");
            return false;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("{}", e);
                let summary = self.current_summary();
                let error = TestError::new(summary.path.clone(), e.to_string());
                summary.errors.push(error.clone());
                self.callback.file_error(error);
                self.close_current();
                return true;
            }
        };

        let refreshes = line.refreshes_liveness();
        match line {
            Line::Raw(text) => debug!(target: "chutzpah::trace", "{}", text),
            Line::Other(text) if self.stream_output => debug!("{}", text),
            Line::Other(text) => trace!("{}", text),
            Line::Event(event) => self.handle_event(event),
        }
        refreshes
    }

    fn handle_event(&mut self, event: Event) {
        debug!("Event {}", event.kind());
        match event {
            Event::FileStart(_) => {
                if self.current.is_some() {
                    debug!("FileStart without FileDone for the previous file");
                    self.close_current();
                    if self.terminal {
                        return;
                    }
                }
                self.open_next();
            }
            Event::TestStart(start) => {
                let case = self.test_case(start.test_case);
                self.callback.test_started(case);
            }
            Event::TestDone(done) => {
                let case = self.test_case(done.test_case);
                self.current_summary().tests.push(case.clone());
                self.callback.test_finished(case);
            }
            Event::Log(log) => {
                let summary = self.current_summary();
                let log = TestLog {
                    input_test_file: summary.path.clone(),
                    message: log.log.message,
                };
                summary.logs.push(log.clone());
                self.callback.file_log(log);
            }
            Event::Error(error) => {
                let summary = self.current_summary();
                let error = TestError {
                    input_test_file: summary.path.clone(),
                    stack_as_string: error.error.stack_text(),
                    message: error.error.message,
                };
                summary.errors.push(error.clone());
                self.callback.file_error(error);
            }
            Event::CoverageObject(coverage) => {
                self.current_summary().coverage = Some(coverage.object);
            }
            Event::FileDone(done) => {
                let summary = self.current_summary();
                summary.time_taken = Duration::from_millis(done.timetaken);
                debug!(
                    "{} finished: {} passed, {} failed",
                    summary.path.display(),
                    done.passed,
                    done.failed
                );
                self.close_current();
            }
        }
    }

    /// Records a failure that no protocol event reported and notifies the
    /// callback. Returns the file it was attached to.
    ///
    /// The error goes to the file in progress, else the next input file that
    /// never started, else the last file that reported.
    pub fn record_error(&mut self, message: impl Into<String>) -> PathBuf {
        let message = message.into();
        let all_reported = self.current.is_none()
            && self.started >= self.input_files.len()
            && !self.finished.is_empty();
        let summary = if all_reported {
            let last = self.finished.len() - 1;
            &mut self.finished[last]
        } else {
            self.current_summary()
        };
        let error = TestError::new(summary.path.clone(), message.clone());
        summary.errors.push(error.clone());
        let path = summary.path.clone();

        self.callback.file_error(error);
        self.callback.exception_thrown(message, &path);
        path
    }

    /// Returns every summary, closing one still in progress.
    pub fn finish(mut self) -> Vec<TestFileSummary> {
        if self.current.is_some() {
            self.close_current();
        }
        self.finished
    }

    fn open_next(&mut self) {
        let index = self.started.min(self.input_files.len() - 1);
        let path = self.input_files[index].clone();
        self.started += 1;
        self.callback.file_started(&path);
        self.current = Some(TestFileSummary::new(path));
    }

    fn current_summary(&mut self) -> &mut TestFileSummary {
        if self.current.is_none() {
            self.open_next();
        }
        self.current.get_or_insert_with(TestFileSummary::default)
    }

    fn close_current(&mut self) {
        if let Some(summary) = self.current.take() {
            self.callback.file_finished(summary.clone());
            self.finished.push(summary);
        }
        if self.started >= self.input_files.len() {
            self.terminal = true;
        }
    }

    fn test_case(&mut self, payload: TestCasePayload) -> TestCase {
        let path = self.current_summary().path.clone();
        TestCase {
            input_test_file: path,
            module_name: payload.module_name,
            test_name: payload.test_name,
            time_taken: Duration::from_millis(payload.time_taken),
            results: payload.test_results.into_iter().map(test_result).collect(),
            skipped: payload.skipped,
        }
    }
}

fn test_result(payload: TestResultPayload) -> TestResult {
    TestResult {
        passed: payload.passed,
        message: payload.message,
        expected: payload.expected.map(json_text),
        actual: payload.actual.map(json_text),
        stack_trace: payload.stack_trace,
    }
}

fn json_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
