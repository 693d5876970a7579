//! JUnit XML report generation.
//!
//! One `<testsuite>` per test file, one `<testcase>` per test. Failed
//! assertions become `<failure>` elements; file-level errors (timeouts,
//! engine crashes, compile failures) become an `<error>` inside a synthetic
//! test case named after the file, so CI systems count them.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="chutzpah" tests="3" failures="1" errors="1" skipped="0" time="1.234">
//!   <testsuite name="tests/math.js" tests="2" failures="1" errors="0" skipped="0"
//!              time="0.420" timestamp="2024-01-01T00:00:00">
//!     <testcase classname="math" name="adds" time="0.010"/>
//!     <testcase classname="math" name="subtracts" time="0.012">
//!       <failure message="expected 2 but was 3" type="AssertionError">...</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use chutzpah::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("test-results/junit.xml".into())
//!     .with_name("my-project");
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::callback::RunnerCallback;
use crate::summary::{TestCase, TestCaseSummary, TestFileSummary, TestOutcome};

/// Writes a JUnit XML file when the suite finishes.
pub struct JUnitReporter {
    output_path: PathBuf,
    name: String,
}

impl JUnitReporter {
    /// Creates a reporter writing to `output_path`. Parent directories are
    /// created as needed.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            name: "chutzpah".to_string(),
        }
    }

    /// Sets the `name` of the root `<testsuites>` element.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Renders and writes `summary`.
    pub fn write(&self, summary: &TestCaseSummary) -> Result<()> {
        let xml = self.generate_xml(summary)?;
        if let Some(parent) = self.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.output_path, xml)
            .with_context(|| format!("Failed to write {}", self.output_path.display()))?;
        Ok(())
    }

    /// Renders `summary` as JUnit XML.
    pub fn generate_xml(&self, summary: &TestCaseSummary) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let errors = summary.errors().count();
        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.name.as_str()));
        let tests = summary.total_count() + errors;
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", summary.failed_count().to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("skipped", summary.skipped_count().to_string().as_str()));
        testsuites.push_attribute(("time", seconds(summary.duration).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        for file in summary.files() {
            write_testsuite(&mut writer, file, &timestamp)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
        Ok(String::from_utf8(writer.into_inner())?)
    }
}

impl RunnerCallback for JUnitReporter {
    fn test_suite_finished(&mut self, summary: &TestCaseSummary) {
        match self.write(summary) {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {:#}", e),
        }
    }
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    file: &TestFileSummary,
    timestamp: &str,
) -> Result<()> {
    let name = file.path.display().to_string();
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", name.as_str()));
    let tests = file.tests.len() + file.errors.len();
    testsuite.push_attribute(("tests", tests.to_string().as_str()));
    testsuite.push_attribute(("failures", file.failed_count().to_string().as_str()));
    testsuite.push_attribute(("errors", file.errors.len().to_string().as_str()));
    testsuite.push_attribute(("skipped", file.skipped_count().to_string().as_str()));
    testsuite.push_attribute(("time", seconds(file.time_taken).as_str()));
    testsuite.push_attribute(("timestamp", timestamp));
    writer.write_event(Event::Start(testsuite))?;

    let default_class = file
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    for test in &file.tests {
        write_testcase(writer, test, &default_class)?;
    }

    for error in &file.errors {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", default_class.as_str()));
        testcase.push_attribute(("name", name.as_str()));
        testcase.push_attribute(("time", "0.000"));
        writer.write_event(Event::Start(testcase))?;

        let mut element = BytesStart::new("error");
        element.push_attribute(("message", sanitize(&error.message).as_str()));
        element.push_attribute(("type", "Error"));
        writer.write_event(Event::Start(element))?;
        let body = error.stack_as_string.as_deref().unwrap_or(&error.message);
        writer.write_event(Event::Text(BytesText::new(&sanitize(body))))?;
        writer.write_event(Event::End(BytesEnd::new("error")))?;

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    test: &TestCase,
    default_class: &str,
) -> Result<()> {
    let classname = if test.module_name.is_empty() {
        default_class
    } else {
        test.module_name.as_str()
    };
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", test.test_name.as_str()));
    testcase.push_attribute(("time", seconds(test.time_taken).as_str()));

    match test.outcome() {
        TestOutcome::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        TestOutcome::Failed => {
            writer.write_event(Event::Start(testcase))?;
            for result in test.results.iter().filter(|r| !r.passed) {
                let message = result.message.as_deref().unwrap_or("Assertion failed");
                let mut failure = BytesStart::new("failure");
                failure.push_attribute(("message", sanitize(message).as_str()));
                failure.push_attribute(("type", "AssertionError"));
                writer.write_event(Event::Start(failure))?;

                let mut body = Vec::new();
                if let (Some(expected), Some(actual)) = (&result.expected, &result.actual) {
                    body.push(format!("Expected: {}\nActual: {}", expected, actual));
                }
                if let Some(stack) = &result.stack_trace {
                    body.push(stack.clone());
                }
                if !body.is_empty() {
                    let text = sanitize(&body.join("\n"));
                    writer.write_event(Event::Text(BytesText::new(&text)))?;
                }

                writer.write_event(Event::End(BytesEnd::new("failure")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        TestOutcome::Skipped => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }
    Ok(())
}

fn seconds(duration: std::time::Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::summary::{TestError, TestResult};

    fn summary() -> TestCaseSummary {
        let mut math = TestFileSummary::new("tests/math.js");
        math.time_taken = Duration::from_millis(420);
        math.tests.push(TestCase {
            module_name: "math".to_string(),
            test_name: "adds".to_string(),
            time_taken: Duration::from_millis(10),
            results: vec![TestResult {
                passed: true,
                ..Default::default()
            }],
            ..Default::default()
        });
        math.tests.push(TestCase {
            test_name: "compares <tags> & \"quotes\"".to_string(),
            results: vec![TestResult {
                passed: false,
                message: Some("expected 2 but was 3".to_string()),
                expected: Some("2".to_string()),
                actual: Some("3".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        math.tests.push(TestCase {
            test_name: "later".to_string(),
            skipped: true,
            ..Default::default()
        });

        let mut broken = TestFileSummary::new("tests/broken.js");
        broken.errors.push(TestError {
            input_test_file: PathBuf::from("tests/broken.js"),
            message: "Timeout occurred when executing test file".to_string(),
            stack_as_string: None,
        });

        let mut summary = TestCaseSummary::new();
        summary.append(math);
        summary.append(broken);
        summary
    }

    #[test]
    fn test_generate_xml() {
        let xml = JUnitReporter::new(PathBuf::from("junit.xml"))
            .with_name("suite")
            .generate_xml(&summary())
            .unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            r#"<testsuites name="suite" tests="4" failures="1" errors="1" skipped="1""#
        ));
        assert!(xml.contains(r#"<testsuite name="tests/math.js" tests="3" failures="1""#));
        assert!(xml.contains(r#"<testcase classname="math" name="adds" time="0.010"/>"#));
        assert!(xml.contains(r#"name="compares &lt;tags&gt; &amp; &quot;quotes&quot;""#));
        assert!(xml.contains(r#"<failure message="expected 2 but was 3" type="AssertionError">"#));
        assert!(xml.contains("Expected: 2\nActual: 3"));
        assert!(xml.contains("<skipped/>"));
        assert!(xml.contains(r#"<error message="Timeout occurred when executing test file""#));
        assert_eq!(xml.matches("timestamp=").count(), 2);
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("results").join("junit.xml");
        let mut reporter = JUnitReporter::new(path.clone());

        reporter.test_suite_finished(&summary());

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("tests/broken.js"));
    }

    #[test]
    fn test_sanitize_drops_control_characters() {
        assert_eq!(sanitize("a\u{0}b\u{1b}c\nd"), "abc\nd");
    }
}
