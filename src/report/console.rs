//! Console output with a progress bar over test files.

use std::path::Path;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::callback::RunnerCallback;
use crate::summary::{
    TestCase, TestCaseSummary, TestError, TestFileSummary, TestLog, TestOutcome,
};

/// Prints progress and a final summary to the terminal.
pub struct ConsoleReporter {
    total_files: usize,
    verbose: bool,
    progress: Option<ProgressBar>,
}

impl ConsoleReporter {
    /// A reporter for a run over `total_files` test files.
    ///
    /// Passing tests and engine logs are only printed when `verbose` is set.
    pub fn new(total_files: usize, verbose: bool) -> Self {
        Self {
            total_files,
            verbose,
            progress: None,
        }
    }

    fn println(&self, line: String) {
        // A hidden bar (no terminal) swallows its println output.
        match self.progress.as_ref().filter(|pb| !pb.is_hidden()) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

impl RunnerCallback for ConsoleReporter {
    fn test_suite_started(&mut self) {
        let pb = ProgressBar::new(self.total_files as u64);
        let template = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files";
        if let Ok(template) = ProgressStyle::default_bar().template(template) {
            pb.set_style(template.progress_chars("#>-"));
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        self.progress = Some(pb);
    }

    fn test_suite_finished(&mut self, summary: &TestCaseSummary) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        print!("{}", render_summary(summary));
    }

    fn file_started(&mut self, path: &Path) {
        if self.verbose {
            self.println(format!("Running: {}", path.display()));
        }
    }

    fn file_finished(&mut self, _path: &Path, _summary: &TestFileSummary) {
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
    }

    fn test_finished(&mut self, test: &TestCase) {
        let outcome = test.outcome();
        if !self.verbose && outcome != TestOutcome::Failed {
            return;
        }
        self.println(format!("{} {}", status_label(outcome), test.display_name()));
        if let Some(message) = test.failure_message() {
            self.println(format!("     {}", style(message).dim()));
        }
    }

    fn file_log(&mut self, log: &TestLog) {
        if self.verbose {
            self.println(format!("{} {}", style("LOG ").dim(), log.message));
        }
    }

    fn file_error(&mut self, error: &TestError) {
        self.println(format!(
            "{} {}: {}",
            style("ERR ").red().bold(),
            error.input_test_file.display(),
            error.message
        ));
    }
}

fn status_label(outcome: TestOutcome) -> console::StyledObject<&'static str> {
    match outcome {
        TestOutcome::Passed => style("PASS").green(),
        TestOutcome::Failed => style("FAIL").red(),
        TestOutcome::Skipped => style("SKIP").yellow(),
    }
}

/// The end-of-run summary block.
pub fn render_summary(summary: &TestCaseSummary) -> String {
    let errors = summary.errors().count();
    let mut out = String::new();
    out.push('\n');
    out.push_str("Test Results:\n");
    out.push_str(&format!("  Total:   {}\n", summary.total_count()));
    out.push_str(&format!("  Passed:  {}\n", style(summary.passed_count()).green()));
    out.push_str(&format!("  Failed:  {}\n", style(summary.failed_count()).red()));
    out.push_str(&format!("  Skipped: {}\n", style(summary.skipped_count()).yellow()));
    if errors > 0 {
        out.push_str(&format!("  Errors:  {}\n", style(errors).red().bold()));
    }
    out.push_str(&format!("  Duration: {:.2}s\n", summary.duration.as_secs_f64()));
    out.push('\n');

    if summary.success() {
        out.push_str(&format!("{}\n", style("All tests passed!").green().bold()));
        return out;
    }

    out.push_str(&format!("{}\n", style("Some tests failed.").red().bold()));
    for file in summary.files().iter().filter(|f| !f.success()) {
        out.push_str(&format!("\n  {}\n", file.path.display()));
        for test in file.tests.iter().filter(|t| t.outcome() == TestOutcome::Failed) {
            out.push_str(&format!("    - {}\n", test.display_name()));
            if let Some(message) = test.failure_message() {
                out.push_str(&format!("      {}\n", style(message).dim()));
            }
        }
        for error in &file.errors {
            out.push_str(&format!("    ! {}\n", error.message));
        }
    }
    out
}
