//! Execution providers: one per engine family.
//!
//! An [`ExecutionProvider`] runs one [`TestContext`] and returns a
//! [`TestFileSummary`] per input file. Providers are registered by
//! [`EngineKind`] in a [`ProviderRegistry`] and selected with one lookup.
//!
//! # Available providers
//!
//! - [`headless::HeadlessProvider`]: spawns a headless browser engine
//!   process with a runner script (`phantom`, `chrome`).
//! - [`hosted::HostedProvider`]: drives an in-process [`hosted::ScriptHost`].
//!
//! Both feed their output through a [`StreamingSource`] into an
//! [`EventProcessor`] and share [`drive`], which also owns the watchdog and
//! the exit-code interpretation. Process-level failures never escape as
//! errors: they become [`TestError`]s inside the returned summaries.
//!
//! [`TestError`]: crate::summary::TestError

pub mod events;
pub mod headless;
pub mod hosted;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::callback::CallbackSender;
use crate::config::{EngineKind, TestFileSettings};
use crate::context::{TestContext, TestMode};
use crate::stream::{
    StreamError, StreamOutcome, StreamingSource, WATCHDOG_INTERVAL, open_with_watchdog,
};
use crate::summary::{TestFileSummary, TestProcessExitCode};

pub use events::EventProcessor;

/// File timeout used when neither the file settings nor the runner set one.
pub const DEFAULT_TEST_FILE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Added to the file timeout to cover serialization latency of the engine.
pub const IO_TIMEOUT_BUFFER: Duration = Duration::from_millis(5_000);

/// Result type for execution setup.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors that stop an execution before any output is read.
///
/// These never cross [`ExecutionProvider::execute`]; they are turned into
/// [`TestError`](crate::summary::TestError)s.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("No execution provider registered for engine '{0}'")]
    NoProvider(EngineKind),

    #[error("Invalid harness path '{0}'")]
    InvalidHarness(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Per-run execution options shared by every context.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub mode: TestMode,

    /// Global file timeout; a file-level setting overrides it.
    pub global_timeout_ms: Option<u64>,

    /// Run the engine with elevated privileges where it supports it.
    pub elevated: bool,

    /// Log non-protocol engine output at debug level.
    pub stream_output: bool,

    /// Interval between liveness checks.
    pub watchdog_interval: Option<Duration>,
}

impl ExecutionOptions {
    /// Effective timeout: file-level override, else global, else default.
    pub fn file_timeout(&self, settings: &TestFileSettings) -> Duration {
        settings
            .test_file_timeout_ms
            .or(self.global_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TEST_FILE_TIMEOUT)
    }

    /// Liveness timeout handed to the streaming source.
    pub fn io_timeout(&self, settings: &TestFileSettings) -> Duration {
        self.file_timeout(settings) + IO_TIMEOUT_BUFFER
    }
}

/// Runs test contexts on one engine family.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// The engine family this provider serves.
    fn kind(&self) -> EngineKind;

    /// Runs `context` and returns one summary per input file that reported.
    ///
    /// Never fails: setup and process failures are reported as
    /// [`TestError`](crate::summary::TestError)s in the result and through
    /// `callback`.
    async fn execute(
        &self,
        context: &TestContext,
        options: &ExecutionOptions,
        callback: &CallbackSender,
    ) -> Vec<TestFileSummary>;
}

/// Engine kinds mapped to their providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<EngineKind, Arc<dyn ExecutionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own kind, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ExecutionProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ExecutionProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: EngineKind) -> Option<&Arc<dyn ExecutionProvider>> {
        self.providers.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EngineKind> + '_ {
        self.providers.keys().copied()
    }

    /// Runs `context` on the provider registered for `kind`.
    pub async fn execute(
        &self,
        kind: EngineKind,
        context: &TestContext,
        options: &ExecutionOptions,
        callback: &CallbackSender,
    ) -> Vec<TestFileSummary> {
        match self.get(kind) {
            Some(provider) => provider.execute(context, options, callback).await,
            None => {
                let message = ExecError::NoProvider(kind).to_string();
                error!("{}", message);
                setup_failure(context, message, callback)
            }
        }
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Turns a harness reference into the URL handed to the engine.
///
/// `http(s)://` and `file://` references pass through unchanged; local paths
/// are made absolute and converted to `file://` URLs.
///
/// # Example
///
/// ```
/// use chutzpah::engine::harness_url;
///
/// let url = harness_url("http://localhost:8080/tests.html").unwrap();
/// assert_eq!(url, "http://localhost:8080/tests.html");
/// ```
pub fn harness_url(harness: &str) -> ExecResult<String> {
    let lower = harness.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("file://")
    {
        return Ok(harness.to_string());
    }

    let path = Path::new(harness);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|_| ExecError::InvalidHarness(harness.to_string()))?
            .join(path)
    };
    url::Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|()| ExecError::InvalidHarness(harness.to_string()))
}

/// Subscribes an [`EventProcessor`] to `source`, runs it under the
/// watchdog and interprets how it ended.
pub async fn drive<S>(
    mut source: S,
    context: &TestContext,
    options: &ExecutionOptions,
    callback: &CallbackSender,
) -> Vec<TestFileSummary>
where
    S: StreamingSource,
{
    let processor = Arc::new(Mutex::new(EventProcessor::new(
        context,
        callback.clone(),
        options.stream_output,
    )));
    let handler_processor = Arc::clone(&processor);
    let subscribed = source.subscribe(Box::new(move |line| {
        handler_processor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle(line)
    }));
    if let Err(e) = subscribed {
        source.dispose();
        return setup_failure(context, e.to_string(), callback);
    }

    let interval = options.watchdog_interval.unwrap_or(WATCHDOG_INTERVAL);
    let outcome = open_with_watchdog(&mut source, interval).await;
    source.dispose();
    drop(source);

    let mut processor = match Arc::try_unwrap(processor) {
        Ok(processor) => processor.into_inner().unwrap_or_else(|e| e.into_inner()),
        Err(shared) => {
            warn!("Event processor still shared after stream ended");
            let detached = EventProcessor::new(context, callback.clone(), options.stream_output);
            std::mem::replace(&mut *shared.lock().unwrap_or_else(|e| e.into_inner()), detached)
        }
    };

    // Failures are recorded before `finish` so they precede `file_finished`
    let exit_code = match outcome {
        Ok(outcome) => interpret_outcome(outcome, &mut processor),
        Err(e) => {
            error!("Stream for {} failed: {}", context.first_input_file().display(), e);
            processor.record_error(e.to_string());
            TestProcessExitCode::UnknownError
        }
    };

    let mut summaries = processor.finish();
    for summary in &mut summaries {
        summary.exit_code = Some(exit_code);
    }
    summaries
}

/// Maps how a stream ended to an exit code and records failures on
/// `processor`.
///
/// `AllPassed` and `SomeFailed` add nothing when every input file reported
/// its `FileDone`. A clean exit before that, and every other disposition,
/// adds a [`TestError`](crate::summary::TestError) and notifies the callback.
pub fn interpret_outcome(
    outcome: StreamOutcome,
    processor: &mut EventProcessor,
) -> TestProcessExitCode {
    let (exit_code, raw) = match outcome {
        StreamOutcome::Exited(Some(code)) => (TestProcessExitCode::from_code(code), Some(code)),
        StreamOutcome::Exited(None) | StreamOutcome::Cancelled => {
            (TestProcessExitCode::UnknownError, None)
        }
        StreamOutcome::TimedOut => (TestProcessExitCode::Timeout, None),
    };

    let message = match (exit_code, outcome) {
        (TestProcessExitCode::AllPassed | TestProcessExitCode::SomeFailed, _) => {
            (!processor.is_terminal())
                .then(|| "Test file exited without reporting its results".to_string())
        }
        (TestProcessExitCode::Timeout, _) => {
            Some("Timeout occurred when executing test file".to_string())
        }
        (_, StreamOutcome::Cancelled) => Some("Test execution was cancelled".to_string()),
        (_, _) => Some(match raw {
            Some(code) => format!(
                "Unknown error occurred when executing test file. Received exit code of {}",
                code
            ),
            None => "Unknown error occurred when executing test file. \
                     The engine ended without an exit code"
                .to_string(),
        }),
    };

    if let Some(message) = message {
        let path = processor.record_error(message.clone());
        info!("{}: {} ({:?})", path.display(), message, exit_code);
    }
    exit_code
}

/// A failure before the engine produced anything: one summary, one error.
pub(crate) fn setup_failure(
    context: &TestContext,
    message: String,
    callback: &CallbackSender,
) -> Vec<TestFileSummary> {
    let path = context.first_input_file();
    let mut summary = TestFileSummary::failed(path, message.clone());
    summary.exit_code = Some(TestProcessExitCode::UnknownError);

    callback.file_error(summary.errors[0].clone());
    callback.exception_thrown(message, path);
    callback.file_finished(summary.clone());
    vec![summary]
}
