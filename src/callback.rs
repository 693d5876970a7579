//! Result callbacks and their serialization across parallel executions.
//!
//! A [`RunnerCallback`] receives progress notifications while tests run.
//! Executions run concurrently, but callbacks are written assuming a single
//! caller. The [`ParallelCallbackAdapter`] bridges the two: it owns the
//! wrapped callback on one dedicated task and hands out cheap
//! [`CallbackSender`]s. Every notification becomes a [`CallbackMessage`] on
//! one channel, so each callback invocation runs to completion before the
//! next starts and no lock is held by the executions themselves.
//!
//! ```text
//!  execution 1 ──┐
//!  execution 2 ──┼── CallbackSender ──► mpsc ──► drain task ──► RunnerCallback
//!  execution N ──┘
//! ```
//!
//! # Example
//!
//! ```
//! use chutzpah::callback::{ParallelCallbackAdapter, RunnerCallback};
//! use chutzpah::summary::TestLog;
//!
//! #[derive(Default)]
//! struct Count(usize);
//!
//! impl RunnerCallback for Count {
//!     fn file_log(&mut self, _log: &TestLog) {
//!         self.0 += 1;
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let adapter = ParallelCallbackAdapter::spawn(Count::default());
//! let sender = adapter.sender();
//! sender.file_log(TestLog { input_test_file: "a.js".into(), message: "hi".into() });
//! let count = adapter.finish().await.unwrap();
//! assert_eq!(count.0, 1);
//! # });
//! ```

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::summary::{TestCase, TestCaseSummary, TestError, TestFileSummary, TestLog};

/// Receives progress notifications for a run.
///
/// Every method has an empty default so implementors only override what
/// they care about. Implementations must not call back into the adapter
/// that drives them.
pub trait RunnerCallback: Send {
    fn test_suite_started(&mut self) {}

    fn test_suite_finished(&mut self, _summary: &TestCaseSummary) {}

    fn file_started(&mut self, _path: &Path) {}

    fn file_finished(&mut self, _path: &Path, _summary: &TestFileSummary) {}

    fn test_started(&mut self, _test: &TestCase) {}

    fn test_finished(&mut self, _test: &TestCase) {}

    fn file_log(&mut self, _log: &TestLog) {}

    fn file_error(&mut self, _error: &TestError) {}

    /// An error outside of any test: engine crash, timeout, missing output.
    fn exception_thrown(&mut self, _message: &str, _path: &Path) {}
}

impl<C: RunnerCallback + ?Sized> RunnerCallback for Box<C> {
    fn test_suite_started(&mut self) {
        (**self).test_suite_started()
    }

    fn test_suite_finished(&mut self, summary: &TestCaseSummary) {
        (**self).test_suite_finished(summary)
    }

    fn file_started(&mut self, path: &Path) {
        (**self).file_started(path)
    }

    fn file_finished(&mut self, path: &Path, summary: &TestFileSummary) {
        (**self).file_finished(path, summary)
    }

    fn test_started(&mut self, test: &TestCase) {
        (**self).test_started(test)
    }

    fn test_finished(&mut self, test: &TestCase) {
        (**self).test_finished(test)
    }

    fn file_log(&mut self, log: &TestLog) {
        (**self).file_log(log)
    }

    fn file_error(&mut self, error: &TestError) {
        (**self).file_error(error)
    }

    fn exception_thrown(&mut self, message: &str, path: &Path) {
        (**self).exception_thrown(message, path)
    }
}

/// A callback that ignores everything.
#[derive(Debug, Default)]
pub struct NullCallback;

impl RunnerCallback for NullCallback {}

/// One callback invocation, as queued by a [`CallbackSender`].
#[derive(Debug, Clone)]
pub enum CallbackMessage {
    TestSuiteStarted,
    TestSuiteFinished(Box<TestCaseSummary>),
    FileStarted(PathBuf),
    FileFinished(PathBuf, Box<TestFileSummary>),
    TestStarted(TestCase),
    TestFinished(TestCase),
    FileLog(TestLog),
    FileError(TestError),
    ExceptionThrown { message: String, path: PathBuf },
}

impl CallbackMessage {
    /// Invokes the matching method on `callback`.
    pub fn dispatch<C: RunnerCallback + ?Sized>(self, callback: &mut C) {
        match self {
            CallbackMessage::TestSuiteStarted => callback.test_suite_started(),
            CallbackMessage::TestSuiteFinished(summary) => callback.test_suite_finished(&summary),
            CallbackMessage::FileStarted(path) => callback.file_started(&path),
            CallbackMessage::FileFinished(path, summary) => callback.file_finished(&path, &summary),
            CallbackMessage::TestStarted(test) => callback.test_started(&test),
            CallbackMessage::TestFinished(test) => callback.test_finished(&test),
            CallbackMessage::FileLog(log) => callback.file_log(&log),
            CallbackMessage::FileError(error) => callback.file_error(&error),
            CallbackMessage::ExceptionThrown { message, path } => {
                callback.exception_thrown(&message, &path)
            }
        }
    }
}

/// Owns a callback on a dedicated task and serializes every call into it.
pub struct ParallelCallbackAdapter<C> {
    tx: mpsc::UnboundedSender<CallbackMessage>,
    task: JoinHandle<C>,
}

impl<C: RunnerCallback + 'static> ParallelCallbackAdapter<C> {
    /// Spawns the drain task. Must be called within a tokio runtime.
    pub fn spawn(callback: C) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackMessage>();
        let task = tokio::spawn(async move {
            let mut callback = callback;
            while let Some(message) = rx.recv().await {
                message.dispatch(&mut callback);
            }
            trace!("Callback channel closed");
            callback
        });
        Self { tx, task }
    }

    /// A handle executions use to report progress.
    pub fn sender(&self) -> CallbackSender {
        CallbackSender {
            tx: Some(self.tx.clone()),
        }
    }

    /// Waits for every queued call to be delivered and returns the callback.
    ///
    /// Senders still alive elsewhere keep the drain task running; drop them
    /// first.
    pub async fn finish(self) -> Result<C, tokio::task::JoinError> {
        drop(self.tx);
        self.task.await
    }
}

/// Cloneable handle that queues callback invocations.
///
/// Sending never blocks and never fails; messages sent after the adapter
/// is gone are dropped.
#[derive(Debug, Clone, Default)]
pub struct CallbackSender {
    tx: Option<mpsc::UnboundedSender<CallbackMessage>>,
}

impl CallbackSender {
    /// A sender connected to nothing.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Queues a message.
    pub fn send(&self, message: CallbackMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(message);
        }
    }

    pub fn test_suite_started(&self) {
        self.send(CallbackMessage::TestSuiteStarted);
    }

    pub fn test_suite_finished(&self, summary: TestCaseSummary) {
        self.send(CallbackMessage::TestSuiteFinished(Box::new(summary)));
    }

    pub fn file_started(&self, path: &Path) {
        self.send(CallbackMessage::FileStarted(path.to_path_buf()));
    }

    pub fn file_finished(&self, summary: TestFileSummary) {
        self.send(CallbackMessage::FileFinished(
            summary.path.clone(),
            Box::new(summary),
        ));
    }

    pub fn test_started(&self, test: TestCase) {
        self.send(CallbackMessage::TestStarted(test));
    }

    pub fn test_finished(&self, test: TestCase) {
        self.send(CallbackMessage::TestFinished(test));
    }

    pub fn file_log(&self, log: TestLog) {
        self.send(CallbackMessage::FileLog(log));
    }

    pub fn file_error(&self, error: TestError) {
        self.send(CallbackMessage::FileError(error));
    }

    pub fn exception_thrown(&self, message: impl Into<String>, path: &Path) {
        self.send(CallbackMessage::ExceptionThrown {
            message: message.into(),
            path: path.to_path_buf(),
        });
    }
}
