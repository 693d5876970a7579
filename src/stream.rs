//! Streaming sources: where engine output lines come from.
//!
//! A [`StreamingSource`] produces decoded protocol lines from a running test
//! engine and hands them to exactly one subscribed handler. Two
//! implementations exist:
//!
//! - [`ProcessSource`]: a spawned engine process, read line by line from
//!   standard output.
//! - [`ChannelSource`]: an in-process engine writing into an
//!   [`EngineSink`].
//!
//! Every source carries a [`Liveness`] clock. The handler decides, per line,
//! whether the line proves progress; [`open_with_watchdog`] cancels the
//! source when the clock goes stale.
//!
//! # Lifecycle
//!
//! ```text
//! create ──► subscribe(handler) ──► open() ──► Exited | Cancelled
//!                                     │
//!                          watchdog ──┘ cancel on stale liveness
//! dispose() (idempotent, also on drop)
//! ```

pub mod channel;
pub mod process;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::protocol::{Line, ProtocolResult};

pub use channel::{ChannelSource, EngineSink};
pub use process::{Invocation, ProcessSource};

/// Result type for streaming source operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors raised by streaming sources.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A second handler was subscribed.
    #[error("A handler is already subscribed to this source")]
    AlreadySubscribed,

    /// `open` was called without a handler.
    #[error("No handler subscribed")]
    NotSubscribed,

    /// `open` was called twice.
    #[error("Source was already opened")]
    AlreadyOpened,

    /// The engine process could not be started.
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives every decoded line. Returns whether the line refreshes liveness.
pub type LineHandler = Box<dyn FnMut(ProtocolResult<Line>) -> bool + Send>;

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The producer finished on its own. `None` when no code was reported
    /// (killed by a signal, or the in-process engine vanished).
    Exited(Option<i32>),
    /// The stream was cancelled before the producer finished.
    Cancelled,
    /// The watchdog cancelled the stream after liveness went stale.
    TimedOut,
}

/// Time of the last meaningful output, shared between reader and watchdog.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_event: Arc<Mutex<Instant>>,
    timeout: Duration,
}

impl Liveness {
    /// A clock that starts now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_event: Arc::new(Mutex::new(Instant::now())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records progress.
    pub fn refresh(&self) {
        let mut last = self.last_event.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn last_event_time(&self) -> Instant {
        *self.last_event.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `true` while the last progress is more recent than the timeout.
    pub fn is_alive(&self) -> bool {
        self.last_event_time().elapsed() < self.timeout
    }
}

/// A source of decoded engine output.
#[async_trait]
pub trait StreamingSource: Send {
    /// Registers the single line handler.
    ///
    /// # Errors
    ///
    /// [`StreamError::AlreadySubscribed`] when a handler is already set.
    fn subscribe(&mut self, handler: LineHandler) -> StreamResult<()>;

    /// Reads until the producer finishes or the stream is cancelled.
    async fn open(&mut self) -> StreamResult<StreamOutcome>;

    /// The liveness clock refreshed by this source.
    fn liveness(&self) -> Liveness;

    /// Cancelling this token makes `open` return [`StreamOutcome::Cancelled`].
    fn cancellation_token(&self) -> CancellationToken;

    /// Releases the producer. Safe to call any number of times; never fails.
    fn dispose(&mut self);
}

/// Default interval between liveness checks.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

/// Opens `source` and cancels it if its liveness goes stale.
///
/// Returns [`StreamOutcome::TimedOut`] when the watchdog fired, otherwise
/// whatever `open` returned.
pub async fn open_with_watchdog<S>(source: &mut S, interval: Duration) -> StreamResult<StreamOutcome>
where
    S: StreamingSource + ?Sized,
{
    let liveness = source.liveness();
    let token = source.cancellation_token();

    let open = source.open();
    tokio::pin!(open);

    tokio::select! {
        result = &mut open => return result,
        _ = watch(liveness.clone(), interval) => {}
    }

    warn!(
        "No progress for {:?}; cancelling stream",
        liveness.timeout()
    );
    token.cancel();
    // Let the source observe the cancellation and release the producer.
    let _ = open.await;
    Ok(StreamOutcome::TimedOut)
}

async fn watch(liveness: Liveness, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !liveness.is_alive() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_liveness_expires_and_refreshes() {
        let liveness = Liveness::new(Duration::from_millis(100));
        assert!(liveness.is_alive());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!liveness.is_alive());

        liveness.refresh();
        assert!(liveness.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_is_shared_between_clones() {
        let liveness = Liveness::new(Duration::from_secs(1));
        let clone = liveness.clone();

        tokio::time::advance(Duration::from_secs(2)).await;
        clone.refresh();
        assert!(liveness.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_cancels_silent_source() {
        let (mut source, sink) = ChannelSource::new(Duration::from_secs(30));
        source.subscribe(Box::new(|_| true)).unwrap();

        let outcome = open_with_watchdog(&mut source, WATCHDOG_INTERVAL)
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::TimedOut);
        assert!(sink.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_passes_through_normal_exit() {
        let (mut source, sink) = ChannelSource::new(Duration::from_secs(30));
        source.subscribe(Box::new(|_| true)).unwrap();
        sink.write_line("#_#FileStart#_# {}");
        sink.exit(0);

        let outcome = open_with_watchdog(&mut source, WATCHDOG_INTERVAL)
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Exited(Some(0)));
    }
}
