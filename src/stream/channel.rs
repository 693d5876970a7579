//! In-process streaming source.
//!
//! Script hosts that run inside the runner write protocol lines into an
//! [`EngineSink`]; the paired [`ChannelSource`] decodes them exactly like
//! process output. Disposing the source severs the sink, so a host that
//! keeps writing after a timeout only sees `write_line` return `false`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{LineHandler, Liveness, StreamError, StreamOutcome, StreamResult, StreamingSource};
use crate::protocol::decode_line;

#[derive(Debug)]
enum EngineMessage {
    Line(String),
    Exit(i32),
}

/// Write end handed to an in-process engine.
#[derive(Debug, Clone)]
pub struct EngineSink {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl EngineSink {
    /// Emits one protocol line. Returns `false` once the source is gone.
    pub fn write_line(&self, line: impl Into<String>) -> bool {
        self.tx.send(EngineMessage::Line(line.into())).is_ok()
    }

    /// Reports that the engine finished with `code`.
    pub fn exit(&self, code: i32) {
        let _ = self.tx.send(EngineMessage::Exit(code));
    }

    /// `true` once the reading side was disposed or cancelled.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Streaming source fed by an [`EngineSink`].
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<EngineMessage>,
    handler: Option<LineHandler>,
    liveness: Liveness,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    opened: bool,
    disposed: bool,
}

impl ChannelSource {
    /// Creates a source and the sink that feeds it.
    pub fn new(io_timeout: Duration) -> (Self, EngineSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            rx,
            handler: None,
            liveness: Liveness::new(io_timeout),
            token: CancellationToken::new(),
            task: None,
            opened: false,
            disposed: false,
        };
        (source, EngineSink { tx })
    }

    /// Ties the engine's task to this source; it is aborted on dispose.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }
}

#[async_trait]
impl StreamingSource for ChannelSource {
    fn subscribe(&mut self, handler: LineHandler) -> StreamResult<()> {
        if self.handler.is_some() || self.opened {
            return Err(StreamError::AlreadySubscribed);
        }
        self.handler = Some(handler);
        Ok(())
    }

    async fn open(&mut self) -> StreamResult<StreamOutcome> {
        if self.opened {
            return Err(StreamError::AlreadyOpened);
        }
        let mut handler = self.handler.take().ok_or(StreamError::NotSubscribed)?;
        self.opened = true;
        let token = self.token.clone();

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => None,
                message = self.rx.recv() => Some(message),
            };
            match message {
                None => {
                    debug!("In-process stream cancelled");
                    self.rx.close();
                    return Ok(StreamOutcome::Cancelled);
                }
                Some(Some(EngineMessage::Line(line))) => {
                    if handler(decode_line(&line)) {
                        self.liveness.refresh();
                    }
                }
                Some(Some(EngineMessage::Exit(code))) => {
                    trace!("In-process engine exited with {}", code);
                    return Ok(StreamOutcome::Exited(Some(code)));
                }
                Some(None) => {
                    debug!("In-process engine dropped its sink without exiting");
                    return Ok(StreamOutcome::Exited(None));
                }
            }
        }
    }

    fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.token.cancel();
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        self.dispose();
    }
}
