//! Engine processes as streaming sources.
//!
//! The engine executable is spawned with piped standard output and error.
//! Standard output is decoded line by line (lossily, so stray non-UTF-8
//! bytes only damage their own line); standard error is drained into
//! trace logs so a chatty engine never blocks on a full pipe.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{LineHandler, Liveness, StreamError, StreamOutcome, StreamResult, StreamingSource};
use crate::protocol::decode_line;

/// A process to launch.
///
/// # Example
///
/// ```
/// use chutzpah::stream::Invocation;
///
/// let invocation = Invocation::new("phantomjs")
///     .arg("runner.js")
///     .args(["file:///tmp/tests.html", "execution"])
///     .env("QT_QPA_PLATFORM", "offscreen");
///
/// assert_eq!(invocation.program, "phantomjs");
/// assert_eq!(invocation.args.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program and arguments joined for log output.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        shell_words::join(parts)
    }
}

/// A running engine process.
pub struct ProcessSource {
    program: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    handler: Option<LineHandler>,
    liveness: Liveness,
    token: CancellationToken,
    disposed: bool,
}

impl ProcessSource {
    /// Spawns `invocation`. The liveness clock starts immediately.
    pub fn spawn(invocation: &Invocation, io_timeout: Duration) -> StreamResult<Self> {
        let mut process = tokio::process::Command::new(&invocation.program);
        process.args(&invocation.args);
        for (key, value) in &invocation.env {
            process.env(key, value);
        }
        if let Some(dir) = &invocation.working_dir {
            process.current_dir(dir);
        }
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning {}", invocation.display());
        let mut child = process.spawn().map_err(|source| StreamError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        Ok(Self {
            program: invocation.program.clone(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child: Some(child),
            handler: None,
            liveness: Liveness::new(io_timeout),
            token: CancellationToken::new(),
            disposed: false,
        })
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                trace!("Kill of {} failed (already exited?): {}", self.program, e);
            }
        }
    }

    fn drain_stderr(&mut self) {
        let Some(stderr) = self.stderr.take() else {
            return;
        };
        let program = self.program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("[{} stderr] {}", program, line);
            }
        });
    }
}

#[async_trait]
impl StreamingSource for ProcessSource {
    fn subscribe(&mut self, handler: LineHandler) -> StreamResult<()> {
        if self.handler.is_some() {
            return Err(StreamError::AlreadySubscribed);
        }
        self.handler = Some(handler);
        Ok(())
    }

    async fn open(&mut self) -> StreamResult<StreamOutcome> {
        let stdout = self.stdout.take().ok_or(StreamError::AlreadyOpened)?;
        let Some(mut handler) = self.handler.take() else {
            self.stdout = Some(stdout);
            return Err(StreamError::NotSubscribed);
        };
        self.drain_stderr();

        let token = self.token.clone();
        // Raw lines: one invalid UTF-8 byte must not end the stream
        let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'));

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    self.kill();
                    return Ok(StreamOutcome::Cancelled);
                }
                next = lines.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    if handler(decode_line(&String::from_utf8_lossy(&bytes))) {
                        self.liveness.refresh();
                    }
                }
                Some(Err(e)) => {
                    warn!("Failed to read output of {}: {}", self.program, e);
                    break;
                }
                None => break,
            }
        }

        let Some(mut child) = self.child.take() else {
            return Ok(StreamOutcome::Cancelled);
        };
        let status = tokio::select! {
            _ = token.cancelled() => None,
            status = child.wait() => Some(status),
        };
        match status {
            Some(status) => {
                let code = status?.code();
                trace!("{} exited with {:?}", self.program, code);
                Ok(StreamOutcome::Exited(code))
            }
            None => {
                self.child = Some(child);
                self.kill();
                Ok(StreamOutcome::Cancelled)
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
        self.kill();
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        self.dispose();
    }
}
