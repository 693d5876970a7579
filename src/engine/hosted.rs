//! Engines hosted inside the runner process.
//!
//! A [`ScriptHost`] executes the harness itself and writes protocol lines
//! into an [`EngineSink`] instead of a pipe. [`HostedProvider`] runs the host
//! on its own task and reads the sink through a
//! [`ChannelSource`](crate::stream::ChannelSource), so watchdog, event
//! processing and exit-code interpretation are the same as for processes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionOptions, ExecutionProvider, drive, harness_url, setup_failure};
use crate::callback::CallbackSender;
use crate::config::EngineKind;
use crate::context::{TestContext, TestMode};
use crate::stream::{ChannelSource, EngineSink};
use crate::summary::TestFileSummary;

/// Runs a harness in-process.
///
/// Implementations write protocol lines with [`EngineSink::write_line`] and
/// finish with [`EngineSink::exit`]. Returning without calling `exit` is
/// reported as an unknown error. Once `write_line` returns `false` the run
/// was abandoned and the host should stop.
#[async_trait]
pub trait ScriptHost: Send + Sync + 'static {
    async fn run(&self, harness_url: String, mode: TestMode, sink: EngineSink);
}

/// Execution provider for a [`ScriptHost`].
pub struct HostedProvider<H> {
    host: Arc<H>,
}

impl<H: ScriptHost> HostedProvider<H> {
    pub fn new(host: H) -> Self {
        Self {
            host: Arc::new(host),
        }
    }
}

#[async_trait]
impl<H: ScriptHost> ExecutionProvider for HostedProvider<H> {
    fn kind(&self) -> EngineKind {
        EngineKind::Hosted
    }

    async fn execute(
        &self,
        context: &TestContext,
        options: &ExecutionOptions,
        callback: &CallbackSender,
    ) -> Vec<TestFileSummary> {
        let url = match harness_url(&context.harness_path) {
            Ok(url) => url,
            Err(e) => return setup_failure(context, e.to_string(), callback),
        };
        debug!("[hosted] {} -> {}", context.first_input_file().display(), url);

        let (mut source, sink) = ChannelSource::new(options.io_timeout(&context.settings));
        let host = Arc::clone(&self.host);
        let mode = options.mode;
        source.attach_task(tokio::spawn(async move {
            host.run(url, mode, sink).await;
        }));

        drive(source, context, options, callback).await
    }
}
