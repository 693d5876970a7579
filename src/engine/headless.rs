//! Process-based headless browser engines.
//!
//! The engine executable is launched once per test context with the runner
//! script and a fixed positional argument layout:
//!
//! ```text
//! <prefix_args...> <runner_script> <harness_url> <mode> <timeout_ms>
//!     <elevated> <ignore_resource_loading_errors> [<user_agent>] [-- <browser args...>]
//! ```
//!
//! The runner script loads the harness, speaks the line protocol on
//! standard output and exits with the run's disposition.

use async_trait::async_trait;
use tracing::{debug, error};

use super::{
    ExecResult, ExecutionOptions, ExecutionProvider, ProviderRegistry, drive, harness_url,
    setup_failure,
};
use crate::callback::CallbackSender;
use crate::config::{EngineKind, EnginesConfig, ProcessEngineConfig};
use crate::context::TestContext;
use crate::stream::{Invocation, ProcessSource};
use crate::summary::TestFileSummary;

/// Runs test contexts in a spawned headless browser engine.
#[derive(Debug, Clone)]
pub struct HeadlessProvider {
    kind: EngineKind,
    config: ProcessEngineConfig,
}

impl HeadlessProvider {
    pub fn new(kind: EngineKind, config: ProcessEngineConfig) -> Self {
        Self { kind, config }
    }

    /// Builds the engine invocation for `context`.
    ///
    /// Deterministic for a given context and options apart from resolving
    /// relative harness paths against the current directory.
    pub fn build_invocation(
        &self,
        context: &TestContext,
        options: &ExecutionOptions,
    ) -> ExecResult<Invocation> {
        let settings = &context.settings;
        let executable = shellexpand::tilde(&self.config.executable).into_owned();
        let timeout = options.file_timeout(settings);

        let mut invocation = Invocation::new(executable)
            .args(self.config.prefix_args.iter().cloned())
            .arg(self.config.runner_script.to_string_lossy())
            .arg(harness_url(&context.harness_path)?)
            .arg(options.mode.as_str())
            .arg(timeout.as_millis().to_string())
            .arg(options.elevated.to_string())
            .arg(settings.ignore_resource_loading_errors.to_string());

        if let Some(user_agent) = &settings.user_agent {
            invocation = invocation.arg(user_agent.as_str());
        }
        if !settings.browser_arguments.is_empty() {
            invocation = invocation
                .arg("--")
                .args(settings.browser_arguments.iter().cloned());
        }

        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            invocation = invocation.env(key.as_str(), value.as_str());
        }
        Ok(invocation)
    }
}

#[async_trait]
impl ExecutionProvider for HeadlessProvider {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn execute(
        &self,
        context: &TestContext,
        options: &ExecutionOptions,
        callback: &CallbackSender,
    ) -> Vec<TestFileSummary> {
        let invocation = match self.build_invocation(context, options) {
            Ok(invocation) => invocation,
            Err(e) => return setup_failure(context, e.to_string(), callback),
        };
        debug!(
            "[{}] {} -> {}",
            self.kind,
            context.first_input_file().display(),
            invocation.display()
        );

        let io_timeout = options.io_timeout(&context.settings);
        match ProcessSource::spawn(&invocation, io_timeout) {
            Ok(source) => drive(source, context, options, callback).await,
            Err(e) => {
                error!("[{}] {}", self.kind, e);
                setup_failure(context, e.to_string(), callback)
            }
        }
    }
}

impl ProviderRegistry {
    /// Registers a [`HeadlessProvider`] for every configured process engine.
    pub fn with_process_engines(mut self, engines: &EnginesConfig) -> Self {
        let configured = [
            (EngineKind::Phantom, &engines.phantom),
            (EngineKind::Chrome, &engines.chrome),
        ];
        for (kind, config) in configured {
            if let Some(config) = config {
                self.register(std::sync::Arc::new(HeadlessProvider::new(kind, config.clone())));
            }
        }
        self
    }
}
