//! chutzpah: a headless JavaScript test runner.
//!
//! Test files run inside a headless browser engine (or an engine hosted in
//! this process). Engines report progress over a line-oriented protocol on
//! their output, which is decoded into per-file summaries. Sources written in
//! compile-to-JavaScript languages are batch-compiled beforehand, and only
//! when their outputs are stale.
//!
//! # Architecture
//!
//! - **Protocol**: decode engine output lines ([`protocol`])
//! - **Stream**: line sources with liveness tracking and a watchdog ([`stream`])
//! - **Engine**: execution providers per engine family ([`engine`])
//! - **Compile**: incremental batch compilation ([`compile`])
//! - **Runner**: bounded-parallel orchestration of a run ([`runner`])
//! - **Callback / Report**: serialized progress notifications and
//!   console/JUnit output ([`callback`], [`report`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chutzpah::callback::NullCallback;
//! use chutzpah::compile::{BatchCompileEngine, ProcessCompilerRunner};
//! use chutzpah::config::load_config;
//! use chutzpah::context::{SingleFileContextBuilder, TestMode};
//! use chutzpah::engine::ProviderRegistry;
//! use chutzpah::runner::TestRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("chutzpah.toml"))?;
//!     let registry = ProviderRegistry::new().with_process_engines(&config.engines);
//!     let compiler = BatchCompileEngine::new(Arc::new(ProcessCompilerRunner));
//!     let runner = TestRunner::from_config(
//!         &config,
//!         Arc::new(SingleFileContextBuilder::new()),
//!         registry,
//!         compiler,
//!     );
//!
//!     let files = vec!["tests/math.html".into()];
//!     let (summary, _) = runner.run(&files, TestMode::Execution, NullCallback).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod callback;
pub mod compile;
pub mod config;
pub mod context;
pub mod engine;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod stream;
pub mod summary;

// Re-export commonly used types
pub use callback::{ParallelCallbackAdapter, RunnerCallback};
pub use config::{Config, load_config};
pub use runner::TestRunner;
pub use summary::{TestCaseSummary, TestFileSummary};
