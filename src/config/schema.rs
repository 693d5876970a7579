//! Configuration schema definitions for chutzpah.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! lowercase enums for engine and compile-mode selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig             - Parallelism, global timeout, engine choice
//! ├── EnginesConfig            - Launch settings per process engine
//! │   ├── phantom              - PhantomJS-style headless engine
//! │   └── chrome               - Chrome-headless engine driven by a node script
//! ├── TestFileSettings         - Settings shared by every test file
//! │   └── BatchCompileConfiguration
//! │       └── CompilePathMap   - source -> output mappings
//! └── ReportConfig             - JUnit output and compiler cache location
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for chutzpah.
///
/// Every section is optional; an empty file yields a runnable default
/// configuration (as long as an engine section is present for the chosen
/// engine).
///
/// # TOML Structure
///
/// ```toml
/// [runner]
/// max_parallel = 4
/// test_timeout_ms = 10000
/// engine = "phantom"
///
/// [engines.phantom]
/// executable = "~/bin/phantomjs"
/// runner_script = "runners/chutzpahRunner.js"
///
/// [settings]
/// user_agent = "chutzpah"
///
/// [settings.compile]
/// extensions = [".ts"]
/// extensions_with_no_output = [".d.ts"]
/// executable = "tsc"
/// arguments = "-p ."
///
/// [[settings.compile.paths]]
/// source_path = "src"
/// output_path = "out"
///
/// [report]
/// junit = "test-results/junit.xml"
/// ```
///
/// # Example
///
/// ```
/// use chutzpah::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [runner]
///     max_parallel = 2
/// "#).unwrap();
/// assert_eq!(config.runner.max_parallel, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core runner settings (parallelism, timeouts, engine).
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Launch settings for process-based engines.
    #[serde(default)]
    pub engines: EnginesConfig,

    /// Settings applied to every test file.
    #[serde(default)]
    pub settings: TestFileSettings,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core runner execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | CPU count + 1 |
/// | `test_timeout_ms` | None (falls back to 30000) |
/// | `engine` | `phantom` |
/// | `elevated` | false |
/// | `stream_output` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Maximum number of test files executing at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Global per-file timeout in milliseconds.
    ///
    /// A file-level `test_file_timeout_ms` in the settings takes precedence.
    pub test_timeout_ms: Option<u64>,

    /// Engine family used to execute test files.
    #[serde(default)]
    pub engine: EngineKind,

    /// Tell the runner script it is running with elevated privileges.
    #[serde(default)]
    pub elevated: bool,

    /// Log engine output that is not part of the protocol at debug level
    /// instead of trace. `!!_!!` diagnostics are always logged at debug
    /// level under the `chutzpah::trace` target.
    #[serde(default)]
    pub stream_output: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            test_timeout_ms: None,
            engine: EngineKind::default(),
            elevated: false,
            stream_output: false,
        }
    }
}

fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}

/// Execution engine families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// PhantomJS-style headless browser process.
    #[default]
    Phantom,
    /// Chrome headless, driven by a node runner script.
    Chrome,
    /// An engine hosted inside this process.
    Hosted,
}

impl EngineKind {
    /// Lowercase name as used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Phantom => "phantom",
            EngineKind::Chrome => "chrome",
            EngineKind::Hosted => "hosted",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Launch settings for the process-based engines.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EnginesConfig {
    /// Settings for the `phantom` engine.
    pub phantom: Option<ProcessEngineConfig>,

    /// Settings for the `chrome` engine.
    pub chrome: Option<ProcessEngineConfig>,
}

/// How to launch one process-based engine.
///
/// # Example
///
/// ```toml
/// [engines.chrome]
/// executable = "node"
/// runner_script = "runners/chrome/chromeRunner.js"
///
/// [engines.chrome.env]
/// CHROME_PATH = "/usr/bin/chromium"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessEngineConfig {
    /// Program to spawn. `~` is expanded.
    pub executable: String,

    /// Script handed to the program as its first positional argument.
    pub runner_script: PathBuf,

    /// Arguments placed before the runner script.
    #[serde(default)]
    pub prefix_args: Vec<String>,

    /// Extra environment variables for the engine process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Settings that apply to a set of test files.
///
/// Settings instances are shared by reference between every test context
/// loaded from the same settings file; batch compilation groups contexts by
/// the identity of this object, not by its contents.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestFileSettings {
    /// Path of the file these settings were loaded from.
    ///
    /// Used to label compile failures.
    pub settings_file: Option<PathBuf>,

    /// File-level timeout in milliseconds.
    pub test_file_timeout_ms: Option<u64>,

    /// User agent passed to the engine.
    pub user_agent: Option<String>,

    /// Extra arguments forwarded to the browser.
    #[serde(default)]
    pub browser_arguments: Vec<String>,

    /// Keep running when the page fails to load a resource.
    #[serde(default)]
    pub ignore_resource_loading_errors: bool,

    /// Batch compile configuration, if sources need compiling first.
    pub compile: Option<BatchCompileConfiguration>,
}

impl TestFileSettings {
    /// Name used when reporting problems with these settings.
    pub fn display_name(&self) -> String {
        self.settings_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline settings>".to_string())
    }
}

/// Batch compile specification for one settings file.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `skip_if_unchanged` | true |
/// | `mode` | `executable` |
/// | `ignore_missing_files` | false |
/// | `use_source_maps` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchCompileConfiguration {
    /// File suffixes eligible for compilation (e.g. `.ts`).
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Suffixes that compile but produce no standalone output (e.g. `.d.ts`).
    #[serde(default)]
    pub extensions_with_no_output: Vec<String>,

    /// Ordered source -> output mappings. The first match wins.
    #[serde(default)]
    pub paths: Vec<CompilePathMap>,

    /// Only compile when some output is missing or stale.
    #[serde(default = "default_true")]
    pub skip_if_unchanged: bool,

    /// Whether this runner invokes the compiler.
    #[serde(default)]
    pub mode: CompileMode,

    /// Do not fail a file whose generated output cannot be found.
    #[serde(default)]
    pub ignore_missing_files: bool,

    /// Compiler program, required in `executable` mode. `~` is expanded.
    pub executable: Option<String>,

    /// Compiler arguments, split with shell quoting rules.
    pub arguments: Option<String>,

    /// Directory the compiler runs in.
    pub working_directory: Option<PathBuf>,

    /// Maximum compiler run time in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Attach `<generated>.map` files when they exist.
    #[serde(default)]
    pub use_source_maps: bool,
}

impl Default for BatchCompileConfiguration {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            extensions_with_no_output: Vec::new(),
            paths: Vec::new(),
            skip_if_unchanged: true,
            mode: CompileMode::default(),
            ignore_missing_files: false,
            executable: None,
            arguments: None,
            working_directory: None,
            timeout_ms: None,
            use_source_maps: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Who runs the batch compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// Chutzpah runs the configured compiler executable.
    #[default]
    Executable,
    /// Something else compiles; outputs are only located, never produced.
    External,
}

/// One source -> output mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompilePathMap {
    /// Source file or directory. Matched as a case-insensitive substring.
    pub source_path: PathBuf,

    /// Output file or directory.
    pub output_path: PathBuf,

    /// Whether `output_path` names a single file or a directory.
    #[serde(default)]
    pub output_path_type: OutputPathType,
}

/// Kind of output target a mapping writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPathType {
    /// Outputs go below a directory.
    #[default]
    Folder,
    /// Every mapped source is combined into one output file.
    File,
}

/// Configuration for report output.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Where to write a JUnit XML report, if anywhere.
    pub junit: Option<PathBuf>,

    /// Where to persist the compiled-source cache, if anywhere.
    pub compiler_cache: Option<PathBuf>,
}
