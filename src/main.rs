//! chutzpah CLI - headless JavaScript test runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chutzpah::compile::{BatchCompileEngine, CompilerCache, ProcessCompilerRunner};
use chutzpah::config::{self, Config};
use chutzpah::context::{SingleFileContextBuilder, TestMode};
use chutzpah::engine::ProviderRegistry;
use chutzpah::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use chutzpah::runner::TestRunner;

const DEFAULT_CONFIG: &str = "chutzpah.toml";

#[derive(Parser)]
#[command(name = "chutzpah")]
#[command(about = "Headless JavaScript test runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: chutzpah.toml if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test files
    Run {
        /// Test files (or harness pages) to run
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Override the maximum number of files executing at once
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Only enumerate tests, don't run them
        #[arg(long)]
        discovery: bool,

        /// Harness page shared by every test file
        #[arg(long)]
        harness: Option<String>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            files,
            parallel,
            discovery,
            harness,
            junit,
        } => {
            let options = RunOptions {
                parallel,
                discovery,
                harness,
                junit,
                verbose: cli.verbose,
            };
            run_tests(cli.config.as_deref(), &files, options).await
        }
        Commands::Validate => validate_config(cli.config.as_deref()),
    }
}

struct RunOptions {
    parallel: Option<usize>,
    discovery: bool,
    harness: Option<String>,
    junit: Option<PathBuf>,
    verbose: bool,
}

/// Loads the explicit config, else `chutzpah.toml` when present, else defaults.
fn load(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG))
        }
        None => Ok(Config::default()),
    }
}

async fn run_tests(
    config_path: Option<&Path>,
    files: &[PathBuf],
    options: RunOptions,
) -> Result<()> {
    let mut config = load(config_path)?;
    if let Some(parallel) = options.parallel {
        config.runner.max_parallel = parallel;
    }

    let files = files
        .iter()
        .map(|f| {
            std::path::absolute(f).with_context(|| format!("Invalid path {}", f.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let registry = ProviderRegistry::new().with_process_engines(&config.engines);
    if registry.get(config.runner.engine).is_none() {
        warn!(
            "No [engines.{}] section configured; every file will fail",
            config.runner.engine
        );
    }

    let cache = config
        .report
        .compiler_cache
        .as_deref()
        .map(|path| Arc::new(CompilerCache::load(path)));
    let mut compiler = BatchCompileEngine::new(Arc::new(ProcessCompilerRunner));
    if let Some(cache) = &cache {
        compiler = compiler.with_cache(Arc::clone(cache));
    }

    let builder = match options.harness {
        Some(harness) => SingleFileContextBuilder::with_harness(harness),
        None => SingleFileContextBuilder::new(),
    };
    let runner = TestRunner::from_config(&config, Arc::new(builder), registry, compiler);

    let mut reporter =
        MultiReporter::new().with_reporter(ConsoleReporter::new(files.len(), options.verbose));
    if let Some(junit) = options.junit.or_else(|| config.report.junit.clone()) {
        reporter = reporter.with_reporter(JUnitReporter::new(junit));
    }

    let mode = if options.discovery {
        TestMode::Discovery
    } else {
        TestMode::Execution
    };
    info!("Running {} test files", files.len());
    let (summary, _) = runner.run(&files, mode, reporter).await?;

    if let Some(cache) = cache
        && let Err(e) = cache.save()
    {
        warn!("Failed to save compiler cache: {:#}", e);
    }

    std::process::exit(summary.exit_code());
}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    match load(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Runner:");
            println!("  Max parallel: {}", config.runner.max_parallel);
            match config.runner.test_timeout_ms {
                Some(timeout) => println!("  Test timeout: {}ms", timeout),
                None => println!("  Test timeout: default"),
            }
            println!("  Engine: {}", config.runner.engine);

            let mut engines = Vec::new();
            if config.engines.phantom.is_some() {
                engines.push("phantom");
            }
            if config.engines.chrome.is_some() {
                engines.push("chrome");
            }
            println!("  Configured engines: {}", display_list(&engines));

            match &config.settings.compile {
                Some(compile) => {
                    println!();
                    println!("Batch compile:");
                    println!("  Mode: {:?}", compile.mode);
                    println!("  Extensions: {}", display_list(&compile.extensions));
                    println!("  Path mappings: {}", compile.paths.len());
                    println!("  Skip if unchanged: {}", compile.skip_if_unchanged);
                }
                None => println!("  Batch compile: off"),
            }

            if let Some(junit) = &config.report.junit {
                println!("  JUnit report: {}", junit.display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn display_list<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ")
    }
}
