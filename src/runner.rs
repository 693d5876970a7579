//! Test run orchestration.
//!
//! The [`TestRunner`] turns a list of test file paths into a
//! [`TestCaseSummary`]:
//!
//! ```text
//!  paths ──► ContextBuilder ──► Vec<TestContext>
//!                                     │
//!                                     ▼
//!                           BatchCompileEngine ──► blocked files
//!                                     │                 │
//!                                     ▼                 │
//!                  ProviderRegistry (≤ max_parallel)    │
//!                                     │                 │
//!                                     ▼                 ▼
//!                                TestFileSummary (one per file)
//!                                     │
//!                                     ▼
//!                              TestCaseSummary
//! ```
//!
//! Contexts execute concurrently, bounded by a semaphore. Every
//! notification goes through a [`ParallelCallbackAdapter`], so the callback
//! sees one call at a time. Files that could not be built or compiled are
//! not executed; each contributes a summary with zero tests and one error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info};

use crate::callback::{CallbackSender, ParallelCallbackAdapter, RunnerCallback};
use crate::compile::BatchCompileEngine;
use crate::config::{Config, EngineKind, TestFileSettings};
use crate::context::{ContextBuilder, TestContext, TestMode};
use crate::engine::{ExecutionOptions, ProviderRegistry};
use crate::summary::{TestCaseSummary, TestFileSummary};

/// Runs test files through compilation and execution.
pub struct TestRunner {
    builder: Arc<dyn ContextBuilder>,
    registry: ProviderRegistry,
    compiler: BatchCompileEngine,
    settings: Arc<TestFileSettings>,
    engine: EngineKind,
    options: ExecutionOptions,
    max_parallel: usize,
}

impl TestRunner {
    /// Creates a runner with default options on the `phantom` engine.
    pub fn new(
        builder: Arc<dyn ContextBuilder>,
        registry: ProviderRegistry,
        compiler: BatchCompileEngine,
        settings: Arc<TestFileSettings>,
    ) -> Self {
        Self {
            builder,
            registry,
            compiler,
            settings,
            engine: EngineKind::default(),
            options: ExecutionOptions::default(),
            max_parallel: 1,
        }
    }

    /// Creates a runner with the engine, options, parallelism and settings
    /// from `config`.
    pub fn from_config(
        config: &Config,
        builder: Arc<dyn ContextBuilder>,
        registry: ProviderRegistry,
        compiler: BatchCompileEngine,
    ) -> Self {
        let options = ExecutionOptions {
            global_timeout_ms: config.runner.test_timeout_ms,
            elevated: config.runner.elevated,
            stream_output: config.runner.stream_output,
            ..Default::default()
        };
        Self::new(builder, registry, compiler, Arc::new(config.settings.clone()))
            .with_engine(config.runner.engine)
            .with_options(options)
            .with_max_parallel(config.runner.max_parallel)
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Maximum number of contexts executing at once. Clamped to at least 1.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Runs `paths` and hands the callback back once every notification has
    /// been delivered.
    ///
    /// Must run on a multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Fails only if the callback task panicked.
    pub async fn run<C: RunnerCallback + 'static>(
        &self,
        paths: &[PathBuf],
        mode: TestMode,
        callback: C,
    ) -> Result<(TestCaseSummary, C)> {
        let adapter = ParallelCallbackAdapter::spawn(callback);
        let sender = adapter.sender();
        let summary = self.run_with_sender(paths, mode, &sender).await;
        drop(sender);
        let callback = adapter.finish().await.context("Callback task failed")?;
        Ok((summary, callback))
    }

    /// Runs `paths`, reporting through an existing sender.
    pub async fn run_with_sender(
        &self,
        paths: &[PathBuf],
        mode: TestMode,
        callback: &CallbackSender,
    ) -> TestCaseSummary {
        let start = Instant::now();
        callback.test_suite_started();

        let mut slots: Vec<Vec<TestFileSummary>> = vec![Vec::new(); paths.len()];
        let mut contexts = Vec::new();
        let mut origins = Vec::new();
        for (index, path) in paths.iter().enumerate() {
            match self.builder.build_context(path, &self.settings) {
                Ok(context) => {
                    contexts.push(context);
                    origins.push(index);
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!("{}", message);
                    slots[index].push(report_unrunnable(path, message, callback));
                }
            }
        }

        let report = self.compiler.compile(&mut contexts).await;
        for message in &report.diagnostics {
            debug!("Compile: {}", message);
        }
        for context in &mut contexts {
            if context.use_generated_harness() {
                debug!(
                    "Harness for {} is {}",
                    context.first_input_file().display(),
                    context.harness_path
                );
            }
        }

        let mut runnable = Vec::new();
        for (position, context) in contexts.iter().enumerate() {
            match report.blocked.get(&position) {
                Some(blocked) => {
                    let summary = report_unrunnable(
                        context.first_input_file(),
                        blocked.message.clone(),
                        callback,
                    );
                    slots[origins[position]].push(summary);
                }
                None => runnable.push((origins[position], context)),
            }
        }

        let options = ExecutionOptions {
            mode,
            ..self.options.clone()
        };
        info!(
            "Running {} of {} test files on {} ({} at a time)",
            runnable.len(),
            paths.len(),
            self.engine,
            self.max_parallel
        );
        for (index, summaries) in self.execute(runnable, &options, callback) {
            slots[index] = summaries;
        }

        let mut summary = TestCaseSummary::new();
        for file in slots.into_iter().flatten() {
            summary.append(file);
        }
        summary.duration = start.elapsed();
        info!(
            "Finished {} tests in {:.2}s: {} passed, {} failed, {} skipped",
            summary.total_count(),
            summary.duration.as_secs_f64(),
            summary.passed_count(),
            summary.failed_count(),
            summary.skipped_count()
        );

        callback.test_suite_finished(summary.clone());
        summary
    }

    /// Executes contexts concurrently, returning summaries keyed by the
    /// position of their input path.
    fn execute(
        &self,
        runnable: Vec<(usize, &TestContext)>,
        options: &ExecutionOptions,
        callback: &CallbackSender,
    ) -> Vec<(usize, Vec<TestFileSummary>)> {
        let semaphore = Semaphore::new(self.max_parallel);
        let results: Mutex<Vec<(usize, Vec<TestFileSummary>)>> = Mutex::new(Vec::new());

        // Scoped spawns borrow the contexts and registry without 'static
        tokio_scoped::scope(|scope| {
            for (index, context) in runnable {
                let semaphore = &semaphore;
                let results = &results;
                let registry = &self.registry;
                let engine = self.engine;

                scope.spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    debug!("Executing {}", context.first_input_file().display());
                    let summaries = registry.execute(engine, context, options, callback).await;
                    results.lock().await.push((index, summaries));
                });
            }
        });

        results.into_inner()
    }
}

/// A file that never reached an engine: zero tests and one error.
fn report_unrunnable(path: &Path, message: String, callback: &CallbackSender) -> TestFileSummary {
    let summary = TestFileSummary::failed(path, message.clone());
    callback.file_error(summary.errors[0].clone());
    callback.exception_thrown(message, path);
    callback.file_finished(summary.clone());
    summary
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::compile::probe::memory::MemoryProbe;
    use crate::compile::{CompileResult, CompilerOutput, CompilerRunner, FileProbe};
    use crate::config::{BatchCompileConfiguration, CompilePathMap, OutputPathType};
    use crate::context::ReferencedFile;
    use crate::engine::ExecutionProvider;
    use crate::summary::{TestCase, TestProcessExitCode, TestResult};

    struct StubBuilder;

    impl ContextBuilder for StubBuilder {
        fn build_context(
            &self,
            path: &Path,
            settings: &Arc<TestFileSettings>,
        ) -> Result<TestContext> {
            if path.to_string_lossy().contains("missing") {
                anyhow::bail!("Test file not found: {}", path.display());
            }
            let context = TestContext::new(path, "/tests/harness.html", Arc::clone(settings));
            Ok(context.with_reference(ReferencedFile::new(path)))
        }
    }

    /// Uses each test file as its own harness.
    struct SelfHarnessBuilder;

    impl ContextBuilder for SelfHarnessBuilder {
        fn build_context(
            &self,
            path: &Path,
            settings: &Arc<TestFileSettings>,
        ) -> Result<TestContext> {
            let harness = path.to_string_lossy().into_owned();
            let context = TestContext::new(path, harness, Arc::clone(settings));
            Ok(context.with_reference(ReferencedFile::new(path)))
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        modes: std::sync::Mutex<Vec<TestMode>>,
        harnesses: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExecutionProvider for FakeProvider {
        fn kind(&self) -> EngineKind {
            EngineKind::Phantom
        }

        async fn execute(
            &self,
            context: &TestContext,
            options: &ExecutionOptions,
            callback: &CallbackSender,
        ) -> Vec<TestFileSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().unwrap().push(options.mode);
            self.harnesses.lock().unwrap().push(context.harness_path.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let path = context.first_input_file();
            callback.file_started(path);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let mut summary = TestFileSummary::new(path);
            summary.tests.push(TestCase {
                input_test_file: path.to_path_buf(),
                test_name: "works".to_string(),
                results: vec![TestResult {
                    passed: true,
                    ..Default::default()
                }],
                ..Default::default()
            });
            summary.exit_code = Some(TestProcessExitCode::AllPassed);
            callback.file_finished(summary.clone());
            vec![summary]
        }
    }

    #[derive(Default)]
    struct Recorder {
        suites_started: usize,
        suite_total: Option<usize>,
        finished: Vec<PathBuf>,
        exceptions: Vec<String>,
    }

    impl RunnerCallback for Recorder {
        fn test_suite_started(&mut self) {
            self.suites_started += 1;
        }

        fn test_suite_finished(&mut self, summary: &TestCaseSummary) {
            self.suite_total = Some(summary.files().len());
        }

        fn file_finished(&mut self, path: &Path, _summary: &TestFileSummary) {
            self.finished.push(path.to_path_buf());
        }

        fn exception_thrown(&mut self, message: &str, _path: &Path) {
            self.exceptions.push(message.to_string());
        }
    }

    struct FailingCompiler;

    #[async_trait]
    impl CompilerRunner for FailingCompiler {
        async fn run(
            &self,
            _config: &BatchCompileConfiguration,
            _settings: &TestFileSettings,
        ) -> CompileResult<CompilerOutput> {
            Ok(CompilerOutput {
                exit_code: Some(2),
                output: "error TS2304: Cannot find name 'x'.".to_string(),
            })
        }
    }

    fn runner(provider: &Arc<FakeProvider>, settings: TestFileSettings) -> TestRunner {
        let registry = ProviderRegistry::new().with(Arc::clone(provider) as _);
        let probe = Arc::new(MemoryProbe::new().with_file("/tests/a.ts", 10));
        let compiler = BatchCompileEngine::new(Arc::new(FailingCompiler))
            .with_probe(probe as Arc<dyn FileProbe>);
        TestRunner::new(Arc::new(StubBuilder), registry, compiler, Arc::new(settings))
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/tests/{}", n))).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_every_file_in_input_order() {
        let provider = Arc::new(FakeProvider::default());
        let runner = runner(&provider, TestFileSettings::default()).with_max_parallel(4);
        let paths = paths(&["a.js", "b.js", "c.js"]);

        let (summary, recorder) = runner
            .run(&paths, TestMode::Execution, Recorder::default())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        let order: Vec<&Path> = summary.files().iter().map(|f| f.path.as_path()).collect();
        assert_eq!(order, paths.iter().map(PathBuf::as_path).collect::<Vec<_>>());
        assert_eq!(summary.passed_count(), 3);
        assert!(summary.success());

        assert_eq!(recorder.suites_started, 1);
        assert_eq!(recorder.suite_total, Some(3));
        assert_eq!(recorder.finished.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_is_bounded() {
        let provider = Arc::new(FakeProvider::default());
        let runner = runner(&provider, TestFileSettings::default()).with_max_parallel(2);
        let paths = paths(&["1.js", "2.js", "3.js", "4.js", "5.js", "6.js"]);

        let (summary, _) = runner
            .run(&paths, TestMode::Execution, Recorder::default())
            .await
            .unwrap();

        assert_eq!(summary.files().len(), 6);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
        assert!(provider.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mode_is_passed_to_provider() {
        let provider = Arc::new(FakeProvider::default());
        let runner = runner(&provider, TestFileSettings::default());

        runner
            .run(&paths(&["a.js"]), TestMode::Discovery, Recorder::default())
            .await
            .unwrap();

        assert_eq!(*provider.modes.lock().unwrap(), vec![TestMode::Discovery]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unbuildable_file_reports_error() {
        let provider = Arc::new(FakeProvider::default());
        let runner = runner(&provider, TestFileSettings::default());

        let (summary, recorder) = runner
            .run(
                &paths(&["a.js", "missing.js"]),
                TestMode::Execution,
                Recorder::default(),
            )
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let missing = summary.file(Path::new("/tests/missing.js")).unwrap();
        assert!(missing.tests.is_empty());
        assert_eq!(missing.errors.len(), 1);
        assert!(missing.errors[0].message.contains("not found"));
        assert_eq!(recorder.exceptions.len(), 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_compile_failure_blocks_group() {
        let provider = Arc::new(FakeProvider::default());
        let settings = TestFileSettings {
            settings_file: Some(PathBuf::from("/tests/chutzpah.toml")),
            compile: Some(BatchCompileConfiguration {
                extensions: vec![".ts".to_string()],
                executable: Some("tsc".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let runner = runner(&provider, settings);

        let (summary, recorder) = runner
            .run(&paths(&["a.ts", "b.js"]), TestMode::Execution, Recorder::default())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.files().len(), 2);
        assert_eq!(summary.total_count(), 0);
        assert_eq!(summary.errors().count(), 2);
        assert!(summary.errors().all(|e| e.message.contains("TS2304")));
        assert_eq!(recorder.finished.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_compiled_file_runs_through_generated_output() {
        let provider = Arc::new(FakeProvider::default());
        let settings = TestFileSettings {
            settings_file: Some(PathBuf::from("/tests/chutzpah.toml")),
            compile: Some(BatchCompileConfiguration {
                extensions: vec![".ts".to_string()],
                paths: vec![CompilePathMap {
                    source_path: PathBuf::from("/tests"),
                    output_path: PathBuf::from("/tests/out"),
                    output_path_type: OutputPathType::Folder,
                }],
                executable: Some("tsc".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/tests/a.ts", 10)
                .with_file("/tests/out/a.js", 20),
        );
        let compiler = BatchCompileEngine::new(Arc::new(FailingCompiler))
            .with_probe(probe as Arc<dyn FileProbe>);
        let registry = ProviderRegistry::new().with(Arc::clone(&provider) as _);
        let runner =
            TestRunner::new(Arc::new(SelfHarnessBuilder), registry, compiler, Arc::new(settings));

        let (summary, _) = runner
            .run(&paths(&["a.ts", "b.js"]), TestMode::Execution, Recorder::default())
            .await
            .unwrap();

        assert!(summary.success());
        let mut harnesses = provider.harnesses.lock().unwrap().clone();
        harnesses.sort();
        assert_eq!(harnesses, vec!["/tests/b.js", "/tests/out/a.js"]);
        assert!(summary.file(Path::new("/tests/a.ts")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregistered_engine_is_reported() {
        let provider = Arc::new(FakeProvider::default());
        let runner =
            runner(&provider, TestFileSettings::default()).with_engine(EngineKind::Chrome);

        let (summary, _) = runner
            .run(&paths(&["a.js"]), TestMode::Execution, Recorder::default())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        let errors: Vec<_> = summary.errors().collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("chrome"));
    }

    #[test]
    fn test_from_config() {
        let config = crate::config::load_config_str(
            r#"
            [runner]
            max_parallel = 0
            engine = "hosted"
            test_timeout_ms = 1000
            stream_output = true
            "#,
        )
        .unwrap();
        let runner = TestRunner::from_config(
            &config,
            Arc::new(StubBuilder),
            ProviderRegistry::new(),
            BatchCompileEngine::new(Arc::new(FailingCompiler)),
        );

        assert_eq!(runner.max_parallel, 1);
        assert_eq!(runner.engine, EngineKind::Hosted);
        assert_eq!(runner.options.global_timeout_ms, Some(1000));
        assert!(runner.options.stream_output);
    }
}
