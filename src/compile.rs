//! Incremental batch compilation.
//!
//! Test files written in a compile-to-JavaScript language are compiled once
//! per settings group, before any of them runs. [`BatchCompileEngine`]:
//!
//! 1. groups contexts by the identity of their settings object,
//! 2. plans every eligible source file ([`SourceCompileInfo`]),
//! 3. decides whether to compile ([`check_if_compile_is_needed`]),
//! 4. runs the compiler ([`CompilerRunner`]) or warns in external mode,
//! 5. records each source's generated output on its [`ReferencedFile`].
//!
//! A compiler failure blocks every file of its group. A generated file that
//! cannot be found blocks only the files that reference it, unless
//! `ignore_missing_files` is set. Blocked files are listed in the returned
//! [`CompileReport`] and never executed.
//!
//! [`ReferencedFile`]: crate::context::ReferencedFile

pub mod cache;
pub mod mapping;
pub mod probe;
pub mod staleness;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::{BatchCompileConfiguration, CompileMode, CompilePathMap, TestFileSettings};
use crate::context::TestContext;
use crate::summary::TestError;

pub use cache::{CachedCompiler, CompilerCache, SourceCompiler, hash_source};
pub use mapping::{colocated_output_path, resolve_output_path};
pub use probe::{FileProbe, FileProperties, RealFileProbe};
pub use staleness::{PathProperties, SourceCompileInfo, check_if_compile_is_needed};

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The compiler exited with a positive code.
    #[error("Batch compile failed for settings file {settings_file}:\n{output}")]
    CompilationFailure {
        settings_file: String,
        output: String,
    },

    #[error("Batch compile for settings file {settings_file} timed out after {timeout_ms}ms")]
    Timeout {
        settings_file: String,
        timeout_ms: u64,
    },

    #[error("No compiler executable configured in settings file {settings_file}")]
    MissingExecutable { settings_file: String },

    #[error("Invalid compiler arguments in settings file {settings_file}: {reason}")]
    InvalidArguments {
        settings_file: String,
        reason: String,
    },

    #[error("Failed to start compiler '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't find generated file for {}", path.display())]
    MissingGeneratedFile { path: PathBuf },

    /// An in-process [`SourceCompiler`] rejected its input.
    #[error("{0}")]
    Compiler(String),
}

/// What the compiler printed and how it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOutput {
    /// `None` when the compiler was killed by a signal.
    pub exit_code: Option<i32>,

    /// Standard output followed by standard error.
    pub output: String,
}

/// Runs the batch compiler for one settings group.
#[async_trait]
pub trait CompilerRunner: Send + Sync {
    async fn run(
        &self,
        config: &BatchCompileConfiguration,
        settings: &TestFileSettings,
    ) -> CompileResult<CompilerOutput>;
}

/// Runs the configured compiler executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCompilerRunner;

#[async_trait]
impl CompilerRunner for ProcessCompilerRunner {
    async fn run(
        &self,
        config: &BatchCompileConfiguration,
        settings: &TestFileSettings,
    ) -> CompileResult<CompilerOutput> {
        let settings_file = settings.display_name();
        let executable = config
            .executable
            .as_deref()
            .ok_or_else(|| CompileError::MissingExecutable {
                settings_file: settings_file.clone(),
            })?;
        let program = shellexpand::tilde(executable).into_owned();
        let args = shell_words::split(config.arguments.as_deref().unwrap_or_default()).map_err(
            |e| CompileError::InvalidArguments {
                settings_file: settings_file.clone(),
                reason: e.to_string(),
            },
        )?;

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let base = base_dir(settings);
        match (&config.working_directory, &base) {
            (Some(dir), Some(base)) => command.current_dir(base.join(dir)),
            (Some(dir), None) => command.current_dir(dir),
            (None, Some(base)) => command.current_dir(base),
            (None, None) => &mut command,
        };

        debug!("Running compiler: {} {}", program, shell_words::join(&args));
        let output = command.output();
        let output = match config.timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(Duration::from_millis(timeout_ms), output)
                .await
                .map_err(|_| CompileError::Timeout {
                    settings_file: settings_file.clone(),
                    timeout_ms,
                })?,
            None => output.await,
        }
        .map_err(|source| CompileError::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CompilerOutput {
            exit_code: output.status.code(),
            output: text,
        })
    }
}

/// Outcome of a compile pass over a set of contexts.
#[derive(Debug, Default)]
pub struct CompileReport {
    /// Context index to the error that keeps it from running.
    pub blocked: BTreeMap<usize, TestError>,

    /// Groups where the compiler ran.
    pub compiled_groups: usize,

    /// Groups whose outputs were up to date, or that compile externally.
    pub skipped_groups: usize,

    /// Non-fatal problems: unmapped sources, suppressed missing outputs.
    pub diagnostics: Vec<String>,
}

impl CompileReport {
    pub fn is_blocked(&self, index: usize) -> bool {
        self.blocked.contains_key(&index)
    }
}

/// Groups context indices by settings identity, in first-seen order.
///
/// Two settings objects with equal contents but different allocations form
/// different groups.
pub fn group_by_settings(contexts: &[TestContext]) -> Vec<Vec<usize>> {
    let mut groups: Vec<(&Arc<TestFileSettings>, Vec<usize>)> = Vec::new();
    for (index, context) in contexts.iter().enumerate() {
        match groups
            .iter_mut()
            .find(|(settings, _)| Arc::ptr_eq(settings, &context.settings))
        {
            Some((_, members)) => members.push(index),
            None => groups.push((&context.settings, vec![index])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

/// Plans, runs and resolves batch compilation.
pub struct BatchCompileEngine {
    runner: Arc<dyn CompilerRunner>,
    probe: Arc<dyn FileProbe>,
    cache: Option<Arc<CompilerCache>>,
}

impl BatchCompileEngine {
    /// An engine probing the real file system, without a cache.
    pub fn new(runner: Arc<dyn CompilerRunner>) -> Self {
        Self {
            runner,
            probe: Arc::new(RealFileProbe),
            cache: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn FileProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Records compiled outputs in `cache` whenever a compile actually ran.
    pub fn with_cache(mut self, cache: Arc<CompilerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Compiles every settings group that has a compile configuration.
    pub async fn compile(&self, contexts: &mut [TestContext]) -> CompileReport {
        let mut report = CompileReport::default();

        for group in group_by_settings(contexts) {
            let settings = Arc::clone(&contexts[group[0]].settings);
            let Some(config) = settings.compile.as_ref() else {
                continue;
            };

            if let Err(e) = self
                .compile_group(&settings, config, contexts, &group, &mut report)
                .await
            {
                error!("{}", e);
                for &index in &group {
                    let error = TestError::new(contexts[index].first_input_file(), e.to_string());
                    report.blocked.insert(index, error);
                }
            }
        }
        report
    }

    /// Compiles one group.
    ///
    /// # Errors
    ///
    /// Fails when the compiler could not run or reported failure; the whole
    /// group is then unusable.
    pub async fn compile_group(
        &self,
        settings: &TestFileSettings,
        config: &BatchCompileConfiguration,
        contexts: &mut [TestContext],
        group: &[usize],
        report: &mut CompileReport,
    ) -> CompileResult<()> {
        let paths = effective_paths(config, settings);
        let infos = self.plan(config, &paths, contexts, group, report);
        let files: Vec<SourceCompileInfo> = infos.values().cloned().collect();

        let mut compiled = false;
        if check_if_compile_is_needed(config, &files) {
            match config.mode {
                CompileMode::Executable => {
                    info!("Running batch compile for {}", settings.display_name());
                    let output = self.runner.run(config, settings).await?;
                    match output.exit_code {
                        Some(code) if code > 0 => {
                            return Err(CompileError::CompilationFailure {
                                settings_file: settings.display_name(),
                                output: output.output,
                            });
                        }
                        None => {
                            return Err(CompileError::CompilationFailure {
                                settings_file: settings.display_name(),
                                output: format!("Terminated by a signal\n{}", output.output),
                            });
                        }
                        Some(code) if code < 0 => {
                            warn!("Compiler exited with {}; continuing", code);
                        }
                        Some(_) => {}
                    }
                    compiled = true;
                    report.compiled_groups += 1;
                }
                CompileMode::External => {
                    warn!(
                        "Sources for {} are out of date but compile mode is external; \
                         results may be stale",
                        settings.display_name()
                    );
                    report.skipped_groups += 1;
                }
            }
        } else {
            debug!("Compiled outputs for {} are up to date", settings.display_name());
            report.skipped_groups += 1;
        }

        self.resolve(config, &infos, contexts, group, compiled, report);
        Ok(())
    }

    fn plan(
        &self,
        config: &BatchCompileConfiguration,
        paths: &[CompilePathMap],
        contexts: &[TestContext],
        group: &[usize],
        report: &mut CompileReport,
    ) -> BTreeMap<PathBuf, SourceCompileInfo> {
        let mut infos = BTreeMap::new();
        for &index in group {
            for file in &contexts[index].referenced_files {
                if file.is_built_in_dependency || infos.contains_key(&file.path) {
                    continue;
                }
                let no_output = has_extension(&file.path, &config.extensions_with_no_output);
                if !no_output && !has_extension(&file.path, &config.extensions) {
                    continue;
                }

                let output = if no_output {
                    None
                } else {
                    let output = resolve_output_path(&file.path, paths, self.probe.as_ref());
                    if output.is_none() {
                        let message =
                            format!("No compile path mapping matches {}", file.path.display());
                        debug!("{}", message);
                        report.diagnostics.push(message);
                    }
                    output
                };

                let info = SourceCompileInfo {
                    source: self.properties(&file.path),
                    output: output.map(|path| self.properties(&path)),
                    source_has_output: !no_output,
                };
                infos.insert(file.path.clone(), info);
            }
        }
        infos
    }

    fn resolve(
        &self,
        config: &BatchCompileConfiguration,
        infos: &BTreeMap<PathBuf, SourceCompileInfo>,
        contexts: &mut [TestContext],
        group: &[usize],
        compiled: bool,
        report: &mut CompileReport,
    ) {
        let mut output_users: HashMap<&Path, usize> = HashMap::new();
        for info in infos.values() {
            if let Some(output) = &info.output {
                *output_users.entry(output.path.as_path()).or_default() += 1;
            }
        }

        for &index in group {
            let context = &mut contexts[index];
            let mut missing = Vec::new();

            for file in context.referenced_files.iter_mut() {
                let Some(info) = infos.get(&file.path) else {
                    continue;
                };
                let Some(output) = info.output.as_ref().filter(|_| info.source_has_output) else {
                    continue;
                };

                let generated = if self.probe.file_properties(&output.path).exists {
                    Some(output.path.clone())
                } else {
                    self.colocated_fallback(&file.path)
                };
                let Some(generated) = generated else {
                    let e = CompileError::MissingGeneratedFile {
                        path: file.path.clone(),
                    };
                    warn!("{}", e);
                    report.diagnostics.push(e.to_string());
                    missing.push(e);
                    continue;
                };

                if compiled && output_users.get(output.path.as_path()) == Some(&1) {
                    self.record(&file.path, &generated);
                }
                let source_map = if config.use_source_maps {
                    self.source_map(&generated)
                } else {
                    None
                };
                file.set_generated(generated, source_map);
            }

            if let Some(first) = missing.first().filter(|_| !config.ignore_missing_files) {
                let error = TestError::new(context.first_input_file(), first.to_string());
                report.blocked.insert(index, error);
            }
        }
    }

    fn properties(&self, path: &Path) -> PathProperties {
        PathProperties {
            path: path.to_path_buf(),
            properties: self.probe.file_properties(path),
        }
    }

    /// `<source>.js`, accepted only when it is not older than the source.
    fn colocated_fallback(&self, source: &Path) -> Option<PathBuf> {
        let candidate = colocated_output_path(source);
        if candidate == source {
            return None;
        }
        let found = self.probe.file_properties(&candidate);
        if !found.exists {
            return None;
        }
        let source_time = self.probe.file_properties(source).last_modified;
        match (source_time, found.last_modified) {
            (Some(source_time), Some(output_time)) if output_time < source_time => {
                debug!(
                    "Ignoring {}: older than {}",
                    candidate.display(),
                    source.display()
                );
                None
            }
            _ => {
                warn!(
                    "Using co-located {} as the output of {}; no mapped output exists",
                    candidate.display(),
                    source.display()
                );
                Some(candidate)
            }
        }
    }

    fn source_map(&self, generated: &Path) -> Option<PathBuf> {
        let mut map = generated.as_os_str().to_owned();
        map.push(".map");
        let map = PathBuf::from(map);
        self.probe.file_properties(&map).exists.then_some(map)
    }

    fn record(&self, source: &Path, generated: &Path) {
        let Some(cache) = &self.cache else {
            return;
        };
        match (
            self.probe.read_to_string(source),
            self.probe.read_to_string(generated),
        ) {
            (Ok(source_text), Ok(generated_text)) => cache.set(&source_text, &generated_text),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Not caching {}: {}", source.display(), e);
            }
        }
    }
}

/// Absolute directory of the settings file, used to anchor relative paths.
///
/// A relative or missing settings file resolves against the current
/// directory. `None` only when the current directory is unavailable.
fn base_dir(settings: &TestFileSettings) -> Option<PathBuf> {
    let dir = settings
        .settings_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new(""));
    if dir.is_absolute() {
        return Some(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().ok()?;
    if dir.as_os_str().is_empty() {
        Some(cwd)
    } else {
        Some(cwd.join(dir))
    }
}

/// Mappings with relative paths anchored at the settings file directory.
fn effective_paths(
    config: &BatchCompileConfiguration,
    settings: &TestFileSettings,
) -> Vec<CompilePathMap> {
    let Some(base) = base_dir(settings) else {
        return config.paths.clone();
    };
    config
        .paths
        .iter()
        .map(|map| CompilePathMap {
            source_path: base.join(&map.source_path),
            output_path: base.join(&map.output_path),
            output_path_type: map.output_path_type,
        })
        .collect()
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let path = path.to_string_lossy().to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| path.ends_with(&ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::probe::memory::MemoryProbe;
    use super::*;
    use crate::config::OutputPathType;
    use crate::context::ReferencedFile;

    struct FakeRunner {
        probe: Arc<MemoryProbe>,
        exit_code: Option<i32>,
        writes: Vec<(&'static str, u64, &'static str)>,
        calls: AtomicUsize,
    }

    impl FakeRunner {
        fn new(probe: &Arc<MemoryProbe>) -> Self {
            Self {
                probe: Arc::clone(probe),
                exit_code: Some(0),
                writes: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompilerRunner for FakeRunner {
        async fn run(
            &self,
            _config: &BatchCompileConfiguration,
            _settings: &TestFileSettings,
        ) -> CompileResult<CompilerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for (path, mtime, contents) in &self.writes {
                self.probe.add(path, *mtime, contents);
            }
            Ok(CompilerOutput {
                exit_code: self.exit_code,
                output: "src/a.ts(1,5): error TS1005: ';' expected.".to_string(),
            })
        }
    }

    fn compile_config() -> BatchCompileConfiguration {
        BatchCompileConfiguration {
            extensions: vec![".ts".to_string()],
            extensions_with_no_output: vec![".d.ts".to_string()],
            paths: vec![CompilePathMap {
                source_path: PathBuf::from("src"),
                output_path: PathBuf::from("out"),
                output_path_type: OutputPathType::Folder,
            }],
            executable: Some("tsc".to_string()),
            ..Default::default()
        }
    }

    fn settings(config: BatchCompileConfiguration) -> Arc<TestFileSettings> {
        Arc::new(TestFileSettings {
            settings_file: Some(PathBuf::from("/proj/chutzpah.toml")),
            compile: Some(config),
            ..Default::default()
        })
    }

    fn context(test: &str, references: &[&str], settings: &Arc<TestFileSettings>) -> TestContext {
        let mut context = TestContext::new(test, "/proj/h.html", Arc::clone(settings));
        for reference in references {
            context = context.with_reference(ReferencedFile::new(*reference));
        }
        context
    }

    fn engine(runner: &Arc<FakeRunner>, probe: &Arc<MemoryProbe>) -> BatchCompileEngine {
        BatchCompileEngine::new(Arc::clone(runner) as Arc<dyn CompilerRunner>)
            .with_probe(Arc::clone(probe) as Arc<dyn FileProbe>)
    }

    fn generated(context: &TestContext, index: usize) -> Option<&Path> {
        context.referenced_files[index].generated_file_path()
    }

    #[tokio::test]
    async fn test_stale_source_is_compiled_and_resolved() {
        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/proj/src/a.ts", 20)
                .with_file("/proj/out/a.js", 10),
        );
        let mut runner = FakeRunner::new(&probe);
        runner.writes = vec![("/proj/out/a.js", 30, "var a;")];
        let runner = Arc::new(runner);
        let settings = settings(compile_config());
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(runner.calls(), 1);
        assert_eq!(report.compiled_groups, 1);
        assert!(report.blocked.is_empty());
        assert_eq!(generated(&contexts[0], 0), Some(Path::new("/proj/out/a.js")));
    }

    #[tokio::test]
    async fn test_up_to_date_outputs_skip_the_compiler() {
        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/proj/src/a.ts", 10)
                .with_file("/proj/out/a.js", 20),
        );
        let runner = Arc::new(FakeRunner::new(&probe));
        let settings = settings(compile_config());
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(runner.calls(), 0);
        assert_eq!(report.skipped_groups, 1);
        assert_eq!(generated(&contexts[0], 0), Some(Path::new("/proj/out/a.js")));
    }

    #[tokio::test]
    async fn test_compiler_failure_blocks_whole_group() {
        let probe = Arc::new(MemoryProbe::new().with_file("/proj/src/a.ts", 10));
        let mut runner = FakeRunner::new(&probe);
        runner.exit_code = Some(2);
        let runner = Arc::new(runner);
        let settings = settings(compile_config());
        let mut contexts = vec![
            context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings),
            context("/proj/src/b.js", &["/proj/src/b.js"], &settings),
        ];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert!(report.is_blocked(0));
        assert!(report.is_blocked(1));
        let message = &report.blocked[&0].message;
        assert!(message.contains("/proj/chutzpah.toml"));
        assert!(message.contains("TS1005"));
        assert_eq!(generated(&contexts[0], 0), None);
    }

    #[tokio::test]
    async fn test_external_mode_never_invokes_compiler() {
        let probe = Arc::new(MemoryProbe::new().with_file("/proj/src/a.ts", 10));
        let runner = Arc::new(FakeRunner::new(&probe));
        let config = BatchCompileConfiguration {
            mode: CompileMode::External,
            ..compile_config()
        };
        let settings = settings(config);
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(runner.calls(), 0);
        assert!(report.is_blocked(0));
        assert!(report.blocked[&0].message.contains("Couldn't find generated file"));
    }

    #[tokio::test]
    async fn test_missing_output_ignored_when_configured() {
        let probe = Arc::new(MemoryProbe::new().with_file("/proj/src/a.ts", 10));
        let runner = Arc::new(FakeRunner::new(&probe));
        let config = BatchCompileConfiguration {
            ignore_missing_files: true,
            ..compile_config()
        };
        let settings = settings(config);
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(runner.calls(), 1);
        assert!(report.blocked.is_empty());
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(generated(&contexts[0], 0), None);
    }

    #[tokio::test]
    async fn test_colocated_fallback_only_when_not_older() {
        let settings = settings(compile_config());

        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/proj/src/a.ts", 20)
                .with_file("/proj/src/a.js", 25),
        );
        let runner = Arc::new(FakeRunner::new(&probe));
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];
        let report = engine(&runner, &probe).compile(&mut contexts).await;
        assert!(report.blocked.is_empty());
        assert_eq!(generated(&contexts[0], 0), Some(Path::new("/proj/src/a.js")));

        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/proj/src/a.ts", 20)
                .with_file("/proj/src/a.js", 5),
        );
        let runner = Arc::new(FakeRunner::new(&probe));
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];
        let report = engine(&runner, &probe).compile(&mut contexts).await;
        assert!(report.is_blocked(0));
    }

    #[tokio::test]
    async fn test_source_maps_attached_when_enabled() {
        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/proj/src/a.ts", 10)
                .with_file("/proj/out/a.js", 20)
                .with_file("/proj/out/a.js.map", 20),
        );
        let runner = Arc::new(FakeRunner::new(&probe));
        let config = BatchCompileConfiguration {
            use_source_maps: true,
            ..compile_config()
        };
        let settings = settings(config);
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(
            contexts[0].referenced_files[0].source_map_file_path(),
            Some(Path::new("/proj/out/a.js.map"))
        );
    }

    #[tokio::test]
    async fn test_declarations_and_built_ins_are_not_resolved() {
        let probe = Arc::new(
            MemoryProbe::new()
                .with_file("/proj/src/a.ts", 10)
                .with_file("/proj/out/a.js", 20)
                .with_file("/proj/src/types.d.ts", 5),
        );
        let runner = Arc::new(FakeRunner::new(&probe));
        let settings = settings(compile_config());
        let mut context = context(
            "/proj/src/a.ts",
            &["/proj/src/a.ts", "/proj/src/types.d.ts"],
            &settings,
        );
        context = context.with_reference(ReferencedFile::built_in("/proj/src/framework.ts"));
        let mut contexts = vec![context];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(runner.calls(), 0);
        assert!(report.blocked.is_empty());
        assert_eq!(generated(&contexts[0], 1), None);
        assert_eq!(generated(&contexts[0], 2), None);
    }

    #[tokio::test]
    async fn test_groups_by_settings_identity() {
        let probe = Arc::new(MemoryProbe::new().with_file("/proj/src/a.ts", 10));
        let mut runner = FakeRunner::new(&probe);
        runner.writes = vec![("/proj/out/a.js", 30, "")];
        let runner = Arc::new(runner);

        let first = settings(compile_config());
        let second = settings(compile_config());
        let mut contexts = vec![
            context("/proj/src/a.ts", &["/proj/src/a.ts"], &first),
            context("/proj/src/a.ts", &["/proj/src/a.ts"], &first),
            context("/proj/src/a.ts", &["/proj/src/a.ts"], &second),
        ];
        assert_eq!(group_by_settings(&contexts), vec![vec![0, 1], vec![2]]);

        engine(&runner, &probe).compile(&mut contexts).await;
        // The second group sees the output the first one produced.
        assert_eq!(runner.calls(), 1);

        let probe = Arc::new(MemoryProbe::new().with_file("/proj/src/a.ts", 10));
        let runner = Arc::new(FakeRunner::new(&probe));
        engine(&runner, &probe).compile(&mut contexts).await;
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_compile_records_outputs_in_cache() {
        let probe = Arc::new(MemoryProbe::new());
        probe.add("/proj/src/a.ts", 10, "let a: number = 1;");
        let mut runner = FakeRunner::new(&probe);
        runner.writes = vec![("/proj/out/a.js", 30, "var a = 1;")];
        let runner = Arc::new(runner);
        let cache = Arc::new(CompilerCache::new());
        let settings = settings(compile_config());
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        engine(&runner, &probe)
            .with_cache(Arc::clone(&cache))
            .compile(&mut contexts)
            .await;

        assert_eq!(cache.get("let a: number = 1;").as_deref(), Some("var a = 1;"));
    }

    #[tokio::test]
    async fn test_settings_without_compile_are_ignored() {
        let probe = Arc::new(MemoryProbe::new());
        let runner = Arc::new(FakeRunner::new(&probe));
        let settings = Arc::new(TestFileSettings::default());
        let mut contexts = vec![context("/proj/src/a.ts", &["/proj/src/a.ts"], &settings)];

        let report = engine(&runner, &probe).compile(&mut contexts).await;

        assert_eq!(runner.calls(), 0);
        assert_eq!(report.compiled_groups + report.skipped_groups, 0);
    }

    #[test]
    fn test_relative_settings_file_anchors_at_current_dir() {
        let cwd = std::env::current_dir().unwrap();
        let settings = TestFileSettings {
            settings_file: Some(PathBuf::from("chutzpah.toml")),
            ..Default::default()
        };

        let paths = effective_paths(&compile_config(), &settings);
        assert_eq!(paths[0].source_path, cwd.join("src"));
        assert_eq!(paths[0].output_path, cwd.join("out"));

        // An ancestor directory named like the mapping must not match first.
        let probe = MemoryProbe::new();
        let file = cwd.join("src").join("nested").join("a.ts");
        assert_eq!(
            resolve_output_path(&file, &paths, &probe),
            Some(cwd.join("out").join("nested").join("a.js"))
        );
    }

    #[test]
    fn test_nested_relative_settings_file() {
        let cwd = std::env::current_dir().unwrap();
        let settings = TestFileSettings {
            settings_file: Some(PathBuf::from("web/chutzpah.toml")),
            ..Default::default()
        };

        let paths = effective_paths(&compile_config(), &settings);
        assert_eq!(paths[0].source_path, cwd.join("web").join("src"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_failure_output() {
        let config = BatchCompileConfiguration {
            executable: Some("sh".to_string()),
            arguments: Some("-c 'echo out; echo bad >&2; exit 3'".to_string()),
            ..Default::default()
        };
        let output = ProcessCompilerRunner
            .run(&config, &TestFileSettings::default())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.output, "out\nbad\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout() {
        let config = BatchCompileConfiguration {
            executable: Some("sh".to_string()),
            arguments: Some("-c 'sleep 5'".to_string()),
            timeout_ms: Some(100),
            ..Default::default()
        };
        let result = ProcessCompilerRunner
            .run(&config, &TestFileSettings::default())
            .await;
        assert!(matches!(result, Err(CompileError::Timeout { timeout_ms: 100, .. })));
    }

    #[tokio::test]
    async fn test_process_runner_requires_executable() {
        let result = ProcessCompilerRunner
            .run(&BatchCompileConfiguration::default(), &TestFileSettings::default())
            .await;
        assert!(matches!(result, Err(CompileError::MissingExecutable { .. })));
    }
}
