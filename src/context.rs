//! Test contexts and the files they reference.
//!
//! A [`TestContext`] describes one logical test run: the input test file(s),
//! every file the harness pulls in, the settings in effect and the harness
//! to load. Contexts are produced by a [`ContextBuilder`], mutated once by
//! the batch compile step (which fills in generated paths) and then only read
//! by execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::config::TestFileSettings;

/// A source file referenced by a test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedFile {
    /// Original path of the file.
    pub path: PathBuf,

    /// Shipped with the runner itself (test framework, runner glue).
    ///
    /// Built-in dependencies never take part in batch compilation.
    pub is_built_in_dependency: bool,

    generated_file_path: Option<PathBuf>,
    source_map_file_path: Option<PathBuf>,
}

impl ReferencedFile {
    /// Creates a user file reference.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_built_in_dependency: false,
            generated_file_path: None,
            source_map_file_path: None,
        }
    }

    /// Creates a reference to a built-in dependency.
    pub fn built_in(path: impl Into<PathBuf>) -> Self {
        Self {
            is_built_in_dependency: true,
            ..Self::new(path)
        }
    }

    /// The compiled output for this file, once compilation located it.
    pub fn generated_file_path(&self) -> Option<&Path> {
        self.generated_file_path.as_deref()
    }

    /// The source map belonging to the generated output, if any.
    pub fn source_map_file_path(&self) -> Option<&Path> {
        self.source_map_file_path.as_deref()
    }

    /// Path the harness should load: the generated output when there is one.
    pub fn effective_path(&self) -> &Path {
        self.generated_file_path().unwrap_or(&self.path)
    }

    /// Records the generated output and its optional source map.
    ///
    /// The generated path can be set once per run. Returns `false` and leaves
    /// the file untouched when it was already set.
    pub fn set_generated(&mut self, generated: PathBuf, source_map: Option<PathBuf>) -> bool {
        if self.generated_file_path.is_some() {
            return false;
        }
        self.generated_file_path = Some(generated);
        self.source_map_file_path = source_map;
        true
    }
}

/// Whether the engine should run tests or only enumerate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    /// Enumerate tests without running them.
    Discovery,
    /// Run tests.
    #[default]
    Execution,
}

impl TestMode {
    /// The value handed to runner scripts.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Discovery => "discovery",
            TestMode::Execution => "execution",
        }
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical test run.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Test files driven by this context. Never empty.
    pub input_test_files: Vec<PathBuf>,

    /// Harness page to load: a local path or an `http(s)://` URL.
    pub harness_path: String,

    /// Every file the harness loads, in load order.
    pub referenced_files: Vec<ReferencedFile>,

    /// Settings in effect. Shared with every context from the same settings file.
    pub settings: Arc<TestFileSettings>,
}

impl TestContext {
    /// Creates a context for a single test file.
    pub fn new(
        test_file: impl Into<PathBuf>,
        harness_path: impl Into<String>,
        settings: Arc<TestFileSettings>,
    ) -> Self {
        Self {
            input_test_files: vec![test_file.into()],
            harness_path: harness_path.into(),
            referenced_files: Vec::new(),
            settings,
        }
    }

    /// Adds a referenced file.
    pub fn with_reference(mut self, file: ReferencedFile) -> Self {
        self.referenced_files.push(file);
        self
    }

    /// Points a harness that is itself a referenced file at that file's
    /// generated output. Returns whether the harness changed.
    ///
    /// Runs after batch compilation, so a compiled test file is loaded as
    /// the JavaScript it compiled to.
    pub fn use_generated_harness(&mut self) -> bool {
        let harness = Path::new(&self.harness_path);
        let generated = self
            .referenced_files
            .iter()
            .find(|file| file.path == harness)
            .and_then(ReferencedFile::generated_file_path)
            .map(|path| path.to_string_lossy().into_owned());
        match generated {
            Some(generated) => {
                self.harness_path = generated;
                true
            }
            None => false,
        }
    }

    /// The first input file; summaries without a better owner attach here.
    pub fn first_input_file(&self) -> &Path {
        self.input_test_files
            .first()
            .map(PathBuf::as_path)
            .unwrap_or_else(|| Path::new(""))
    }
}

/// Resolves a test file into a [`TestContext`].
///
/// Reference resolution (parsing `/// <reference>` comments, framework
/// detection, harness generation) lives behind this seam.
pub trait ContextBuilder: Send + Sync {
    /// Builds the context for `path` using `settings`.
    fn build_context(&self, path: &Path, settings: &Arc<TestFileSettings>) -> Result<TestContext>;
}

/// Builds contexts that reference only the test file itself.
///
/// The harness is either a fixed page shared by every test file or, when
/// none is configured, the test file itself (for `.html` test pages).
#[derive(Debug, Clone, Default)]
pub struct SingleFileContextBuilder {
    harness: Option<String>,
}

impl SingleFileContextBuilder {
    /// Uses each test file as its own harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `harness` for every test file.
    pub fn with_harness(harness: impl Into<String>) -> Self {
        Self {
            harness: Some(harness.into()),
        }
    }
}

impl ContextBuilder for SingleFileContextBuilder {
    fn build_context(&self, path: &Path, settings: &Arc<TestFileSettings>) -> Result<TestContext> {
        if !path.exists() {
            anyhow::bail!("Test file not found: {}", path.display());
        }
        let harness = self
            .harness
            .clone()
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let context = TestContext::new(path, harness, Arc::clone(settings));
        Ok(context.with_reference(ReferencedFile::new(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_path_is_set_once() {
        let mut file = ReferencedFile::new("src/a.ts");
        assert_eq!(file.effective_path(), Path::new("src/a.ts"));

        assert!(file.set_generated(PathBuf::from("out/a.js"), Some(PathBuf::from("out/a.js.map"))));
        assert!(!file.set_generated(PathBuf::from("other/a.js"), None));

        assert_eq!(file.generated_file_path(), Some(Path::new("out/a.js")));
        assert_eq!(file.source_map_file_path(), Some(Path::new("out/a.js.map")));
        assert_eq!(file.effective_path(), Path::new("out/a.js"));
    }

    #[test]
    fn test_harness_follows_generated_output() {
        let settings = Arc::new(TestFileSettings::default());
        let mut context = TestContext::new("/proj/src/a.ts", "/proj/src/a.ts", settings)
            .with_reference(ReferencedFile::new("/proj/src/a.ts"));
        assert!(!context.use_generated_harness());

        context.referenced_files[0].set_generated(PathBuf::from("/proj/out/a.js"), None);
        assert!(context.use_generated_harness());
        assert_eq!(context.harness_path, "/proj/out/a.js");
    }

    #[test]
    fn test_shared_harness_is_kept() {
        let settings = Arc::new(TestFileSettings::default());
        let mut file = ReferencedFile::new("/proj/src/a.ts");
        file.set_generated(PathBuf::from("/proj/out/a.js"), None);
        let mut context = TestContext::new("/proj/src/a.ts", "http://localhost/h.html", settings)
            .with_reference(file);

        assert!(!context.use_generated_harness());
        assert_eq!(context.harness_path, "http://localhost/h.html");
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(TestMode::Discovery.as_str(), "discovery");
        assert_eq!(TestMode::Execution.to_string(), "execution");
    }

    #[test]
    fn test_single_file_builder() {
        let dir = tempfile::TempDir::new().unwrap();
        let test_file = dir.path().join("tests.html");
        std::fs::write(&test_file, "<html></html>").unwrap();
        let settings = Arc::new(TestFileSettings::default());

        let context = SingleFileContextBuilder::new()
            .build_context(&test_file, &settings)
            .unwrap();

        assert_eq!(context.first_input_file(), test_file.as_path());
        assert_eq!(context.harness_path, test_file.to_string_lossy());
        assert_eq!(context.referenced_files.len(), 1);
        assert!(Arc::ptr_eq(&context.settings, &settings));
    }

    #[test]
    fn test_single_file_builder_missing_file() {
        let settings = Arc::new(TestFileSettings::default());
        let result = SingleFileContextBuilder::with_harness("http://localhost/harness.html")
            .build_context(Path::new("/nonexistent/spec.js"), &settings);
        assert!(result.is_err());
    }
}
