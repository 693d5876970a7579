//! Deciding whether a batch compile has to run.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::config::BatchCompileConfiguration;

use super::probe::FileProperties;

/// A path together with what the probe found there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathProperties {
    pub path: PathBuf,
    pub properties: FileProperties,
}

impl PathProperties {
    fn modified(&self) -> Option<SystemTime> {
        self.properties
            .exists
            .then_some(self.properties.last_modified)
            .flatten()
    }
}

/// Compile planning record for one source file. Built fresh for every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCompileInfo {
    pub source: PathProperties,

    /// Expected output. `None` when no mapping matched.
    pub output: Option<PathProperties>,

    /// `false` for sources such as declaration files that produce nothing.
    pub source_has_output: bool,
}

impl SourceCompileInfo {
    fn output_exists(&self) -> bool {
        self.output.as_ref().is_some_and(|o| o.properties.exists)
    }
}

/// Applies the staleness policy to one settings group.
///
/// In order:
/// 1. No source produces output: never compile.
/// 2. `skip_if_unchanged` is off: always compile.
/// 3. Some output-producing source lacks its output (or has no mapping).
/// 4. Some output-producing source is strictly newer than its output.
/// 5. Some no-output source is at least as new as the oldest existing output.
///
/// # Example
///
/// ```
/// use chutzpah::compile::check_if_compile_is_needed;
/// use chutzpah::config::BatchCompileConfiguration;
///
/// assert!(!check_if_compile_is_needed(&BatchCompileConfiguration::default(), &[]));
/// ```
pub fn check_if_compile_is_needed(
    config: &BatchCompileConfiguration,
    files: &[SourceCompileInfo],
) -> bool {
    let producing: Vec<&SourceCompileInfo> =
        files.iter().filter(|f| f.source_has_output).collect();
    if producing.is_empty() {
        return false;
    }
    if !config.skip_if_unchanged {
        return true;
    }

    if producing.iter().any(|f| !f.output_exists()) {
        return true;
    }

    let newer_than_output = producing.iter().any(|f| {
        let output = f.output.as_ref().and_then(PathProperties::modified);
        matches!((f.source.modified(), output), (Some(source), Some(output)) if source > output)
    });
    if newer_than_output {
        return true;
    }

    let oldest_output = files
        .iter()
        .filter_map(|f| f.output.as_ref().and_then(PathProperties::modified))
        .min();
    let Some(oldest_output) = oldest_output else {
        return false;
    };
    files
        .iter()
        .filter(|f| !f.source_has_output)
        .filter_map(|f| f.source.modified())
        .any(|modified| modified >= oldest_output)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn props(path: &str, mtime: Option<u64>) -> PathProperties {
        PathProperties {
            path: PathBuf::from(path),
            properties: match mtime {
                Some(secs) => FileProperties {
                    exists: true,
                    last_modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
                },
                None => FileProperties::missing(),
            },
        }
    }

    fn producing(source: u64, output: Option<u64>) -> SourceCompileInfo {
        SourceCompileInfo {
            source: props("a.ts", Some(source)),
            output: Some(props("a.js", output)),
            source_has_output: true,
        }
    }

    fn declaration(mtime: u64) -> SourceCompileInfo {
        SourceCompileInfo {
            source: props("types.d.ts", Some(mtime)),
            output: None,
            source_has_output: false,
        }
    }

    fn config() -> BatchCompileConfiguration {
        BatchCompileConfiguration::default()
    }

    #[test]
    fn test_source_newer_than_output_compiles() {
        assert!(check_if_compile_is_needed(&config(), &[producing(20, Some(10))]));
    }

    #[test]
    fn test_output_newer_than_source_skips() {
        assert!(!check_if_compile_is_needed(&config(), &[producing(10, Some(20))]));
    }

    #[test]
    fn test_missing_output_compiles() {
        assert!(check_if_compile_is_needed(&config(), &[producing(10, None)]));
    }

    #[test]
    fn test_unmapped_output_compiles() {
        let file = SourceCompileInfo {
            output: None,
            ..producing(10, None)
        };
        assert!(check_if_compile_is_needed(&config(), &[file]));
    }

    #[test]
    fn test_skip_if_unchanged_off_always_compiles() {
        let config = BatchCompileConfiguration {
            skip_if_unchanged: false,
            ..config()
        };
        assert!(check_if_compile_is_needed(&config, &[producing(10, Some(20))]));
    }

    #[test]
    fn test_nothing_produces_output_never_compiles() {
        let config = BatchCompileConfiguration {
            skip_if_unchanged: false,
            ..config()
        };
        assert!(!check_if_compile_is_needed(&config, &[declaration(100)]));
        assert!(!check_if_compile_is_needed(&config, &[]));
    }

    #[test]
    fn test_declaration_against_oldest_output() {
        let outputs = [producing(10, Some(30)), producing(10, Some(50))];

        let older = [outputs.to_vec(), vec![declaration(29)]].concat();
        assert!(!check_if_compile_is_needed(&config(), &older));

        let equal = [outputs.to_vec(), vec![declaration(30)]].concat();
        assert!(check_if_compile_is_needed(&config(), &equal));

        // Newer than the oldest output only.
        let between = [outputs.to_vec(), vec![declaration(40)]].concat();
        assert!(check_if_compile_is_needed(&config(), &between));
    }

    #[test]
    fn test_flipping_any_timestamp_flips_decision() {
        let base = vec![producing(10, Some(20)), producing(15, Some(25)), declaration(5)];
        assert!(!check_if_compile_is_needed(&config(), &base));

        let mut source_touched = base.clone();
        source_touched[1] = producing(26, Some(25));
        assert!(check_if_compile_is_needed(&config(), &source_touched));

        let mut declaration_touched = base.clone();
        declaration_touched[2] = declaration(20);
        assert!(check_if_compile_is_needed(&config(), &declaration_touched));

        let mut output_removed = base;
        output_removed[0] = producing(10, None);
        assert!(check_if_compile_is_needed(&config(), &output_removed));
    }
}
