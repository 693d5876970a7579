//! Source to output path mapping.
//!
//! Mappings are scanned in order and the first one whose `source_path`
//! occurs in the file path (ignoring ASCII case and separator style) wins.

use std::path::{Path, PathBuf};

use crate::config::{CompilePathMap, OutputPathType};

use super::probe::FileProbe;

/// Lowercases ASCII and turns `\` into `/`. Byte offsets are preserved.
fn normalize(path: &Path) -> String {
    path.to_string_lossy()
        .to_ascii_lowercase()
        .replace('\\', "/")
}

/// Computes the output path for `file`, or `None` when no mapping matches.
///
/// - A mapping whose source is a single file maps to `output_path` itself
///   (`file` output type) or to `output_path/<stem>.js` (`folder`).
/// - A mapping whose source is a directory maps to
///   `output_path/<path below source>` with a `.js` extension, or to
///   `output_path` itself when the output type is `file`.
pub fn resolve_output_path(
    file: &Path,
    paths: &[CompilePathMap],
    probe: &dyn FileProbe,
) -> Option<PathBuf> {
    let normalized_file = normalize(file);
    let original = file.to_string_lossy();

    for map in paths {
        let needle = normalize(&map.source_path);
        let needle = needle.trim_end_matches('/');
        if needle.is_empty() {
            continue;
        }
        let Some(index) = normalized_file.find(needle) else {
            continue;
        };

        if probe.is_file(&map.source_path) {
            return Some(match map.output_path_type {
                OutputPathType::File => map.output_path.clone(),
                OutputPathType::Folder => {
                    let stem = file.file_stem().unwrap_or_default();
                    map.output_path.join(stem).with_extension("js")
                }
            });
        }

        if map.output_path_type == OutputPathType::File {
            return Some(map.output_path.clone());
        }

        let remainder = original
            .get(index + needle.len()..)
            .unwrap_or_default()
            .trim_start_matches(['/', '\\']);
        return Some(map.output_path.join(remainder).with_extension("js"));
    }
    None
}

/// Co-located fallback output: the source path with a `.js` extension.
pub fn colocated_output_path(file: &Path) -> PathBuf {
    file.with_extension("js")
}
