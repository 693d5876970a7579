//! File system probes used by compile planning.

use std::path::Path;
use std::time::SystemTime;

/// Existence and modification time of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileProperties {
    pub exists: bool,
    pub last_modified: Option<SystemTime>,
}

impl FileProperties {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Read-only view of the file system.
pub trait FileProbe: Send + Sync {
    fn file_properties(&self, path: &Path) -> FileProperties;

    /// `true` for regular files, `false` for directories and missing paths.
    fn is_file(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;
}

/// [`FileProbe`] backed by the real file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileProbe;

impl FileProbe for RealFileProbe {
    fn file_properties(&self, path: &Path) -> FileProperties {
        match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => FileProperties {
                exists: true,
                last_modified: metadata.modified().ok(),
            },
            _ => FileProperties::missing(),
        }
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}
