//! Compiled-source memo cache.
//!
//! Maps the SHA-256 of a source text to the JavaScript it compiled to. The
//! cache is an explicit object: create it once, share it behind an `Arc`
//! and hand it to whoever compiles. One mutex guards both reads and
//! writes.
//!
//! The cache can be persisted as JSON. Loading tolerates a missing or
//! corrupt file and starts empty.
//!
//! # Example
//!
//! ```no_run
//! use chutzpah::compile::CompilerCache;
//! use std::path::Path;
//!
//! let cache = CompilerCache::load(Path::new(".chutzpah/compiler-cache.json"));
//!
//! if cache.get("let a: number = 1;").is_none() {
//!     cache.set("let a: number = 1;", "var a = 1;");
//! }
//!
//! cache.save().unwrap();
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CompileResult;

/// One cached compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Compiled JavaScript.
    pub js: String,

    /// RFC 3339 timestamp of when the entry was stored.
    pub created_at: String,
}

/// Thread-safe source hash to compiled output map.
#[derive(Debug, Default)]
pub struct CompilerCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    path: Option<PathBuf>,
}

impl CompilerCache {
    /// An in-memory cache that is never persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the cache stored at `path`; `save` writes back to it.
    pub fn load(path: &Path) -> Self {
        tracing::debug!("Loading compiler cache from: {}", path.display());

        let entries = if !path.exists() {
            tracing::debug!("Compiler cache does not exist, starting empty");
            HashMap::new()
        } else {
            match fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&contents)
                {
                    Ok(entries) => {
                        tracing::debug!("Loaded {} compiler cache entries", entries.len());
                        entries
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse compiler cache, starting empty: {}", e);
                        HashMap::new()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read compiler cache, starting empty: {}", e);
                    HashMap::new()
                }
            }
        };

        Self {
            entries: Mutex::new(entries),
            path: Some(path.to_path_buf()),
        }
    }

    /// Writes the cache to the path it was loaded from. A no-op for
    /// in-memory caches.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        tracing::debug!("Saving compiler cache to: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create compiler cache directory")?;
        }
        let contents = serde_json::to_string_pretty(&*self.lock())
            .context("Failed to serialize compiler cache")?;
        fs::write(path, contents).context("Failed to write compiler cache")?;
        Ok(())
    }

    /// Compiled output for `source`, if cached.
    pub fn get(&self, source: &str) -> Option<String> {
        let key = hash_source(source);
        self.lock().get(&key).map(|entry| entry.js.clone())
    }

    /// Stores the compiled output for `source`.
    pub fn set(&self, source: &str, js: &str) {
        let key = hash_source(source);
        let entry = CacheEntry {
            js: js.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.lock().insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hex SHA-256 of a source text.
pub fn hash_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compiles one source text in-process (e.g. an embedded TypeScript host).
pub trait SourceCompiler: Send + Sync {
    fn compile(&self, source: &str) -> CompileResult<String>;
}

/// A [`SourceCompiler`] that consults a shared [`CompilerCache`] first.
pub struct CachedCompiler<C> {
    inner: C,
    cache: Arc<CompilerCache>,
}

impl<C: SourceCompiler> CachedCompiler<C> {
    pub fn new(inner: C, cache: Arc<CompilerCache>) -> Self {
        Self { inner, cache }
    }
}

impl<C: SourceCompiler> SourceCompiler for CachedCompiler<C> {
    fn compile(&self, source: &str) -> CompileResult<String> {
        if let Some(js) = self.cache.get(source) {
            tracing::trace!("Compiler cache hit");
            return Ok(js);
        }
        let js = self.inner.compile(source)?;
        self.cache.set(source, &js);
        Ok(js)
    }
}
