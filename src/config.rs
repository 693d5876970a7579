//! Configuration loading and schema definitions for chutzpah.
//!
//! This module provides types and functions for loading chutzpah configuration
//! from TOML files or strings. The configuration schema defines the runner,
//! the engines it can launch, the settings shared by test files, and
//! reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads chutzpah configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use chutzpah::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("chutzpah.toml"))?;
/// println!("Max parallel: {}", config.runner.max_parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if config.settings.settings_file.is_none() {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        config.settings.settings_file = Some(absolute);
    }

    Ok(config)
}

/// Loads chutzpah configuration from a TOML string.
///
/// # Example
///
/// ```
/// use chutzpah::config::{load_config_str, EngineKind};
///
/// let config = load_config_str(r#"
///     [runner]
///     max_parallel = 4
///     engine = "chrome"
/// "#)?;
///
/// assert_eq!(config.runner.max_parallel, 4);
/// assert_eq!(config.runner.engine, EngineKind::Chrome);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
