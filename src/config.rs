//! Configuration management for testrack.
//!
//! This module defines the structure of the optional `testrack.toml` file and
//! provides functionality to load and parse it. Every field is optional;
//! command-line flags take precedence over file values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `testrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Test command, as a shell-style command line.
    pub runner: Option<String>,
    /// Extra environment variables for the test command.
    pub runner_env: Option<HashMap<String, String>>,
    /// Location of the project store file.
    pub store: Option<PathBuf>,
    /// Project directories to watch as soon as testrack starts.
    pub watch: Option<Vec<PathBuf>>,
    /// Glob patterns to ignore when watching.
    pub watch_ignore: Option<Vec<String>>,
    /// Whether to skip `.gitignore` rules when watching (default: false).
    pub watch_ignore_gitignore: Option<bool>,
    /// Debounce interval in milliseconds for watch events.
    pub watch_debounce_ms: Option<u64>,
    /// Whether to exit when the UI disconnects (default: true).
    pub quit_on_all_windows_closed: Option<bool>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// `testrack.toml` in the current directory, if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("testrack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}
