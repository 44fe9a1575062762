//! Configuration loading and root folder resolution

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::{Error, Result};

/// Per-pipeline settings consumed by the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Minimum file age in seconds before a file is eligible for
    /// processing; 0 disables the check
    #[serde(default)]
    pub quarantine_secs: u64,

    /// Age in seconds after which unclaimed input files are swept
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Discover and match only; never move files or run builders
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            quarantine_secs: 0,
            grace_period_secs: default_grace_period(),
            dry_run: false,
        }
    }
}

fn default_grace_period() -> u64 {
    60 * 60 * 24
}

/// Top-level TOML configuration (`hopper.toml`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding one directory subtree per pipeline
    pub root_folder: Option<String>,

    /// Per-pipeline overrides keyed by pipeline name
    #[serde(default)]
    pub pipelines: HashMap<String, PipelineSettings>,
}

impl TomlConfig {
    /// Parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load from the default location, falling back to built-in
    /// defaults when no file exists.
    pub fn load_default() -> Result<Self> {
        match find_config_file() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Settings for one pipeline, defaulted when not configured.
    pub fn settings_for(&self, name: &str) -> PipelineSettings {
        self.pipelines.get(name).cloned().unwrap_or_default()
    }
}

/// Root folder resolution priority order:
/// 1. Explicit argument (highest priority)
/// 2. `HOPPER_DIRECTORY` environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(explicit: Option<&str>, config: &TomlConfig) -> PathBuf {
    // Priority 1: explicit argument
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var("HOPPER_DIRECTORY") {
        return PathBuf::from(path);
    }

    // Priority 3: TOML config file
    if let Some(root_folder) = &config.root_folder {
        return PathBuf::from(root_folder);
    }

    // Priority 4: OS-dependent compiled default
    get_default_root_folder()
}

/// Default configuration file path for the platform, if one exists.
fn find_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("hopper").join("hopper.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/hopper/hopper.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("hopper"))
        .unwrap_or_else(|| PathBuf::from("./hopper_data"))
}
