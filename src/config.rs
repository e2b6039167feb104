//! `keel.toml` loading
//!
//! ```toml
//! adapters_dir = "adapters"
//! output_dir = "out"
//!
//! [platform]
//! endpoint = "https://10.0.0.1:6443"
//!
//! [overrides]
//! cluster_name = "lab"
//!
//! [overrides.adapters.cilium]
//! ipam_mode = "cluster-pool"
//!
//! [engine]
//! max_parallelism = 4
//! fail_fast = false
//! ```
//!
//! Relative directories resolve against the directory holding the file.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use workflow::{EngineSettings, Overrides};

use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeelConfig {
    /// Directory of `<id>/adapter.toml` descriptors
    pub adapters_dir: String,
    /// Root of the rendered file layout
    pub output_dir: String,
    /// Artifact store location; defaults to the user cache dir
    pub cache_dir: Option<String>,
    /// Base context layer shared by every adapter
    pub platform: IndexMap<String, Value>,
    pub overrides: Overrides,
    pub engine: EngineSettings,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            adapters_dir: "adapters".to_string(),
            output_dir: "out".to_string(),
            cache_dir: None,
            platform: IndexMap::new(),
            overrides: Overrides::default(),
            engine: EngineSettings::default(),
        }
    }
}

/// A parsed config plus the directory its relative paths resolve against
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: KeelConfig,
    pub base_dir: PathBuf,
    /// `None` when no file existed and defaults are in use
    pub source: Option<PathBuf>,
}

impl LoadedConfig {
    /// Load `path`, or the default config file when `None`
    ///
    /// A missing default file yields defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => {
                let path = paths::config_file()?;
                if path.exists() {
                    Self::load_file(&path)
                } else {
                    log::debug!("No config at {}, using defaults", path.display());
                    let base_dir = std::env::current_dir().context("Could not determine current directory")?;
                    Ok(Self {
                        config: KeelConfig::default(),
                        base_dir,
                        source: None,
                    })
                }
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        let config: KeelConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            config,
            base_dir,
            source: Some(path.to_path_buf()),
        })
    }

    pub fn adapters_dir(&self) -> PathBuf {
        paths::resolve(&self.config.adapters_dir, &self.base_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        paths::resolve(&self.config.output_dir, &self.base_dir)
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.config.cache_dir {
            Some(dir) => Ok(paths::resolve(dir, &self.base_dir)),
            None => paths::cache_dir(),
        }
    }
}
