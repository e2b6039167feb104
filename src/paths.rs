//! Where keel keeps its config, run history and artifact cache
//!
//! Each directory can be overridden by an environment variable
//! (`KEEL_CONFIG_DIR`, `KEEL_STATE_DIR`, `KEEL_CACHE_DIR`). Otherwise the
//! matching `XDG_*_HOME` is used, falling back to `~/.config`,
//! `~/.local/state` and `~/.cache`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "KEEL_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "KEEL_STATE_DIR";

/// Environment variable for artifact cache override
pub const ENV_CACHE_DIR: &str = "KEEL_CACHE_DIR";

/// Name of the config file inside the config directory
pub const CONFIG_FILE: &str = "keel.toml";

/// Get the keel config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("keel");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join("keel");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Default location of `keel.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Get the keel state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("keel");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("keel");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Get the default artifact cache directory
pub fn cache_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
        let path = expand(&dir);
        log::debug!("Using cache dir from {}: {}", ENV_CACHE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg_cache).join("keel").join("artifacts"));
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".cache").join("keel").join("artifacts"))
}

/// Expand `~` and environment variables; unknown variables are left as is
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Expand `path`, resolving a relative result against `base`
pub fn resolve(path: &str, base: &Path) -> PathBuf {
    let expanded = expand(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

// ============================================================================
// Tests
// ============================================================================
