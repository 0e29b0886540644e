//! TOML configuration loading for `SpineConfig`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use spine_core::SpineConfig;

use crate::error::{Result, StoreError};

/// Environment variable naming a config file when no explicit path is given.
pub const CONFIG_ENV: &str = "SPINE_CONFIG";

/// Read and validate a config file. Missing keys keep their defaults.
pub fn load_config(path: &Path) -> Result<SpineConfig> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    parse_config(path, &text)
}

fn parse_config(path: &Path, text: &str) -> Result<SpineConfig> {
    let config: SpineConfig = toml::from_str(text).map_err(|e| StoreError::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    config.validate().map_err(|reason| StoreError::Config {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(config)
}

/// Explicit path first, then `SPINE_CONFIG`, then built-in defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<SpineConfig> {
    resolve_config_with(explicit, |key| env::var(key).ok())
}

pub fn resolve_config_with<F>(explicit: Option<&Path>, lookup: F) -> Result<SpineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = explicit.map(PathBuf::from).or_else(|| {
        lookup(CONFIG_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    });
    match path {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => Ok(SpineConfig::default()),
    }
}
