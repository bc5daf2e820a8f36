//! Configuration loading

use anyhow::{Context, Result};
use std::path::Path;

use crate::Config;

const CONFIG_PATH_ENV: &str = "NODESYNC_CONFIG_PATH";
const CWD_CONFIG: &str = "config.yaml";
const MOUNTED_CONFIG: &str = "/config/config.yaml";

/// Pick the configuration file to load
///
/// Search order:
/// 1. `explicit` (the `--config` flag); it must exist
/// 2. `NODESYNC_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
///
/// `Ok(None)` means environment variables and defaults only.
pub fn resolve_config_path(explicit: Option<&str>) -> Result<Option<String>> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            anyhow::bail!("config file {path} does not exist");
        }
        return Ok(Some(path.to_string()));
    }

    Ok(std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            [CWD_CONFIG, MOUNTED_CONFIG]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        }))
}

/// Load and validate configuration
///
/// Runs before logging is initialised, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config = match resolve_config_path(explicit)? {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path).with_context(|| format!("failed to load {path}"))?
        }
        None => Config::from_env().context("failed to load config from environment")?,
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
