//! JSON configuration loading.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{ChatKitError, Result};

/// Environment variable consulted when no explicit path is given.
pub const CONFIG_ENV_VAR: &str = "CHATKIT_CONFIG";

/// Load a config of type `T` from JSON.
///
/// Resolution order: `path`, then `$CHATKIT_CONFIG`. When neither names an existing file,
/// `T::default()` is returned. Fields missing from the file fall back to their defaults
/// when `T` is annotated with `#[serde(default)]`.
pub fn load_json_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let resolved: Option<PathBuf> = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

    let Some(path) = resolved else {
        debug!("No config path given, using defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(T::default());
    }

    let data = std::fs::read(&path)?;
    let config = serde_json::from_slice(&data).map_err(|e| ChatKitError::Config {
        message: format!("invalid config file {}", path.display()),
        source: Some(Box::new(e)),
    })?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}
