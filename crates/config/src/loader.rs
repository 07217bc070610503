use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    tracing::{debug, info},
};

use crate::schema::DeeptrackConfig;

pub const CONFIG_FILE: &str = "deeptrack.toml";

/// `<config_dir>/deeptrack/deeptrack.toml`, if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("deeptrack").join(CONFIG_FILE))
}

/// `<data_dir>/deeptrack/storage.json`.
pub fn default_storage_path() -> Result<PathBuf> {
    let dirs = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("could not determine data directory"))?;
    Ok(dirs.data_dir().join("deeptrack").join("storage.json"))
}

/// Load configuration from `explicit`, else `./deeptrack.toml`, else the user
/// config dir, else defaults. Environment overrides are applied last.
pub fn load_config(explicit: Option<&Path>) -> Result<DeeptrackConfig> {
    let mut config = match explicit {
        Some(path) => load_config_from(path)?,
        None => {
            let mut candidates =
                std::iter::once(PathBuf::from(CONFIG_FILE)).chain(default_config_path());
            match candidates.find(|p| p.is_file()) {
                Some(path) => load_config_from(&path)?,
                None => {
                    debug!("no config file found, using defaults");
                    DeeptrackConfig::default()
                },
            }
        },
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

pub fn load_config_from(path: &Path) -> Result<DeeptrackConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: DeeptrackConfig =
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// `DEEPTRACK_CLIENT_ID` and `DEEPTRACK_LOCATION` win over the file.
pub fn apply_env_overrides(config: &mut DeeptrackConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(client_id) = lookup("DEEPTRACK_CLIENT_ID").filter(|v| !v.is_empty()) {
        config.spotify.client_id = client_id;
    }
    if let Some(location) = lookup("DEEPTRACK_LOCATION").filter(|v| !v.is_empty()) {
        config.app.location = location;
    }
}
