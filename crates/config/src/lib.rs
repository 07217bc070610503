pub mod loader;
pub mod schema;

pub use {
    loader::{
        CONFIG_FILE, apply_env_overrides, default_config_path, default_storage_path, load_config,
        load_config_from,
    },
    schema::{AppConfig, DeeptrackConfig, RedirectEntry, SpotifyConfig, StorageConfig},
};
