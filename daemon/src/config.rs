//! Daemon configuration file.

use std::path::Path;

use log::{debug, warn};
use serde::Deserialize;

pub const CONFIG_PATH: &str = "/etc/xfprintd.conf";

/// Contents of `/etc/xfprintd.conf`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> StorageConfig {
        StorageConfig {
            backend: "file".to_string(),
        }
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it is missing
    /// or unparsable. A broken config must never keep the daemon down.
    pub fn load(path: &Path) -> Config {
        debug!("About to load configuration file '{}'", path.display());

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) => {
                warn!("Could not open \"{}\": {}", path.display(), err);
                return Config::default();
            }
        };

        match toml::from_str::<Config>(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!("Could not parse \"{}\": {}", path.display(), err);
                Config::default()
            }
        }
    }
}
