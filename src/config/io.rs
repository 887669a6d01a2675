use std::path::PathBuf;
use directories_next::ProjectDirs;
use log::info;
use tokio::fs;
use serde_json;
use std::str;

use crate::config::types::LinkConfig;
use crate::error::ConfigError;

// creates a path to ble-link.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "ble-link", "ble-link").map(|dirs| {
        dirs.config_dir().join("ble-link.json")
    })
}

#[derive(Debug, Clone)]
pub struct ConfigIO {
    path: PathBuf,
}

impl ConfigIO {
    pub fn new(path: PathBuf) -> Self {
        ConfigIO { path }
    }

    pub fn from_default_location() -> Result<Self, ConfigError> {
        match get_local_config_path() {
            None => Err(ConfigError::NoConfigPath),
            Some(path) => Ok(ConfigIO::new(path)),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn read(&self) -> Result<LinkConfig, ConfigError> {
        info!("Reading config file {}", self.path.to_string_lossy());
        let content = fs::read(&self.path).await?;

        if content.is_empty() {
            return Ok(LinkConfig::default());
        }

        let content = str::from_utf8(&content)?;
        let config: LinkConfig = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Like `read`, but a config file that does not exist yet yields the defaults.
    pub async fn read_or_default(&self) -> Result<LinkConfig, ConfigError> {
        match self.read().await {
            Ok(config) => Ok(config),
            Err(err) if err.is_file_not_found_error() => {
                info!("Config file not found, using defaults");
                Ok(LinkConfig::default())
            },
            Err(err) => Err(err),
        }
    }

    pub async fn save(&self, config: &LinkConfig) -> Result<(), ConfigError> {
        info!("Saving config to {}", self.path.to_string_lossy());

        if let Some(directory) = self.path.parent() {
            fs::create_dir_all(directory).await?;
        }

        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content.as_bytes()).await?;
        Ok(())
    }
}
