use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use log::{info, warn};

use crate::error::ConfigError;

/// Persistent application configuration. CLI flags (see `main.rs`) override
/// these values for a single run; they don't overwrite the saved config
/// unless the user asks for that explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub audio: AudioSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub default_loop_path: Option<String>,
    pub block_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            default_loop_path: None,
            block_size: 1024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config_path: PathBuf::from("loopsync_config.toml"),
            config,
        }
    }

    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;
        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn at_path(config_path: PathBuf) -> Result<Self, ConfigError> {
        let config = Self::load_or_create_config(&config_path)?;
        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: AppConfig) -> Result<(), ConfigError> {
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<(), ConfigError> {
        Self::save_config_to_path(&self.config, &self.config_path)
    }

    fn load_or_create_config(config_path: &PathBuf) -> Result<AppConfig, ConfigError> {
        if config_path.exists() {
            info!("loading configuration from {config_path:?}");
            let config_str = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.display().to_string(),
                source,
            })?;

            match toml::from_str::<AppConfig>(&config_str) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!("failed to parse configuration file: {e}. Using defaults.");
                    let default_config = AppConfig::default();
                    Self::save_config_to_path(&default_config, config_path)?;
                    Ok(default_config)
                }
            }
        } else {
            info!("no configuration file found at {config_path:?}, creating defaults");
            let default_config = AppConfig::default();
            Self::save_config_to_path(&default_config, config_path)?;
            Ok(default_config)
        }
    }

    fn save_config_to_path(config: &AppConfig, path: &PathBuf) -> Result<(), ConfigError> {
        let config_str = toml::to_string_pretty(config)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }

        fs::write(path, config_str).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;

        info!("configuration saved to {path:?}");
        Ok(())
    }

    fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = if let Some(dir) = dirs::config_dir() {
            dir.join("loopsync")
        } else {
            dirs::home_dir()
                .ok_or(ConfigError::NoConfigDir)?
                .join(".loopsync")
        };
        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_block_size() {
        let config = AppConfig::default();
        assert_eq!(config.audio.block_size, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn config_serialization_roundtrips() {
        let config = AppConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(config.audio.block_size, deserialized.audio.block_size);
    }

    #[test]
    fn config_manager_loads_and_creates_at_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(!path.exists());

        let manager = ConfigManager::at_path(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(manager.get_config().audio.block_size, 1024);
    }

    #[test]
    fn config_manager_persists_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut manager = ConfigManager::at_path(path.clone()).unwrap();

        let mut updated = manager.get_config().clone();
        updated.audio.block_size = 512;
        manager.update_config(updated).unwrap();

        let reloaded = ConfigManager::at_path(path).unwrap();
        assert_eq!(reloaded.get_config().audio.block_size, 512);
    }
}
