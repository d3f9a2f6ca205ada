//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Program configuration.
//!

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "ccdhost.toml";
const DEFAULT_SIMULATOR_CAMERAS: usize = 1;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Serialization(toml::ser::Error),
    Parsing(toml::de::Error)
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Serialization(e) => write!(f, "serialization error: {}", e),
            ConfigError::Parsing(e) => write!(f, "parsing error: {}", e)
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> ConfigError { ConfigError::Io(e) }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> ConfigError { ConfigError::Serialization(e) }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> ConfigError { ConfigError::Parsing(e) }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    /// Names of camera SDK drivers not to initialize (e.g., "camera_asi", "simulator").
    pub disabled_drivers: Vec<String>,
    pub simulator_cameras: usize,
    /// Frame rate requested when streaming; 0 means the streamer's default.
    pub stream_target_fps: f64
}

impl Default for MainConfig {
    fn default() -> MainConfig {
        MainConfig{
            disabled_drivers: vec![],
            simulator_cameras: DEFAULT_SIMULATOR_CAMERAS,
            stream_target_fps: crate::streaming::DEFAULT_TARGET_FPS
        }
    }
}

/// Saved settings of a single device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub cooler_on: Option<bool>,
    pub video_format: Option<String>,
    /// Control values by control name.
    pub controls: BTreeMap<String, f64>,
    /// Auto mode switches by switch name.
    pub auto_controls: BTreeMap<String, bool>
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    main: MainConfig,
    /// Key: device name.
    devices: BTreeMap<String, DeviceConfig>,
    #[serde(skip)]
    file_path: Option<PathBuf>
}

impl Configuration {
    /// Loads the configuration from the default location; on failure, logs a warning and returns defaults.
    pub fn new() -> Configuration {
        let file_path = config_file_path();
        let mut config = match Configuration::load_from(&file_path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("failed to load configuration from {}: {}", file_path.to_string_lossy(), e);
                Configuration::default()
            }
        };
        config.file_path = Some(file_path);

        config
    }

    pub fn load_from(path: &Path) -> Result<Configuration, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Configuration = toml::from_str(&contents)?;
        config.file_path = Some(path.to_path_buf());

        Ok(config)
    }

    /// Writes the configuration to the file it was loaded from (or to the default location).
    pub fn store(&self) -> Result<(), ConfigError> {
        let file_path = self.file_path.clone().unwrap_or_else(config_file_path);
        self.store_to(&file_path)
    }

    pub fn store_to(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, toml::to_string(self)?)?;
        Ok(())
    }

    pub fn disabled_drivers(&self) -> &[String] { &self.main.disabled_drivers }

    pub fn simulator_cameras(&self) -> usize { self.main.simulator_cameras }

    pub fn stream_target_fps(&self) -> f64 {
        if self.main.stream_target_fps > 0.0 {
            self.main.stream_target_fps
        } else {
            log::warn!("invalid configuration value for main/stream_target_fps: {}", self.main.stream_target_fps);
            crate::streaming::DEFAULT_TARGET_FPS
        }
    }

    pub fn device(&self, name: &str) -> Option<DeviceConfig> {
        self.devices.get(name).cloned()
    }

    pub fn set_device(&mut self, name: &str, device_config: DeviceConfig) {
        self.devices.insert(name.to_string(), device_config);
    }
}

fn config_file_path() -> PathBuf {
    dirs::config_dir().unwrap_or_default().join(CONFIG_FILE_NAME)
}
