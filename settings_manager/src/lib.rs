//! Configuration management for soundstage.
//!
//! This crate handles loading, saving and accessing the mixer's
//! configuration.

use log::debug;
use mixer_core::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Mixer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Socket address the mixer binds for client datagrams.
    pub bind_addr: String,

    /// Hold back the first frame of a new stream one extra tick; the
    /// jitter-buffered decode path reads this flag.
    pub dynamic_jitter_buffers: bool,

    /// Accept datagrams from unregistered addresses by assigning them a
    /// fresh peer id.
    pub accept_unregistered: bool,

    /// Optional unattenuated zone pair as twelve floats: source corner,
    /// source dimensions, listener corner, listener dimensions.
    pub unattenuated_zone: Option<Vec<f32>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:24480".to_string(),
            dynamic_jitter_buffers: false,
            accept_unregistered: true,
            unattenuated_zone: None,
        }
    }
}

impl Settings {
    /// Validate and return the zone tuple, if configured.
    pub fn unattenuated_zone_floats(&self) -> Result<Option<[f32; 12]>, Error> {
        match &self.unattenuated_zone {
            None => Ok(None),
            Some(values) => {
                let floats: [f32; 12] = values.as_slice().try_into().map_err(|_| {
                    Error::Config(format!(
                        "unattenuated zone needs 12 floats, got {}",
                        values.len()
                    ))
                })?;
                Ok(Some(floats))
            }
        }
    }
}

/// Parse the comma-separated zone tuple accepted on the command line.
pub fn parse_zone_tuple(input: &str) -> Result<[f32; 12], Error> {
    let values: Result<Vec<f32>, _> = input.split(',').map(|v| v.trim().parse::<f32>()).collect();
    let values =
        values.map_err(|e| Error::Config(format!("invalid unattenuated zone value: {}", e)))?;
    values.as_slice().try_into().map_err(|_| {
        Error::Config(format!(
            "unattenuated zone needs 12 floats, got {}",
            values.len()
        ))
    })
}

/// Configuration manager.
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager, loading from the user's config
    /// directory or falling back to defaults.
    pub fn new() -> Result<Self, Error> {
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("failed to determine config directory".to_string()))?;
        config_dir.push("soundstage");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| Error::Config(format!("failed to create config directory: {}", e)))?;
        }

        let config_file = config_dir.join("config.toml");

        let settings = if config_file.exists() {
            Self::load_from_file(&config_file)?
        } else {
            debug!("config file not found, using defaults");
            Settings::default()
        };

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Create a new ConfigManager with a custom file path (mainly for
    /// testing).
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        let settings = if config_file.exists() {
            Self::load_from_file(&config_file)?
        } else {
            Settings::default()
        };

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Load settings from a TOML file.
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Settings, Error> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), Error> {
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("failed to write config file: {}", e)))?;

        debug!("saved config to {:?}", self.config_file);
        Ok(())
    }

    /// Get the current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get a mutable reference to settings.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
