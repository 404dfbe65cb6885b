//! # Configuration
//!
//! Every tunable of the simulator lives in [`ThermostatConfig`]. Values are
//! resolved in three layers:
//!
//! 1. Built-in defaults (`#[serde(default)]` on every section)
//! 2. A TOML file, either passed explicitly or found in the user config dir
//! 3. `THERMOSTAT_MQTT_*` environment variables for broker address and credentials
//!
//! A missing default file degrades to the built-in defaults. A file that was
//! asked for explicitly must exist.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::mqtt::config::MqttConfig;

const CONFIG_DIR: &str = "thermostat-sim";
const CONFIG_FILE: &str = "config.toml";

pub const ENV_MQTT_HOST: &str = "THERMOSTAT_MQTT_HOST";
pub const ENV_MQTT_PORT: &str = "THERMOSTAT_MQTT_PORT";
pub const ENV_MQTT_USERNAME: &str = "THERMOSTAT_MQTT_USERNAME";
pub const ENV_MQTT_PASSWORD: &str = "THERMOSTAT_MQTT_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value {value:?} in environment variable {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Temperature model constants and the tick cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Lower clamp for every reading in °C
    pub min_temp: f64,
    /// Upper clamp for every reading in °C
    pub max_temp: f64,
    /// Temperature at startup, clamped into `[min_temp, max_temp]`
    pub initial_temp: f64,
    /// Change per tick towards the heater direction
    pub base_drift: f64,
    /// Half-width of the uniform noise added per tick
    pub drift_variance: f64,
    /// Probability that the previous direction carries into the next tick
    pub momentum_chance: f64,
    /// Size of the carried-over change
    pub momentum_step: f64,
    /// Seconds between two readings
    pub interval_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_temp: 18.0,
            max_temp: 25.0,
            initial_temp: 22.0,
            base_drift: 0.3,
            drift_variance: 0.2,
            momentum_chance: 0.25,
            momentum_step: 0.2,
            interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds between two session statistics log lines
    pub stats_interval_secs: u64,
    /// Upper bound for draining the publish path and flushing DISCONNECT
    pub shutdown_timeout_secs: u64,
    /// Maximum log level (`trace`, `debug`, `info`, `warn`, `error`)
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            shutdown_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatConfig {
    pub mqtt: MqttConfig,
    pub simulation: SimulationConfig,
    pub runtime: RuntimeConfig,

    /// File the configuration was read from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl ThermostatConfig {
    /// Resolves the effective configuration and validates it.
    ///
    /// `path` is the file given on the command line. Without it the default
    /// location under the user config dir is tried.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::existing_default_path().await,
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path).await?,
            None => {
                debug!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/thermostat-sim/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut dir| {
            dir.push(CONFIG_DIR);
            dir.push(CONFIG_FILE);
            dir
        })
    }

    async fn existing_default_path() -> Option<PathBuf> {
        let path = Self::default_path()?;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source = Some(path.to_path_buf());
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Copy that is safe to print or log
    pub fn redacted(&self) -> Self {
        Self {
            mqtt: self.mqtt.redacted(),
            ..self.clone()
        }
    }

    /// Overrides broker address and credentials from the environment.
    ///
    /// `lookup` abstracts `std::env::var` so tests never touch the process env.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(ENV_MQTT_PORT) {
            self.mqtt.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_MQTT_PORT,
                value: port,
            })?;
        }
        if let Some(username) = lookup(ENV_MQTT_USERNAME) {
            self.mqtt.username = username;
        }
        if let Some(password) = lookup(ENV_MQTT_PASSWORD) {
            self.mqtt.password = password;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        let finite = [
            sim.min_temp,
            sim.max_temp,
            sim.initial_temp,
            sim.base_drift,
            sim.drift_variance,
            sim.momentum_chance,
            sim.momentum_step,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::Invalid(
                "simulation values must be finite numbers".to_string(),
            ));
        }
        if sim.min_temp > sim.max_temp {
            return Err(ConfigError::Invalid(format!(
                "min_temp ({}) is above max_temp ({})",
                sim.min_temp, sim.max_temp
            )));
        }
        if sim.drift_variance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "drift_variance must not be negative, got {}",
                sim.drift_variance
            )));
        }
        if !(0.0..=1.0).contains(&sim.momentum_chance) {
            return Err(ConfigError::Invalid(format!(
                "momentum_chance must be within [0, 1], got {}",
                sim.momentum_chance
            )));
        }
        if sim.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "interval_secs must be at least 1".to_string(),
            ));
        }
        if self.runtime.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "stats_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.runtime.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level {:?}",
                self.runtime.log_level
            )));
        }

        self.mqtt.validate().map_err(ConfigError::Invalid)
    }
}
