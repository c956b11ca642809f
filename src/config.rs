//! Configuration for the card detector agent.

use crate::device::DeviceConfig;
use crate::protocol::ValidationError;
use crate::session::PortTarget;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default serial line rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Main configuration for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial port of the device; empty means no target
    pub serial_port: String,

    /// Serial line rate
    pub baud_rate: u32,

    /// Baseline ADC reading with nothing on the sensor
    pub floor_value: u16,

    /// Millimetres per ADC step above the floor
    #[serde(alias = "cal_factor")]
    pub factor: f64,

    /// Minimum peak for a pass
    pub envelope_card_threshold: u16,

    /// Peaks above this are double cards
    pub card_upper_threshold: u16,

    /// Sensor mounted upside-down
    pub reverse_sensor: bool,

    /// Bypass fault latching
    pub system_override: bool,

    /// Which outcomes reach the error history
    pub log_verbosity: LogVerbosity,

    /// Path for counters and the durable error log
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let device = DeviceConfig::default();
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("card-detector-agent");

        Self {
            serial_port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            floor_value: device.floor_value,
            factor: 0.01,
            envelope_card_threshold: device.card_threshold,
            card_upper_threshold: device.card_upper_threshold,
            reverse_sensor: device.reverse_sensor,
            system_override: device.system_override,
            log_verbosity: LogVerbosity::Error,
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        JsonConfigStore::default_location().load()
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        JsonConfigStore::default_location().save(self)
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("card-detector-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// File holding the persisted total count.
    pub fn counters_path(&self) -> PathBuf {
        self.data_path.join("counters.json")
    }

    /// Durable error log.
    pub fn error_log_path(&self) -> PathBuf {
        self.data_path.join("error_log.txt")
    }

    /// The part of the configuration that lives on the device.
    pub fn device(&self) -> DeviceConfig {
        DeviceConfig {
            floor_value: self.floor_value,
            card_threshold: self.envelope_card_threshold,
            card_upper_threshold: self.card_upper_threshold,
            reverse_sensor: self.reverse_sensor,
            system_override: self.system_override,
        }
    }

    /// Copy device-side values back into this configuration.
    pub fn apply_device(&mut self, device: &DeviceConfig) {
        self.floor_value = device.floor_value;
        self.envelope_card_threshold = device.card_threshold;
        self.card_upper_threshold = device.card_upper_threshold;
        self.reverse_sensor = device.reverse_sensor;
        self.system_override = device.system_override;
    }

    /// Connection target, if a port is configured.
    pub fn port_target(&self) -> Option<PortTarget> {
        let path = self.serial_port.trim();
        if path.is_empty() {
            None
        } else {
            Some(PortTarget::new(path, self.baud_rate))
        }
    }

    /// Check every value against the device ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device().validate().map_err(ConfigError::Invalid)?;
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidValue {
                key: "baud_rate".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if !self.factor.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "factor".to_string(),
                message: "must be a finite number".to_string(),
            });
        }
        Ok(())
    }

    /// Set one value by its key, as typed by an operator.
    ///
    /// The configuration is left untouched if the result would not validate.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut updated = self.clone();
        match key {
            "serial_port" => updated.serial_port = value.trim().to_string(),
            "baud_rate" => updated.baud_rate = parse_value(key, value)?,
            "floor_value" => updated.floor_value = parse_value(key, value)?,
            "factor" | "cal_factor" => updated.factor = parse_value(key, value)?,
            "envelope_card_threshold" => updated.envelope_card_threshold = parse_value(key, value)?,
            "card_upper_threshold" => updated.card_upper_threshold = parse_value(key, value)?,
            "reverse_sensor" => updated.reverse_sensor = parse_flag(key, value)?,
            "system_override" => updated.system_override = parse_flag(key, value)?,
            "log_verbosity" => updated.log_verbosity = value.parse()?,
            "data_path" => updated.data_path = PathBuf::from(value),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{value}'"),
    })
}

/// Accepts `on`/`off`, `true`/`false` and `1`/`0`.
pub fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected on/off, got '{value}'"),
        }),
    }
}

/// Error history verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    /// Only faults are recorded
    Error,
    /// Passes are recorded too
    Info,
}

impl std::str::FromStr for LogVerbosity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogVerbosity::Error),
            "info" => Ok(LogVerbosity::Info),
            other => Err(ConfigError::InvalidValue {
                key: "log_verbosity".to_string(),
                message: format!("expected 'error' or 'info', got '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for LogVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogVerbosity::Error => write!(f, "error"),
            LogVerbosity::Info => write!(f, "info"),
        }
    }
}

/// Persistent home of the configuration.
pub trait ConfigStore: Send {
    fn load(&self) -> Result<Config, ConfigError>;
    fn save(&self, config: &Config) -> Result<(), ConfigError>;
}

/// Pretty-printed JSON file store.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    /// Store backed by an explicit file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`Config::config_path`].
    pub fn default_location() -> Self {
        Self::at(Config::config_path())
    }

    /// File this store reads and writes.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<Config, ConfigError> {
        if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    fn save(&self, config: &Config) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&self.path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(ValidationError),
    InvalidValue { key: String, message: String },
    UnknownKey(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
            ConfigError::InvalidValue { key, message } => write!(f, "Invalid {key}: {message}"),
            ConfigError::UnknownKey(key) => write!(f, "Unknown configuration key: {key}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Invalid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for ConfigError {
    fn from(e: ValidationError) -> Self {
        ConfigError::Invalid(e)
    }
}
