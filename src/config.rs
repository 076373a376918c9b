//! Configuration for trigger devices and the probe application.
//!
//! Two layers live here:
//!
//! 1. **Factory input**: a `toml::Value` table handed to
//!    [`crate::registry::create`]. Every backend deserializes its own typed
//!    settings struct from the same table; [`TriggerSettings`] holds the keys
//!    shared by all backends (`timeout`, `esc_key`, `poll_interval_us`).
//! 2. **Application configuration**: [`AppConfig`], loaded with Figment from a
//!    TOML file merged with `SCANTRIGGER_`-prefixed environment variables.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SCANTRIGGER_APPLICATION__LOG_LEVEL=debug
//! SCANTRIGGER_TRIGGER__PORT_TYPE=dummy
//! SCANTRIGGER_TRIGGER__TIMEOUT=30
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scanner_trigger::config::AppConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load_from("config/scanner_trigger.toml")?;
//!     println!("Trigger port type: {}", config.trigger.port_type);
//!     Ok(())
//! }
//! ```

use crate::error::{TriggerError, TriggerResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// The configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Settings shared by every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Seconds to wait for the first edge before failing with a timeout.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Key that aborts a blocking wait.
    #[serde(default = "default_esc_key")]
    pub esc_key: String,
    /// Pause between wait-loop iterations in microseconds; 0 only yields.
    #[serde(default)]
    pub poll_interval_us: u64,
    /// `timeout` converted once at validation.
    #[serde(skip, default = "default_timeout_span")]
    timeout_span: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            esc_key: default_esc_key(),
            poll_interval_us: 0,
            timeout_span: default_timeout_span(),
        }
    }
}

impl TriggerSettings {
    /// Extracts and validates the common keys of a factory input table.
    pub fn from_config(config: &toml::Value) -> TriggerResult<Self> {
        let mut settings: Self = parse_settings(config)?;
        settings.validate()?;
        settings.timeout_span = positive_seconds("timeout", settings.timeout)?;
        Ok(settings)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> TriggerResult<()> {
        positive_seconds("timeout", self.timeout)?;
        if self.esc_key.is_empty() {
            return Err(TriggerError::Configuration(
                "esc_key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout as a [`Duration`].
    pub fn timeout_duration(&self) -> Duration {
        self.timeout_span
    }

    /// Pause between wait-loop iterations.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

/// Converts a positive number of seconds into a [`Duration`].
///
/// Fails with a configuration error for zero, negative, non-finite and
/// out-of-range values.
pub fn positive_seconds(name: &str, secs: f64) -> TriggerResult<Duration> {
    if secs.is_finite() && secs > 0.0 {
        if let Ok(span) = Duration::try_from_secs_f64(secs) {
            return Ok(span);
        }
    }
    Err(TriggerError::Configuration(format!(
        "{} must be a positive number of seconds, got {}",
        name, secs
    )))
}

/// Deserializes a typed settings struct out of a factory input table.
///
/// Unknown keys are ignored so that every backend can read its own subset of
/// one shared table.
pub fn parse_settings<T: DeserializeOwned>(config: &toml::Value) -> TriggerResult<T> {
    let value = match config {
        toml::Value::Table(_) => config.clone(),
        other => {
            return Err(TriggerError::Configuration(format!(
                "trigger configuration must be a table, got {}",
                other.type_str()
            )))
        }
    };
    Ok(value.try_into()?)
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Trigger device definition
    pub trigger: TriggerDefinition,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Trigger device definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Registered port type (dummy, serial, parallel, keyboard, cedrus, launchscan)
    pub port_type: String,
    /// Leading triggers to skip before the time origin
    #[serde(default)]
    pub skip: u32,
    /// Factory input handed to the backend
    #[serde(flatten)]
    pub options: toml::Table,
}

impl TriggerDefinition {
    /// Factory input table for [`crate::registry::create`].
    pub fn factory_input(&self) -> toml::Value {
        toml::Value::Table(self.options.clone())
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_timeout() -> f64 {
    999.0
}

fn default_timeout_span() -> Duration {
    Duration::from_secs(999)
}

fn default_esc_key() -> String {
    "escape".to_string()
}

fn default_app_name() -> String {
    "scanner-trigger".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load configuration from `config/scanner_trigger.toml` and environment
    /// variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/scanner_trigger.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`SCANTRIGGER_` prefix) take precedence over the
    /// file. The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCANTRIGGER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Port type is not empty
    /// - The shared trigger settings are in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.trigger.port_type.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "trigger 'port_type' cannot be empty".to_string(),
            ));
        }

        TriggerSettings::from_config(&self.trigger.factory_input())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }
}
