//! Custom error types for the trigger library.
//!
//! This module defines the primary error type, `TriggerError`, shared by the
//! registry, the trigger protocol and every backend. Using the `thiserror`
//! crate, it provides one consistent taxonomy for everything that can go wrong
//! while waiting for a scanner trigger.
//!
//! ## Error Hierarchy
//!
//! - **`UnknownBackend`**: The factory was given a port type nobody registered.
//!   Recoverable by choosing another identifier.
//! - **`PortNotFound`** / **`PortOpen`**: Construction or `open()` could not
//!   reach the backend resource. Fatal to the session unless the caller retries
//!   with a different configuration.
//! - **`PortNotOpen`**: A poll or wait was attempted before `open()`.
//! - **`Timeout`**: No qualifying edge arrived within the configured timeout
//!   and before any edge was accepted in the current wait call.
//! - **`Aborted`**: The abort key was observed during a blocking wait.
//! - **`Configuration`** / **`Config`**: Invalid backend settings, or a failure
//!   loading the application configuration.
//! - **`Launch`**: The scanner launch helper used by the composite adapter failed.
//! - **`Io`**: A raw backend read failed after the port was opened.
//!
//! `Timeout` and `Aborted` are the only two ways a blocking wait ends without
//! success; neither is ever reported as `Ok(false)`.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the trigger error type.
pub type TriggerResult<T> = std::result::Result<T, TriggerError>;

/// Errors raised while creating, opening or waiting on a trigger device.
#[derive(Error, Debug)]
pub enum TriggerError {
    /// No backend is registered under the requested port type.
    #[error("Cannot connect to unknown trigger port type '{0}'")]
    UnknownBackend(String),

    /// Neither a port identifier nor a pre-opened handle was supplied.
    #[error("Trigger port not found: {0}")]
    PortNotFound(String),

    /// The underlying open call failed.
    #[error("Could not open trigger port '{port}': {reason}")]
    PortOpen {
        /// Identifier of the port that failed to open.
        port: String,
        /// Reason reported by the driver.
        reason: String,
    },

    /// The device was used before `open()` succeeded.
    #[error("Attempting to use a port that is not open")]
    PortNotOpen,

    /// No edge was seen within the timeout.
    #[error("Waiting for trigger timed out after {0:?}")]
    Timeout(Duration),

    /// The abort key was pressed.
    #[error("Experiment aborted by the user")]
    Aborted,

    /// Backend settings are missing or invalid.
    #[error("Invalid trigger configuration: {0}")]
    Configuration(String),

    /// Loading the application configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The scanner launch helper failed.
    #[error("Could not launch scan: {0}")]
    Launch(String),

    /// A raw backend read failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TriggerError {
    /// Builds a [`TriggerError::PortOpen`] from any displayable reason.
    pub fn port_open(port: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::PortOpen {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for the two outcomes that end a wait without a trigger.
    pub fn is_wait_interruption(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Aborted)
    }
}

impl From<toml::de::Error> for TriggerError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
