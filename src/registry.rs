//! Backend registry and trigger factory.
//!
//! Port types are resolved case-insensitively. The process-wide registry is
//! populated with the built-in backends on first use; each adapter module
//! contributes its entry through its own `register` function. Registering an
//! existing port type replaces the previous constructor, which is how tests
//! swap a hardware backend for a double.
//!
//! # Example
//!
//! ```no_run
//! use scanner_trigger::clock::MonotonicClock;
//! use scanner_trigger::input::KeyQueue;
//! use scanner_trigger::registry::{self, Collaborators};
//!
//! fn main() -> anyhow::Result<()> {
//!     let clock = MonotonicClock::shared();
//!     let config: toml::Value = toml::from_str("port = '/dev/ttyUSB0'\nsync = '5'\ntimeout = 60.0")?;
//!     let mut trigger = registry::create(
//!         "Serial",
//!         clock.clone(),
//!         &config,
//!         Collaborators::new(KeyQueue::shared()),
//!     )?;
//!     trigger.open()?;
//!     trigger.wait_for_trigger(5)?;
//!     clock.reset();
//!     Ok(())
//! }
//! ```

use crate::adapters::{self, ScanLauncher};
use crate::clock::SharedClock;
use crate::config::TriggerSettings;
use crate::error::{TriggerError, TriggerResult};
use crate::hardware::PreopenedDevice;
use crate::input::SharedKeySource;
use crate::trigger::{TriggerBackend, TriggerDevice};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Constructor stored in the registry.
pub type BackendConstructor =
    Arc<dyn Fn(BackendContext<'_>) -> TriggerResult<Box<dyn TriggerBackend>> + Send + Sync>;

/// External collaborators handed to the factory alongside the configuration.
pub struct Collaborators {
    /// Key-press source for abort detection and keyboard triggers.
    pub keys: SharedKeySource,
    /// Pre-opened handle that bypasses the backend's own open logic.
    pub device: Option<PreopenedDevice>,
    /// Launch helper for the scanner-emulation backend.
    pub launcher: Option<Box<dyn ScanLauncher>>,
}

impl Collaborators {
    /// Collaborators with only a key source.
    pub fn new(keys: SharedKeySource) -> Self {
        Self {
            keys,
            device: None,
            launcher: None,
        }
    }

    /// Supplies a pre-opened device handle.
    pub fn with_device(mut self, device: PreopenedDevice) -> Self {
        self.device = Some(device);
        self
    }

    /// Supplies a custom scan launcher.
    pub fn with_launcher(mut self, launcher: Box<dyn ScanLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("device", &self.device)
            .field("launcher", &self.launcher.is_some())
            .finish()
    }
}

/// Everything a backend constructor may use.
pub struct BackendContext<'a> {
    /// Factory input table.
    pub config: &'a toml::Value,
    /// Validated shared settings from the same table.
    pub settings: &'a TriggerSettings,
    /// Session clock owned by the caller.
    pub session_clock: SharedClock,
    /// Key-press source.
    pub keys: SharedKeySource,
    /// Pre-opened device, if any.
    pub device: Option<PreopenedDevice>,
    /// Scan launcher, if any.
    pub launcher: Option<Box<dyn ScanLauncher>>,
}

/// Mapping from lowercase port type to constructor.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        adapters::register_builtin(&mut registry);
        registry
    }

    /// Registers `constructor` under `port_type`, replacing any previous entry.
    pub fn register<F>(&mut self, port_type: &str, constructor: F)
    where
        F: Fn(BackendContext<'_>) -> TriggerResult<Box<dyn TriggerBackend>>
            + Send
            + Sync
            + 'static,
    {
        let key = port_type.to_lowercase();
        if self.constructors.insert(key.clone(), Arc::new(constructor)).is_some() {
            debug!("Replaced trigger backend '{}'", key);
        }
    }

    /// Returns `true` if `port_type` is registered.
    pub fn contains(&self, port_type: &str) -> bool {
        self.constructors.contains_key(&port_type.to_lowercase())
    }

    /// Registered port types, sorted.
    pub fn port_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    fn constructor(&self, port_type: &str) -> TriggerResult<BackendConstructor> {
        self.constructors
            .get(&port_type.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                error!("Cannot connect to {}", port_type);
                TriggerError::UnknownBackend(port_type.to_string())
            })
    }

    /// Builds a trigger device for `port_type`.
    ///
    /// # Errors
    ///
    /// [`TriggerError::UnknownBackend`] for an unregistered port type; any
    /// construction error of the backend, unchanged.
    pub fn create(
        &self,
        port_type: &str,
        session_clock: SharedClock,
        config: &toml::Value,
        extra: Collaborators,
    ) -> TriggerResult<TriggerDevice> {
        build(self.constructor(port_type)?, session_clock, config, extra)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("port_types", &self.port_types())
            .finish()
    }
}

fn build(
    constructor: BackendConstructor,
    session_clock: SharedClock,
    config: &toml::Value,
    extra: Collaborators,
) -> TriggerResult<TriggerDevice> {
    let settings = TriggerSettings::from_config(config)?;
    let keys = extra.keys.clone();
    let context = BackendContext {
        config,
        settings: &settings,
        session_clock: session_clock.clone(),
        keys: extra.keys,
        device: extra.device,
        launcher: extra.launcher,
    };
    let backend = constructor(context)?;
    Ok(TriggerDevice::new(backend, settings, session_clock, keys))
}

static REGISTRY: Lazy<RwLock<BackendRegistry>> =
    Lazy::new(|| RwLock::new(BackendRegistry::with_builtin()));

/// Registers a backend in the process-wide registry.
pub fn register<F>(port_type: &str, constructor: F)
where
    F: Fn(BackendContext<'_>) -> TriggerResult<Box<dyn TriggerBackend>> + Send + Sync + 'static,
{
    REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(port_type, constructor);
}

/// Port types known to the process-wide registry.
pub fn registered_port_types() -> Vec<String> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .port_types()
}

/// Creates a trigger device from the process-wide registry.
pub fn create(
    port_type: &str,
    session_clock: SharedClock,
    config: &toml::Value,
    extra: Collaborators,
) -> TriggerResult<TriggerDevice> {
    let constructor = REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .constructor(port_type)?;
    build(constructor, session_clock, config, extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::input::KeyQueue;

    fn empty_config() -> toml::Value {
        toml::Value::Table(toml::Table::new())
    }

    #[test]
    fn test_builtin_port_types() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(
            registry.port_types(),
            vec!["cedrus", "dummy", "keyboard", "launchscan", "parallel", "serial"]
        );
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BackendRegistry::with_builtin();
        let result = registry.create(
            "fmri-magic",
            MonotonicClock::shared(),
            &empty_config(),
            Collaborators::new(KeyQueue::shared()),
        );
        assert!(matches!(result, Err(TriggerError::UnknownBackend(name)) if name == "fmri-magic"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.contains("DUMMY"));
        let device = registry
            .create(
                "KeyBoard",
                MonotonicClock::shared(),
                &empty_config(),
                Collaborators::new(KeyQueue::shared()),
            )
            .expect("keyboard trigger");
        assert_eq!(device.port_type(), "keyboard");
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register("Keyboard", |_ctx| {
            Err(TriggerError::Configuration("overridden".to_string()))
        });
        let result = registry.create(
            "keyboard",
            MonotonicClock::shared(),
            &empty_config(),
            Collaborators::new(KeyQueue::shared()),
        );
        assert!(matches!(result, Err(TriggerError::Configuration(msg)) if msg == "overridden"));
    }

    #[test]
    fn test_invalid_shared_settings_fail_creation() {
        let registry = BackendRegistry::with_builtin();
        let config: toml::Value = toml::from_str("timeout = 0.0").expect("valid toml");
        let result = registry.create(
            "keyboard",
            MonotonicClock::shared(),
            &config,
            Collaborators::new(KeyQueue::shared()),
        );
        assert!(matches!(result, Err(TriggerError::Configuration(_))));
    }
}
