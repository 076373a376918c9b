//! Parallel-port trigger backend.
//!
//! The scanner pulse is wired to one input pin. Each poll reads the pin once
//! and compares it with the level seen on the previous poll; a change in the
//! configured direction is an edge.

use crate::config::parse_settings;
use crate::error::{TriggerError, TriggerResult};
use crate::hardware::parport::{self, status_bit};
use crate::hardware::{PinSource, PreopenedDevice};
use crate::registry::{BackendContext, BackendRegistry};
use crate::trigger::TriggerBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error};

/// Registry identifier.
pub const PORT_TYPE: &str = "parallel";

/// Level change that counts as a trigger.
///
/// Accepts `"rising"`, `"falling"`, `"both"` or the numeric forms `1`, `-1`
/// and `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolarityValue", rename_all = "lowercase")]
pub enum EdgePolarity {
    /// Low to high.
    #[default]
    Rising,
    /// High to low.
    Falling,
    /// Any change.
    Both,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PolarityValue {
    Code(i64),
    Name(String),
}

impl TryFrom<PolarityValue> for EdgePolarity {
    type Error = String;

    fn try_from(value: PolarityValue) -> Result<Self, Self::Error> {
        match value {
            PolarityValue::Code(1) => Ok(EdgePolarity::Rising),
            PolarityValue::Code(-1) => Ok(EdgePolarity::Falling),
            PolarityValue::Code(0) => Ok(EdgePolarity::Both),
            PolarityValue::Code(other) => Err(format!("unknown edge code {}", other)),
            PolarityValue::Name(name) => match name.to_ascii_lowercase().as_str() {
                "rising" => Ok(EdgePolarity::Rising),
                "falling" => Ok(EdgePolarity::Falling),
                "both" | "either" => Ok(EdgePolarity::Both),
                _ => Err(format!("unknown edge '{}'", name)),
            },
        }
    }
}

impl EdgePolarity {
    /// Returns `true` if the transition `previous -> current` qualifies.
    pub fn matches(self, previous: bool, current: bool) -> bool {
        match self {
            EdgePolarity::Rising => !previous && current,
            EdgePolarity::Falling => previous && !current,
            EdgePolarity::Both => previous != current,
        }
    }
}

impl fmt::Display for EdgePolarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgePolarity::Rising => "rising",
            EdgePolarity::Falling => "falling",
            EdgePolarity::Both => "both",
        };
        f.write_str(name)
    }
}

/// Settings of the parallel backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelTriggerConfig {
    /// Port device, e.g. "/dev/parport0".
    #[serde(default)]
    pub address: Option<String>,
    /// DB-25 pin carrying the pulse.
    #[serde(default = "default_pin")]
    pub pin: u8,
    /// Transition counted as a trigger.
    #[serde(default)]
    pub edge: EdgePolarity,
    /// Pause after opening the port before the first read, in milliseconds.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_pin() -> u8 {
    10
}

fn default_settle_ms() -> u64 {
    500
}

/// Backend detecting level changes on one parallel-port pin.
pub struct ParallelTrigger {
    config: ParallelTriggerConfig,
    source: Option<Box<dyn PinSource>>,
    preopened: bool,
    previous_state: bool,
}

impl ParallelTrigger {
    /// Creates the backend.
    ///
    /// # Errors
    ///
    /// [`TriggerError::Configuration`] for a pin that cannot be read, and
    /// [`TriggerError::PortNotFound`] if neither an address nor a pre-opened
    /// source is given.
    pub fn new(
        config: ParallelTriggerConfig,
        source: Option<Box<dyn PinSource>>,
    ) -> TriggerResult<Self> {
        if status_bit(config.pin).is_none() && !(2..=9).contains(&config.pin) {
            return Err(TriggerError::Configuration(format!(
                "pin {} is not a readable parallel port pin",
                config.pin
            )));
        }
        if config.address.is_none() && source.is_none() {
            error!("No parallel port address defined");
            return Err(TriggerError::PortNotFound(
                "no parallel port address or pre-opened device given".to_string(),
            ));
        }
        let preopened = source.is_some();
        Ok(Self {
            config,
            source,
            preopened,
            previous_state: false,
        })
    }

    /// Builds the backend from a factory context.
    pub fn from_context(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        let config: ParallelTriggerConfig = parse_settings(ctx.config)?;
        let source = match ctx.device {
            None => None,
            Some(PreopenedDevice::Parallel(source)) => Some(source),
            Some(other) => return Err(super::mismatched_device(PORT_TYPE, &other)),
        };
        Self::new(config, source)
    }

    /// Configured settings.
    pub fn config(&self) -> &ParallelTriggerConfig {
        &self.config
    }

    fn read_level(&mut self) -> TriggerResult<bool> {
        let pin = self.config.pin;
        let source = self.source.as_mut().ok_or(TriggerError::PortNotOpen)?;
        Ok(source.read_pin(pin)?)
    }
}

impl TriggerBackend for ParallelTrigger {
    fn port_type(&self) -> &'static str {
        PORT_TYPE
    }

    fn describe(&self) -> String {
        format!(
            "{} pin {} ({} edge)",
            self.config.address.as_deref().unwrap_or("<pre-opened>"),
            self.config.pin,
            self.config.edge
        )
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn open(&mut self) -> TriggerResult<()> {
        if self.source.is_none() {
            let address = self.config.address.clone().ok_or_else(|| {
                TriggerError::PortNotFound("no parallel port address defined".to_string())
            })?;
            let source = parport::open_pin_source(&address).map_err(|e| {
                error!("Could not open parallel port {}: {}", address, e);
                TriggerError::port_open(&address, e)
            })?;
            self.source = Some(source);
            std::thread::sleep(Duration::from_millis(self.config.settle_ms));
        }
        // Baseline so a line idling high does not look like a rising edge.
        self.previous_state = self.read_level()?;
        debug!(
            "Parallel pin {} idles {}",
            self.config.pin,
            if self.previous_state { "high" } else { "low" }
        );
        Ok(())
    }

    fn close(&mut self) -> TriggerResult<()> {
        if !self.preopened {
            self.source = None;
        }
        Ok(())
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        let current = self.read_level()?;
        let edge = self.config.edge.matches(self.previous_state, current);
        self.previous_state = current;
        Ok(edge)
    }
}

/// Adds the parallel backend to `registry`.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(PORT_TYPE, |ctx| {
        Ok(Box::new(ParallelTrigger::from_context(ctx)?) as Box<dyn TriggerBackend>)
    });
}
