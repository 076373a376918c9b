//! Cedrus response pad trigger backend.
//!
//! The scanner's trigger output is wired to one input of an XID response pad,
//! so a volume pulse arrives as a press of that input's key code. Each poll
//! drains the pad's queue up to the first qualifying press and then discards
//! whatever is left, so a burst of queued presses counts as a single edge.

use crate::config::parse_settings;
use crate::error::{TriggerError, TriggerResult};
use crate::hardware::{PreopenedDevice, ResponseQueue};
use crate::registry::{BackendContext, BackendRegistry};
use crate::trigger::{protocol, TriggerBackend, TriggerCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Registry identifier.
pub const PORT_TYPE: &str = "cedrus";

/// Settings of the response pad backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePadConfig {
    /// Serial port of the pad; when absent the pad is found by `devicenr`.
    #[serde(default)]
    pub port: Option<String>,
    /// Index into the attached XID devices, used when `port` is not given.
    #[serde(default)]
    pub devicenr: usize,
    /// Baud rate of the pad
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Key code of the input carrying the scanner pulse.
    #[serde(default = "default_sync")]
    pub sync: u8,
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_sync() -> u8 {
    4
}

/// Backend reading sync-key presses from an XID response pad.
pub struct ResponsePadTrigger {
    config: ResponsePadConfig,
    queue: Option<Box<dyn ResponseQueue>>,
    preopened: bool,
}

impl ResponsePadTrigger {
    /// Creates the backend; a pre-opened `queue` survives `close()`.
    pub fn new(config: ResponsePadConfig, queue: Option<Box<dyn ResponseQueue>>) -> Self {
        let preopened = queue.is_some();
        Self {
            config,
            queue,
            preopened,
        }
    }

    /// Builds the backend from a factory context.
    pub fn from_context(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        let config: ResponsePadConfig = parse_settings(ctx.config)?;
        let queue = match ctx.device {
            None => None,
            Some(PreopenedDevice::ResponsePad(queue)) => Some(queue),
            Some(other) => return Err(super::mismatched_device(PORT_TYPE, &other)),
        };
        Ok(Self::new(config, queue))
    }

    /// Configured settings.
    pub fn config(&self) -> &ResponsePadConfig {
        &self.config
    }

    fn queue(&mut self) -> TriggerResult<&mut Box<dyn ResponseQueue>> {
        self.queue.as_mut().ok_or(TriggerError::PortNotOpen)
    }

    /// Discards everything the pad has buffered so far.
    pub fn flush(&mut self) -> TriggerResult<()> {
        let queue = self.queue()?;
        queue.poll_for_response()?;
        while queue.pending() > 0 {
            queue.clear_response_queue();
            queue.poll_for_response()?;
        }
        Ok(())
    }

    #[cfg(feature = "instrument_serial")]
    fn open_device(&self) -> TriggerResult<Box<dyn ResponseQueue>> {
        use crate::hardware::xid::{self, XidResponsePad};

        let pad = match &self.config.port {
            Some(path) => XidResponsePad::open(path, self.config.baudrate)
                .map_err(|e| TriggerError::port_open(path, e))?,
            None => {
                let pads = xid::discover(self.config.baudrate)?;
                let found = pads.len();
                pads.into_iter().nth(self.config.devicenr).ok_or_else(|| {
                    TriggerError::PortNotFound(format!(
                        "response pad #{} not found, {} XID devices attached",
                        self.config.devicenr, found
                    ))
                })?
            }
        };
        Ok(Box::new(pad))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open_device(&self) -> TriggerResult<Box<dyn ResponseQueue>> {
        Err(TriggerError::port_open(
            self.config.port.as_deref().unwrap_or("<auto>"),
            "serial support not enabled. Rebuild with --features instrument_serial",
        ))
    }
}

impl TriggerBackend for ResponsePadTrigger {
    fn port_type(&self) -> &'static str {
        PORT_TYPE
    }

    fn describe(&self) -> String {
        let device = match &self.config.port {
            Some(port) => port.clone(),
            None if self.preopened => "<pre-opened>".to_string(),
            None => format!("device #{}", self.config.devicenr),
        };
        format!("{}, sync key {}", device, self.config.sync)
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn open(&mut self) -> TriggerResult<()> {
        if self.queue.is_some() {
            return Ok(());
        }
        match self.open_device() {
            Ok(queue) => {
                debug!("Response pad opened: {}", queue.describe());
                self.queue = Some(queue);
                Ok(())
            }
            Err(e) => {
                error!("Could not open response pad: {}", e);
                Err(e)
            }
        }
    }

    fn close(&mut self) -> TriggerResult<()> {
        if !self.preopened {
            self.queue = None;
        }
        Ok(())
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        let sync = self.config.sync;
        let queue = self.queue()?;
        let mut edge = false;
        queue.poll_for_response()?;
        while queue.pending() > 0 {
            let Some(event) = queue.next_response() else {
                break;
            };
            if event.key != sync {
                continue;
            }
            if event.pressed {
                edge = true;
                break;
            }
            // Release of the sync key: its press may still be in flight.
            queue.poll_for_response()?;
        }
        queue.clear_response_queue();
        Ok(edge)
    }

    fn wait_for_trigger(&mut self, core: &mut TriggerCore, skip: u32) -> TriggerResult<bool> {
        self.flush()?;
        protocol::wait_for_trigger(self, core, skip)
    }
}

/// Adds the response pad backend to `registry`.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(PORT_TYPE, |ctx| {
        Ok(Box::new(ResponsePadTrigger::from_context(ctx)?) as Box<dyn TriggerBackend>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockResponseQueue;

    fn pad() -> (ResponsePadTrigger, MockResponseQueue) {
        let handle = MockResponseQueue::new();
        let config: ResponsePadConfig =
            parse_settings(&toml::Value::Table(toml::Table::new())).expect("parse");
        (
            ResponsePadTrigger::new(config, Some(Box::new(handle.clone()))),
            handle,
        )
    }

    #[test]
    fn test_defaults() {
        let (trigger, _) = pad();
        assert_eq!(trigger.config().sync, 4);
        assert_eq!(trigger.config().baudrate, 115_200);
        assert_eq!(trigger.config().devicenr, 0);
    }

    #[test]
    fn test_burst_counts_once() {
        let (mut trigger, handle) = pad();
        handle.press(4);
        handle.press(4);
        handle.press(4);
        assert!(trigger.poll_edge().expect("poll"));
        assert_eq!(handle.outstanding(), 0);
        assert!(!trigger.poll_edge().expect("poll"));
    }

    #[test]
    fn test_other_keys_are_ignored() {
        let (mut trigger, handle) = pad();
        handle.press(1);
        handle.release(1);
        assert!(!trigger.poll_edge().expect("poll"));
        handle.press(2);
        handle.press(4);
        assert!(trigger.poll_edge().expect("poll"));
    }

    #[test]
    fn test_release_alone_is_not_an_edge() {
        let (mut trigger, handle) = pad();
        handle.release(4);
        assert!(!trigger.poll_edge().expect("poll"));
    }

    #[test]
    fn test_flush_discards_stale_presses() {
        let (mut trigger, handle) = pad();
        handle.press(4);
        trigger.flush().expect("flush");
        assert_eq!(handle.outstanding(), 0);
        assert!(!trigger.poll_edge().expect("poll"));
    }

    #[test]
    fn test_wrong_device_kind() {
        let config = toml::Value::Table(toml::Table::new());
        let settings = crate::config::TriggerSettings::default();
        let ctx = BackendContext {
            config: &config,
            settings: &settings,
            session_clock: crate::clock::MonotonicClock::shared(),
            keys: crate::input::KeyQueue::shared(),
            device: Some(PreopenedDevice::Parallel(Box::new(
                crate::hardware::mock::MockPinSource::new(),
            ))),
            launcher: None,
        };
        assert!(matches!(
            ResponsePadTrigger::from_context(ctx),
            Err(TriggerError::Configuration(_))
        ));
    }
}
