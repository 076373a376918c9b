//! Serial trigger backend
//!
//! Many scanner interfaces forward each volume pulse as a single byte on an
//! RS-232 line. This backend reads at most one byte per poll and reports an
//! edge when it equals the configured sync byte; every other byte is
//! consumed and ignored.
//!
//! The `sync` setting accepts either an integer byte value (`sync = 5` is
//! byte 0x05) or a one-character string (`sync = "5"` is byte 0x35, the
//! default).

use crate::config::parse_settings;
use crate::error::{TriggerError, TriggerResult};
use crate::hardware::{ByteSource, PreopenedDevice};
use crate::registry::{BackendContext, BackendRegistry};
use crate::trigger::TriggerBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Registry identifier.
pub const PORT_TYPE: &str = "serial";

/// Byte value announcing a trigger on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SyncValue", into = "u8")]
pub struct SyncByte(pub u8);

#[derive(Deserialize)]
#[serde(untagged)]
enum SyncValue {
    Code(i64),
    Text(String),
}

impl TryFrom<SyncValue> for SyncByte {
    type Error = String;

    fn try_from(value: SyncValue) -> Result<Self, Self::Error> {
        match value {
            SyncValue::Code(code) => u8::try_from(code)
                .map(SyncByte)
                .map_err(|_| format!("sync byte {} is out of range 0..=255", code)),
            SyncValue::Text(text) => match text.as_bytes() {
                [byte] => Ok(SyncByte(*byte)),
                _ => Err(format!("sync must be a single character, got '{}'", text)),
            },
        }
    }
}

impl From<SyncByte> for u8 {
    fn from(sync: SyncByte) -> Self {
        sync.0
    }
}

impl Default for SyncByte {
    fn default() -> Self {
        SyncByte(b'5')
    }
}

impl fmt::Display for SyncByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_ascii_graphic() {
            write!(f, "'{}'", self.0 as char)
        } else {
            write!(f, "0x{:02x}", self.0)
        }
    }
}

/// Settings of the serial backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialTriggerConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Parity: 'N', 'E' or 'O'
    #[serde(default = "default_parity")]
    pub parity: char,
    /// Stop bits
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    /// Byte announcing a trigger
    #[serde(default)]
    pub sync: SyncByte,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> char {
    'N'
}

fn default_stopbits() -> u8 {
    1
}

/// Backend watching a serial line for the sync byte.
pub struct SerialTrigger {
    config: SerialTriggerConfig,
    source: Option<Box<dyn ByteSource>>,
    preopened: bool,
}

impl SerialTrigger {
    /// Creates the backend.
    ///
    /// A pre-opened `source` is used as is and survives `close()`.
    ///
    /// # Errors
    ///
    /// [`TriggerError::PortNotFound`] if neither `config.port` nor `source`
    /// is given.
    pub fn new(
        config: SerialTriggerConfig,
        source: Option<Box<dyn ByteSource>>,
    ) -> TriggerResult<Self> {
        if config.port.is_none() && source.is_none() {
            error!("No serial port defined");
            return Err(TriggerError::PortNotFound(
                "no serial port or pre-opened device given".to_string(),
            ));
        }
        let preopened = source.is_some();
        Ok(Self {
            config,
            source,
            preopened,
        })
    }

    /// Builds the backend from a factory context.
    pub fn from_context(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        let config: SerialTriggerConfig = parse_settings(ctx.config)?;
        let source = match ctx.device {
            None => None,
            Some(PreopenedDevice::Serial(source)) => Some(source),
            Some(other) => return Err(super::mismatched_device(PORT_TYPE, &other)),
        };
        Self::new(config, source)
    }

    /// Configured settings.
    pub fn config(&self) -> &SerialTriggerConfig {
        &self.config
    }

    fn port_name(&self) -> &str {
        self.config.port.as_deref().unwrap_or("<pre-opened>")
    }

    #[cfg(feature = "instrument_serial")]
    fn open_port(&self, path: &str) -> TriggerResult<Box<dyn ByteSource>> {
        use crate::hardware::serial_port::{SerialByteSource, SerialLineConfig};

        let line = SerialLineConfig {
            path: path.to_string(),
            baud_rate: self.config.baudrate,
            data_bits: self.config.bytesize,
            parity: self.config.parity,
            stop_bits: self.config.stopbits,
        };
        let source =
            SerialByteSource::open(&line).map_err(|e| TriggerError::port_open(path, e))?;
        Ok(Box::new(source))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open_port(&self, path: &str) -> TriggerResult<Box<dyn ByteSource>> {
        Err(TriggerError::port_open(
            path,
            "serial support not enabled. Rebuild with --features instrument_serial",
        ))
    }
}

impl TriggerBackend for SerialTrigger {
    fn port_type(&self) -> &'static str {
        PORT_TYPE
    }

    fn describe(&self) -> String {
        format!(
            "{} @ {} baud {}{}{}, sync {}",
            self.port_name(),
            self.config.baudrate,
            self.config.bytesize,
            self.config.parity,
            self.config.stopbits,
            self.config.sync
        )
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn open(&mut self) -> TriggerResult<()> {
        if self.source.is_some() {
            return Ok(());
        }
        let path = self
            .config
            .port
            .clone()
            .ok_or_else(|| TriggerError::PortNotFound("no serial port defined".to_string()))?;
        match self.open_port(&path) {
            Ok(source) => {
                self.source = Some(source);
                Ok(())
            }
            Err(e) => {
                error!("Could not open serial port {}: {}", path, e);
                Err(e)
            }
        }
    }

    fn close(&mut self) -> TriggerResult<()> {
        if !self.preopened {
            self.source = None;
        }
        Ok(())
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        let source = self.source.as_mut().ok_or(TriggerError::PortNotOpen)?;
        Ok(source.read_byte()? == Some(self.config.sync.0))
    }
}

/// Adds the serial backend to `registry`.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(PORT_TYPE, |ctx| {
        Ok(Box::new(SerialTrigger::from_context(ctx)?) as Box<dyn TriggerBackend>)
    });
}
