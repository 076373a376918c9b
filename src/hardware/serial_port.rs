//! Serial byte source over the `serialport` crate.

use super::ByteSource;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read};
use std::time::Duration;
use tracing::debug;

/// Line settings for a serial trigger port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialLineConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Baud rate (9600, 115200, etc.)
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    pub data_bits: u8,
    /// Parity: 'N', 'E' or 'O'
    pub parity: char,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
}

impl SerialLineConfig {
    fn data_bits(&self) -> io::Result<DataBits> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(invalid(format!("unsupported byte size {}", other))),
        }
    }

    fn parity(&self) -> io::Result<Parity> {
        match self.parity.to_ascii_uppercase() {
            'N' => Ok(Parity::None),
            'E' => Ok(Parity::Even),
            'O' => Ok(Parity::Odd),
            other => Err(invalid(format!("unsupported parity '{}'", other))),
        }
    }

    fn stop_bits(&self) -> io::Result<StopBits> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(invalid(format!("unsupported stop bits {}", other))),
        }
    }

    /// Opens the port in zero-timeout mode.
    pub fn open(&self) -> io::Result<Box<dyn SerialPort>> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(self.data_bits()?)
            .parity(self.parity()?)
            .stop_bits(self.stop_bits()?)
            .timeout(Duration::ZERO)
            .open()
            .map_err(io::Error::from)?;

        debug!(
            "Serial port '{}' opened at {} baud",
            self.path, self.baud_rate
        );
        Ok(port)
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// [`ByteSource`] reading one byte at a time from an open serial port.
pub struct SerialByteSource {
    port: Box<dyn SerialPort>,
}

impl SerialByteSource {
    /// Wraps an already opened port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Opens `config` and wraps the port.
    pub fn open(config: &SerialLineConfig) -> io::Result<Self> {
        Ok(Self::new(config.open()?))
    }
}

impl ByteSource for SerialByteSource {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.port.bytes_to_read().map_err(io::Error::from)? == 0 {
            return Ok(None);
        }
        let mut buffer = [0u8; 1];
        match self.port.read(&mut buffer) {
            Ok(1) => Ok(Some(buffer[0])),
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!(
            "serial port '{}'",
            self.port.name().unwrap_or_else(|| "<unnamed>".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(data_bits: u8, parity: char, stop_bits: u8) -> SerialLineConfig {
        SerialLineConfig {
            path: "/dev/null-serial".to_string(),
            baud_rate: 9600,
            data_bits,
            parity,
            stop_bits,
        }
    }

    #[test]
    fn test_line_settings_conversion() {
        let config = line(7, 'e', 2);
        assert_eq!(config.data_bits().expect("7 bits"), DataBits::Seven);
        assert_eq!(config.parity().expect("even"), Parity::Even);
        assert_eq!(config.stop_bits().expect("2 stop bits"), StopBits::Two);
    }

    #[test]
    fn test_invalid_line_settings() {
        assert!(line(9, 'N', 1).data_bits().is_err());
        assert!(line(8, 'X', 1).parity().is_err());
        assert!(line(8, 'N', 3).stop_bits().is_err());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = line(8, 'N', 1);
        assert!(config.open().is_err());
    }
}
