//! Raw signal sources behind the trigger backends.
//!
//! Each backend adapter reduces its signal to "did an edge happen since the
//! last poll", but the reads themselves go through the small traits defined
//! here. Real implementations wrap the serial port (`serialport`), the Linux
//! parallel-port driver (`ppdev`) and the Cedrus XID protocol; the [`mock`]
//! module provides scripted doubles for tests.
//!
//! All reads must be non-blocking or bounded by a very short driver timeout:
//! the wait loop checks the abort key only between reads.

use std::fmt;
use std::io;

pub mod mock;
pub mod parport;
#[cfg(feature = "instrument_serial")]
pub mod serial_port;
pub mod xid;

pub use xid::XidPacketDecoder;

/// Non-blocking byte reader.
pub trait ByteSource: Send {
    /// Returns the next byte if one is already available.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Human-readable identifier for logs.
    fn describe(&self) -> String {
        "byte source".to_string()
    }
}

/// Reader for the level of a single input pin.
pub trait PinSource: Send {
    /// Current level of `pin`; `true` is high.
    fn read_pin(&mut self, pin: u8) -> io::Result<bool>;

    /// Human-readable identifier for logs.
    fn describe(&self) -> String {
        "pin source".to_string()
    }
}

/// One event reported by a response pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseEvent {
    /// Button number.
    pub key: u8,
    /// Input port the button belongs to.
    pub port: u8,
    /// `true` for a press, `false` for a release.
    pub pressed: bool,
    /// Device-side reaction time in milliseconds.
    pub rt_ms: u32,
}

/// Device-side event queue of a response pad.
pub trait ResponseQueue: Send {
    /// Moves any events pending on the device into the queue.
    fn poll_for_response(&mut self) -> io::Result<()>;

    /// Number of queued events.
    fn pending(&self) -> usize;

    /// Pops the oldest queued event.
    fn next_response(&mut self) -> Option<ResponseEvent>;

    /// Drops every queued event.
    fn clear_response_queue(&mut self);

    /// Human-readable identifier for logs.
    fn describe(&self) -> String {
        "response queue".to_string()
    }
}

/// A handle opened by the caller, bypassing the backend's own open logic.
pub enum PreopenedDevice {
    /// Serial byte stream.
    Serial(Box<dyn ByteSource>),
    /// Parallel port.
    Parallel(Box<dyn PinSource>),
    /// Response pad queue.
    ResponsePad(Box<dyn ResponseQueue>),
}

impl PreopenedDevice {
    /// Variant name, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            PreopenedDevice::Serial(_) => "serial",
            PreopenedDevice::Parallel(_) => "parallel",
            PreopenedDevice::ResponsePad(_) => "response pad",
        }
    }
}

impl fmt::Debug for PreopenedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            PreopenedDevice::Serial(source) => source.describe(),
            PreopenedDevice::Parallel(source) => source.describe(),
            PreopenedDevice::ResponsePad(queue) => queue.describe(),
        };
        f.debug_tuple("PreopenedDevice").field(&description).finish()
    }
}
