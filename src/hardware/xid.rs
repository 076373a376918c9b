//! Cedrus XID response pad protocol.
//!
//! In XID mode the pad sends one 6-byte packet per button event:
//!
//! ```text
//! 'k' | info | rt0 rt1 rt2 rt3
//! ```
//!
//! where `info` packs the port (bits 0-3), the press flag (bit 4) and the
//! button number (bits 5-7), and `rt` is a little-endian reaction time in
//! milliseconds. The scanner's trigger line is wired to one of the pad's
//! inputs, so a trigger shows up as a press of that input's key code.
//!
//! A device identifies itself by answering the `_c1` query with `_xid`
//! followed by a mode digit; `0` is XID mode, anything else is switched over
//! with `c10`. Only ports that answer this handshake count as pads.

use super::ResponseEvent;

const PACKET_LEN: usize = 6;
const PACKET_MARKER: u8 = b'k';

/// Query every XID device answers with its protocol mode.
pub const PROTOCOL_QUERY: &[u8] = b"_c1";
/// Command switching a device into XID mode.
pub const XID_MODE_COMMAND: &[u8] = b"c10";
/// Length of the reply to [`PROTOCOL_QUERY`].
pub const PROTOCOL_REPLY_LEN: usize = 5;
/// USB vendor id of the FTDI bridge inside Cedrus devices.
pub const FTDI_VID: u16 = 0x0403;

/// Protocol mode of an XID device, from its `_c1` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidMode {
    /// Binary XID packets.
    Xid,
    /// Any other mode (RB-series ASCII, PST); needs [`XID_MODE_COMMAND`].
    Other(u8),
}

/// Parses the reply to [`PROTOCOL_QUERY`]; `None` if it is not an XID device.
pub fn parse_protocol_reply(reply: &[u8]) -> Option<XidMode> {
    match reply {
        [b'_', b'x', b'i', b'd', b'0', ..] => Some(XidMode::Xid),
        [b'_', b'x', b'i', b'd', mode, ..] => Some(XidMode::Other(*mode)),
        _ => None,
    }
}

/// What discovery knows about a serial port before talking to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// OS path of the port.
    pub name: String,
    /// USB vendor id; `None` for non-USB ports.
    pub usb_vid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
}

impl PortCandidate {
    /// `true` for USB ports that may host a Cedrus device.
    pub fn may_be_xid(&self) -> bool {
        let cedrus = self
            .manufacturer
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("cedrus"));
        self.usb_vid == Some(FTDI_VID) || (self.usb_vid.is_some() && cedrus)
    }
}

/// Ports worth a handshake, in enumeration order.
pub fn xid_candidates(ports: &[PortCandidate]) -> Vec<&PortCandidate> {
    ports.iter().filter(|port| port.may_be_xid()).collect()
}

/// Incremental decoder for XID response packets.
#[derive(Debug, Default)]
pub struct XidPacketDecoder {
    buffer: Vec<u8>,
}

impl XidPacketDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes and returns every complete event decoded so far.
    ///
    /// Bytes preceding a packet marker are dropped so the decoder resyncs
    /// after line noise.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ResponseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match self.buffer.iter().position(|&b| b == PACKET_MARKER) {
                Some(0) => {}
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    break;
                }
            }
            if self.buffer.len() < PACKET_LEN {
                break;
            }
            let packet: Vec<u8> = self.buffer.drain(..PACKET_LEN).collect();
            events.push(decode_packet(&packet));
        }

        events
    }

    /// Bytes waiting for the rest of their packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_packet(packet: &[u8]) -> ResponseEvent {
    let info = packet[1];
    ResponseEvent {
        key: (info & 0xE0) >> 5,
        port: info & 0x0F,
        pressed: info & 0x10 != 0,
        rt_ms: u32::from_le_bytes([packet[2], packet[3], packet[4], packet[5]]),
    }
}

#[cfg(feature = "instrument_serial")]
pub use device::{discover, XidResponsePad};

#[cfg(feature = "instrument_serial")]
mod device {
    use super::{
        parse_protocol_reply, xid_candidates, PortCandidate, XidMode, XidPacketDecoder,
        PROTOCOL_QUERY, PROTOCOL_REPLY_LEN, XID_MODE_COMMAND,
    };
    use crate::hardware::{ResponseEvent, ResponseQueue};
    use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(200);

    impl From<&SerialPortInfo> for PortCandidate {
        fn from(info: &SerialPortInfo) -> Self {
            match &info.port_type {
                SerialPortType::UsbPort(usb) => Self {
                    name: info.port_name.clone(),
                    usb_vid: Some(usb.vid),
                    manufacturer: usb.manufacturer.clone(),
                },
                _ => Self {
                    name: info.port_name.clone(),
                    usb_vid: None,
                    manufacturer: None,
                },
            }
        }
    }

    /// Opens every attached XID device, in enumeration order.
    ///
    /// Ports that do not look like Cedrus hardware are skipped, and the rest
    /// only count when they answer the protocol handshake.
    pub fn discover(baud_rate: u32) -> io::Result<Vec<XidResponsePad>> {
        let ports: Vec<PortCandidate> = serialport::available_ports()
            .map_err(io::Error::from)?
            .iter()
            .map(PortCandidate::from)
            .collect();
        let mut pads = Vec::new();
        for candidate in xid_candidates(&ports) {
            match XidResponsePad::open(&candidate.name, baud_rate) {
                Ok(pad) => pads.push(pad),
                Err(e) => debug!("Skipping '{}': {}", candidate.name, e),
            }
        }
        Ok(pads)
    }

    /// XID response pad attached to a serial port.
    pub struct XidResponsePad {
        port: Box<dyn SerialPort>,
        decoder: XidPacketDecoder,
        queue: VecDeque<ResponseEvent>,
    }

    impl XidResponsePad {
        /// Opens the pad on `path` at `baud_rate`.
        ///
        /// Fails with `InvalidData` if the device does not answer the XID
        /// handshake.
        pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
            let mut port = serialport::new(path, baud_rate)
                .timeout(HANDSHAKE_TIMEOUT)
                .open()
                .map_err(io::Error::from)?;

            match handshake(port.as_mut())? {
                Some(XidMode::Xid) => {}
                Some(XidMode::Other(mode)) => {
                    warn!(
                        "XID device on '{}' in mode '{}', switching to XID mode",
                        path, mode as char
                    );
                    port.write_all(XID_MODE_COMMAND)?;
                    port.flush()?;
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("device on '{}' did not answer the XID handshake", path),
                    ))
                }
            }

            port.set_timeout(Duration::ZERO).map_err(io::Error::from)?;
            port.clear(ClearBuffer::Input).map_err(io::Error::from)?;
            debug!("XID device opened on '{}' at {} baud", path, baud_rate);
            Ok(Self {
                port,
                decoder: XidPacketDecoder::new(),
                queue: VecDeque::new(),
            })
        }
    }

    fn handshake(port: &mut dyn SerialPort) -> io::Result<Option<XidMode>> {
        port.clear(ClearBuffer::Input).map_err(io::Error::from)?;
        port.write_all(PROTOCOL_QUERY)?;
        port.flush()?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut reply = Vec::with_capacity(PROTOCOL_REPLY_LEN);
        let mut chunk = [0u8; PROTOCOL_REPLY_LEN];
        while reply.len() < PROTOCOL_REPLY_LEN && Instant::now() < deadline {
            let wanted = PROTOCOL_REPLY_LEN - reply.len();
            match port.read(&mut chunk[..wanted]) {
                Ok(n) => reply.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }
        Ok(parse_protocol_reply(&reply))
    }

    impl ResponseQueue for XidResponsePad {
        fn poll_for_response(&mut self) -> io::Result<()> {
            let available = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
            if available == 0 {
                return Ok(());
            }
            let mut buffer = vec![0u8; available];
            let read = match self.port.read(&mut buffer) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => return Err(e),
            };
            self.queue.extend(self.decoder.feed(&buffer[..read]));
            Ok(())
        }

        fn pending(&self) -> usize {
            self.queue.len()
        }

        fn next_response(&mut self) -> Option<ResponseEvent> {
            self.queue.pop_front()
        }

        fn clear_response_queue(&mut self) {
            self.queue.clear();
        }

        fn describe(&self) -> String {
            format!(
                "Cedrus XID device on '{}'",
                self.port.name().unwrap_or_else(|| "<unnamed>".to_string())
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_press() {
        let mut decoder = XidPacketDecoder::new();
        // key 4 pressed on port 2, rt = 300 ms
        let info = (4 << 5) | 0x10 | 0x02;
        let events = decoder.feed(&[b'k', info, 0x2c, 0x01, 0x00, 0x00]);
        assert_eq!(
            events,
            vec![ResponseEvent {
                key: 4,
                port: 2,
                pressed: true,
                rt_ms: 300,
            }]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_packet_is_kept() {
        let mut decoder = XidPacketDecoder::new();
        assert!(decoder.feed(&[b'k', 0x80, 0x01]).is_empty());
        assert_eq!(decoder.buffered(), 3);
        let events = decoder.feed(&[0x00, 0x00, 0x00]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, 4);
        assert!(!events[0].pressed);
    }

    fn port(name: &str, usb_vid: Option<u16>, manufacturer: Option<&str>) -> PortCandidate {
        PortCandidate {
            name: name.to_string(),
            usb_vid,
            manufacturer: manufacturer.map(str::to_string),
        }
    }

    #[test]
    fn test_candidates_skip_builtin_and_foreign_ports() {
        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyACM0", Some(0x2341), Some("Arduino LLC")),
            port("/dev/ttyUSB0", Some(FTDI_VID), Some("FTDI")),
            port("/dev/ttyUSB1", Some(0x1234), Some("Cedrus Corporation")),
        ];
        let names: Vec<&str> = xid_candidates(&ports)
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_no_candidates_on_plain_serial() {
        let ports = vec![port("/dev/ttyS0", None, None), port("/dev/ttyS1", None, None)];
        assert!(xid_candidates(&ports).is_empty());
    }

    #[test]
    fn test_protocol_reply() {
        assert_eq!(parse_protocol_reply(b"_xid0"), Some(XidMode::Xid));
        assert_eq!(parse_protocol_reply(b"_xid1"), Some(XidMode::Other(b'1')));
        assert_eq!(parse_protocol_reply(b"_xi"), None);
        assert_eq!(parse_protocol_reply(b""), None);
        assert_eq!(parse_protocol_reply(b"OK\r\n"), None);
    }

    #[test]
    fn test_resync_after_noise() {
        let mut decoder = XidPacketDecoder::new();
        let events = decoder.feed(&[0xff, 0x00, b'k', 0x90, 0, 0, 0, 0, b'k', 0x80, 0, 0, 0, 0]);
        assert_eq!(events.len(), 2);
        assert!(events[0].pressed);
        assert!(!events[1].pressed);
    }
}
