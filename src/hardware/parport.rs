//! Parallel port pin reads.
//!
//! On Linux the port is accessed through the `ppdev` driver (`/dev/parportN`):
//! the port is claimed once, then the status and data registers are read with
//! `PPRSTATUS`/`PPRDATA` ioctls. Other platforms report the port as
//! unsupported.
//!
//! Pin map (DB-25): data pins 2–9 read the data register; status pins 10
//! (ACK), 11 (BUSY, hardware-inverted), 12 (PAPER OUT), 13 (SELECT) and
//! 15 (ERROR) read the status register.

use super::PinSource;
use std::io;

/// Status register bit for a status pin, with its hardware inversion.
pub fn status_bit(pin: u8) -> Option<(u8, bool)> {
    match pin {
        10 => Some((6, false)),
        11 => Some((7, true)),
        12 => Some((5, false)),
        13 => Some((4, false)),
        15 => Some((3, false)),
        _ => None,
    }
}

/// Pin level encoded in a register value.
pub fn decode_pin(pin: u8, status: u8, data: u8) -> io::Result<bool> {
    if let Some((bit, inverted)) = status_bit(pin) {
        let level = (status >> bit) & 1 == 1;
        return Ok(level != inverted);
    }
    if (2..=9).contains(&pin) {
        return Ok((data >> (pin - 2)) & 1 == 1);
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("pin {} is not a readable parallel port pin", pin),
    ))
}

#[cfg(target_os = "linux")]
mod imp {
    #![allow(unsafe_code)]

    use super::decode_pin;
    use crate::hardware::PinSource;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use tracing::debug;

    // <linux/ppdev.h>
    const PPCLAIM: libc::c_ulong = 0x0000_708b;
    const PPRELEASE: libc::c_ulong = 0x0000_708c;
    const PPRSTATUS: libc::c_ulong = 0x8001_7081;
    const PPRDATA: libc::c_ulong = 0x8001_7085;

    /// Claimed `/dev/parportN` device.
    pub struct ParallelPort {
        file: File,
        path: String,
    }

    impl ParallelPort {
        /// Opens and claims the device at `path`.
        pub fn open(path: &str) -> io::Result<Self> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            // SAFETY: PPCLAIM takes no argument and the descriptor is valid.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), PPCLAIM as _) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            debug!("Claimed parallel port '{}'", path);
            Ok(Self {
                file,
                path: path.to_string(),
            })
        }

        fn read_register(&self, request: libc::c_ulong) -> io::Result<u8> {
            let mut value: libc::c_uchar = 0;
            // SAFETY: the request writes exactly one byte into `value`.
            let rc = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    request as _,
                    &mut value as *mut libc::c_uchar,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(value)
        }
    }

    impl PinSource for ParallelPort {
        fn read_pin(&mut self, pin: u8) -> io::Result<bool> {
            let status = self.read_register(PPRSTATUS)?;
            let data = if (2..=9).contains(&pin) {
                self.read_register(PPRDATA)?
            } else {
                0
            };
            decode_pin(pin, status, data)
        }

        fn describe(&self) -> String {
            format!("parallel port '{}'", self.path)
        }
    }

    impl Drop for ParallelPort {
        fn drop(&mut self) {
            // SAFETY: releasing a claimed port; failure is harmless on close.
            unsafe {
                libc::ioctl(self.file.as_raw_fd(), PPRELEASE as _);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use crate::hardware::PinSource;
    use std::io;

    /// Placeholder: direct parallel port access is only implemented on Linux.
    pub struct ParallelPort;

    impl ParallelPort {
        /// Always fails on this platform.
        pub fn open(path: &str) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("parallel port '{}' requires Linux ppdev", path),
            ))
        }
    }

    impl PinSource for ParallelPort {
        fn read_pin(&mut self, _pin: u8) -> io::Result<bool> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }
}

pub use imp::ParallelPort;

/// Opens the parallel port at `address` as a boxed [`PinSource`].
pub fn open_pin_source(address: &str) -> io::Result<Box<dyn PinSource>> {
    Ok(Box::new(ParallelPort::open(address)?))
}
