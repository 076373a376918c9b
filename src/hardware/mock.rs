//! Mock signal sources
//!
//! Provides scripted stand-ins for trigger hardware so the protocol can be
//! exercised without a scanner attached. Every mock hands out a cloneable
//! handle: the test keeps one clone to inject signals while the backend owns
//! the other.
//!
//! # Available Mocks
//!
//! - `MockByteSource` - serial line delivering queued bytes
//! - `MockPinSource` - parallel pin following a scripted level sequence
//! - `MockResponseQueue` - response pad with device-side pending events

use super::{ByteSource, PinSource, ResponseEvent, ResponseQueue};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockByteSource - Simulated serial line
// =============================================================================

/// Serial line that yields bytes pushed by the test.
#[derive(Clone, Default)]
pub struct MockByteSource {
    bytes: Arc<Mutex<VecDeque<u8>>>,
    fail_reads: Arc<Mutex<bool>>,
}

impl MockByteSource {
    /// Creates an empty line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `bytes` for reading.
    pub fn push(&self, bytes: &[u8]) {
        lock(&self.bytes).extend(bytes.iter().copied());
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        lock(&self.bytes).len()
    }

    /// Makes every following read fail with a broken-pipe error.
    pub fn fail_reads(&self) {
        *lock(&self.fail_reads) = true;
    }
}

impl ByteSource for MockByteSource {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if *lock(&self.fail_reads) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock line unplugged"));
        }
        Ok(lock(&self.bytes).pop_front())
    }

    fn describe(&self) -> String {
        "mock serial line".to_string()
    }
}

// =============================================================================
// MockPinSource - Simulated parallel pin
// =============================================================================

/// Pin whose level follows a scripted sequence, one level per read.
///
/// Once the script is exhausted the last level is held.
#[derive(Clone, Default)]
pub struct MockPinSource {
    levels: Arc<Mutex<VecDeque<bool>>>,
    current: Arc<Mutex<bool>>,
    reads: Arc<Mutex<Vec<u8>>>,
}

impl MockPinSource {
    /// Creates a pin resting low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends levels to the script.
    pub fn script(&self, levels: &[bool]) {
        lock(&self.levels).extend(levels.iter().copied());
    }

    /// Pins that were read, in order.
    pub fn reads(&self) -> Vec<u8> {
        lock(&self.reads).clone()
    }
}

impl PinSource for MockPinSource {
    fn read_pin(&mut self, pin: u8) -> io::Result<bool> {
        lock(&self.reads).push(pin);
        let mut current = lock(&self.current);
        if let Some(level) = lock(&self.levels).pop_front() {
            *current = level;
        }
        Ok(*current)
    }

    fn describe(&self) -> String {
        "mock parallel port".to_string()
    }
}

// =============================================================================
// MockResponseQueue - Simulated response pad
// =============================================================================

/// Response pad whose device-side events are injected by the test.
///
/// Injected events only become visible after `poll_for_response`, as with a
/// real pad.
#[derive(Clone, Default)]
pub struct MockResponseQueue {
    device: Arc<Mutex<VecDeque<ResponseEvent>>>,
    queue: Arc<Mutex<VecDeque<ResponseEvent>>>,
}

impl MockResponseQueue {
    /// Creates a pad with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the pad report `event` on its next poll.
    pub fn inject(&self, event: ResponseEvent) {
        lock(&self.device).push_back(event);
    }

    /// Injects a press of `key` on port 0.
    pub fn press(&self, key: u8) {
        self.inject(ResponseEvent {
            key,
            port: 0,
            pressed: true,
            rt_ms: 0,
        });
    }

    /// Injects a release of `key` on port 0.
    pub fn release(&self, key: u8) {
        self.inject(ResponseEvent {
            key,
            port: 0,
            pressed: false,
            rt_ms: 0,
        });
    }

    /// Events still pending on the device or in the queue.
    pub fn outstanding(&self) -> usize {
        lock(&self.device).len() + lock(&self.queue).len()
    }
}

impl ResponseQueue for MockResponseQueue {
    fn poll_for_response(&mut self) -> io::Result<()> {
        let mut device = lock(&self.device);
        lock(&self.queue).extend(device.drain(..));
        Ok(())
    }

    fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    fn next_response(&mut self) -> Option<ResponseEvent> {
        lock(&self.queue).pop_front()
    }

    fn clear_response_queue(&mut self) {
        lock(&self.queue).clear();
    }

    fn describe(&self) -> String {
        "mock response pad".to_string()
    }
}
