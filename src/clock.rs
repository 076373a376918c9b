//! Monotonic clocks used to timestamp triggers.
//!
//! The session clock is owned by the experiment script and shared with the
//! trigger device by reference. The device only ever reads it; resetting it is
//! the caller's way of moving the time origin of every reported timestamp.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A monotonic clock with a resettable origin.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock origin.
    fn now(&self) -> Duration;

    /// Moves the origin to the current instant.
    fn reset(&self);

    /// Time of `instant` relative to the clock origin, saturating at zero for
    /// instants that precede it.
    fn time_at(&self, instant: Instant) -> Duration;
}

/// Clock shared between the session and its trigger device.
pub type SharedClock = Arc<dyn Clock>;

/// [`Clock`] backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Mutex<Instant>,
}

impl MonotonicClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Mutex::new(Instant::now()),
        }
    }

    /// Creates a clock already wrapped for sharing.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }

    fn origin(&self) -> Instant {
        *self.origin.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin().elapsed()
    }

    fn reset(&self) {
        *self.origin.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn time_at(&self, instant: Instant) -> Duration {
        instant.saturating_duration_since(self.origin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now();
        assert!(b > a);
        assert!(b >= Duration::from_millis(5));
    }

    #[test]
    fn test_reset_moves_origin() {
        let clock = MonotonicClock::new();
        std::thread::sleep(Duration::from_millis(20));
        clock.reset();
        assert!(clock.now() < Duration::from_millis(20));
    }

    #[test]
    fn test_time_at_before_origin_saturates() {
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let clock = MonotonicClock::new();
        assert_eq!(clock.time_at(before), Duration::ZERO);
    }
}
