//! Key-press query capability.
//!
//! Keyboard state belongs to the windowing layer of the experiment, not to
//! this crate. The trigger protocol only needs to ask "which of these keys were
//! pressed since I last asked", which is what [`KeySource`] provides. The
//! [`KeyQueue`] implementation is a thread-safe buffer the embedding
//! application pushes key names into.

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A key press stamped against a reference clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPress {
    /// Key name, e.g. `"5"` or `"escape"`.
    pub key: String,
    /// Press time relative to the reference clock origin.
    pub time: Duration,
}

/// Source of buffered key presses.
pub trait KeySource: Send + Sync {
    /// Removes and returns every buffered press of one of `keys`, stamped
    /// against `clock`. Presses of other keys stay buffered.
    fn pressed_since(&self, keys: &[String], clock: &dyn Clock) -> Vec<KeyPress>;

    /// Injects a synthetic press. Returns `false` if the source cannot
    /// accept synthetic input.
    fn emulate_press(&self, _key: &str) -> bool {
        false
    }
}

/// Key source shared between the session, the device and any emulator.
pub type SharedKeySource = Arc<dyn KeySource>;

/// Buffered key presses fed by the application.
#[derive(Debug, Default)]
pub struct KeyQueue {
    events: Mutex<VecDeque<(String, Instant)>>,
}

impl KeyQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue already wrapped for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Records a press of `key` at the current instant.
    pub fn push(&self, key: impl Into<String>) {
        self.push_at(key, Instant::now());
    }

    /// Records a press of `key` at `at`.
    pub fn push_at(&self, key: impl Into<String>, at: Instant) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((key.into(), at));
    }

    /// Drops every buffered press.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of buffered presses.
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeySource for KeyQueue {
    fn pressed_since(&self, keys: &[String], clock: &dyn Clock) -> Vec<KeyPress> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pressed = Vec::new();
        events.retain(|(key, at)| {
            if keys.iter().any(|k| k == key) {
                pressed.push(KeyPress {
                    key: key.clone(),
                    time: clock.time_at(*at),
                });
                false
            } else {
                true
            }
        });
        pressed
    }

    fn emulate_press(&self, key: &str) -> bool {
        self.push(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pressed_since_drains_only_requested_keys() {
        let clock = MonotonicClock::new();
        let queue = KeyQueue::new();
        queue.push("5");
        queue.push("space");
        queue.push("5");

        let pressed = queue.pressed_since(&keys(&["5"]), &clock);
        assert_eq!(pressed.len(), 2);
        assert!(pressed.iter().all(|p| p.key == "5"));
        assert_eq!(queue.len(), 1);

        let again = queue.pressed_since(&keys(&["5"]), &clock);
        assert!(again.is_empty());
    }

    #[test]
    fn test_presses_are_stamped_against_clock() {
        let clock = MonotonicClock::new();
        let queue = KeyQueue::new();
        std::thread::sleep(Duration::from_millis(10));
        queue.push("t");

        let pressed = queue.pressed_since(&keys(&["t"]), &clock);
        assert_eq!(pressed.len(), 1);
        assert!(pressed[0].time >= Duration::from_millis(10));
        assert!(pressed[0].time <= clock.now());
    }

    #[test]
    fn test_emulate_press() {
        let clock = MonotonicClock::new();
        let queue = KeyQueue::new();
        assert!(queue.emulate_press("5"));
        assert_eq!(queue.pressed_since(&keys(&["5"]), &clock).len(), 1);
        assert!(queue.is_empty());
    }
}
