//! Synthetic trigger for running paradigms without a scanner.
//!
//! Pulses are scheduled on the session clock every `interval` seconds,
//! starting from the moment the device is opened. A poll sleeps until shortly
//! before the next scheduled pulse and then spins for the remainder, so the
//! reported trigger times are accurate to well below a millisecond.

use crate::clock::SharedClock;
use crate::config::{parse_settings, positive_seconds};
use crate::error::TriggerResult;
use crate::registry::{BackendContext, BackendRegistry};
use crate::trigger::TriggerBackend;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Registry identifier.
pub const PORT_TYPE: &str = "dummy";

/// Part of the wait spent spinning instead of sleeping.
const SPIN_MARGIN: Duration = Duration::from_millis(200);

/// Settings of the dummy backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyConfig {
    /// Seconds between pulses, usually the scanner TR.
    #[serde(default = "default_interval", alias = "tr", alias = "TR")]
    pub interval: f64,
}

fn default_interval() -> f64 {
    1.0
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

/// Backend emitting a pulse every `interval` seconds.
pub struct DummyTrigger {
    interval: Duration,
    session_clock: SharedClock,
    next_pulse: Duration,
}

impl DummyTrigger {
    /// Creates a dummy trigger ticking on `session_clock`.
    pub fn new(config: DummyConfig, session_clock: SharedClock) -> TriggerResult<Self> {
        let interval = positive_seconds("interval", config.interval)?;
        let next_pulse = session_clock.now();
        Ok(Self {
            interval,
            session_clock,
            next_pulse,
        })
    }

    /// Builds the backend from a factory context.
    pub fn from_context(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        Self::new(parse_settings(ctx.config)?, ctx.session_clock)
    }

    /// Seconds between pulses.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn schedule_next(&mut self) -> Duration {
        let now = self.session_clock.now();
        // Fell behind by a whole period, or the session clock was reset.
        if now > self.next_pulse + self.interval || self.next_pulse > now + self.interval {
            self.next_pulse = now;
        }
        self.next_pulse += self.interval;
        self.next_pulse.saturating_sub(now)
    }
}

impl TriggerBackend for DummyTrigger {
    fn port_type(&self) -> &'static str {
        PORT_TYPE
    }

    fn describe(&self) -> String {
        format!("pulse every {:.3} s", self.interval.as_secs_f64())
    }

    fn settings(&self) -> serde_json::Value {
        json!({ "interval": self.interval.as_secs_f64() })
    }

    fn open(&mut self) -> TriggerResult<()> {
        self.next_pulse = self.session_clock.now();
        debug!("Dummy trigger anchored at {:.6}s", self.next_pulse.as_secs_f64());
        Ok(())
    }

    fn close(&mut self) -> TriggerResult<()> {
        Ok(())
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        let remaining = self.schedule_next();
        std::thread::sleep(remaining.saturating_sub(SPIN_MARGIN));
        while self.session_clock.now() < self.next_pulse {
            std::hint::spin_loop();
        }
        Ok(true)
    }
}

/// Adds the dummy backend to `registry`.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(PORT_TYPE, |ctx| {
        Ok(Box::new(DummyTrigger::from_context(ctx)?) as Box<dyn TriggerBackend>)
    });
}
