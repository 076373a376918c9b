//! Trigger devices: shared state plus a pluggable backend.
//!
//! A [`TriggerDevice`] is the composition of two parts:
//!
//! - [`TriggerCore`]: counters, timestamps, the timeout clock and the abort
//!   configuration. It is identical for every backend.
//! - a [`TriggerBackend`]: the capability contract (`open`, `close`,
//!   `poll_edge`) of one physical or logical trigger channel.
//!
//! The wait algorithm itself lives in [`protocol`] as free functions over the
//! backend trait. Backends that need a different wait (response pad queue
//! flushing, the scanner-emulation composite) override the trait's wait hooks
//! and usually still call back into [`protocol`].
//!
//! # Data Flow
//!
//! ```text
//! registry::create --> TriggerDevice { core, backend }
//!                         |  open()
//!                         |  poll_once() / wait_for_trigger(skip)
//!                         |  close()
//! ```

use crate::clock::{Clock, MonotonicClock, SharedClock};
use crate::config::TriggerSettings;
use crate::error::{TriggerError, TriggerResult};
use crate::input::SharedKeySource;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod protocol;

pub use protocol::{WaitEvent, WaitMachine, WaitState};

/// Capability contract every trigger channel implements.
///
/// `poll_edge` must return promptly: it is called in a tight loop and the
/// abort key is only checked between calls.
pub trait TriggerBackend: Send {
    /// Lowercase registry identifier of this backend.
    fn port_type(&self) -> &'static str;

    /// Human-readable description of the configured channel.
    fn describe(&self) -> String {
        self.port_type().to_string()
    }

    /// Effective backend settings, for logs and diagnostics.
    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Acquires the physical or logical resource.
    fn open(&mut self) -> TriggerResult<()>;

    /// Releases the resource.
    fn close(&mut self) -> TriggerResult<()>;

    /// Returns whether a new qualifying edge occurred since the last poll.
    fn poll_edge(&mut self) -> TriggerResult<bool>;

    /// Returns `true` once if the backend itself observed the abort key.
    fn take_abort(&mut self) -> bool {
        false
    }

    /// Blocking wait honouring `skip`; see [`protocol::wait_for_trigger`].
    fn wait_for_trigger(&mut self, core: &mut TriggerCore, skip: u32) -> TriggerResult<bool> {
        protocol::wait_for_trigger(self, core, skip)
    }

    /// Blocking wait for any single edge; see [`protocol::wait_for_trigger_gated`].
    fn wait_for_trigger_gated(&mut self, core: &mut TriggerCore) -> TriggerResult<bool> {
        protocol::wait_for_trigger_gated(self, core)
    }
}

/// Counters, timestamps and wait configuration shared by all backends.
pub struct TriggerCore {
    port_type: &'static str,
    settings: TriggerSettings,
    session_clock: SharedClock,
    keys: SharedKeySource,
    abort_keys: Vec<String>,
    timeout_clock: MonotonicClock,
    trigger_count: i64,
    first_trigger_time: Option<Duration>,
    last_trigger_time: Duration,
}

impl TriggerCore {
    /// Creates the state for a fresh device; the trigger count starts at -1.
    pub fn new(
        port_type: &'static str,
        settings: TriggerSettings,
        session_clock: SharedClock,
        keys: SharedKeySource,
    ) -> Self {
        let last_trigger_time = session_clock.now();
        let abort_keys = vec![settings.esc_key.clone()];
        Self {
            port_type,
            settings,
            session_clock,
            keys,
            abort_keys,
            timeout_clock: MonotonicClock::new(),
            trigger_count: -1,
            first_trigger_time: None,
            last_trigger_time,
        }
    }

    /// Backend identifier used in log records.
    pub fn port_type(&self) -> &'static str {
        self.port_type
    }

    /// Settings fixed at construction.
    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    /// The externally owned session clock.
    pub fn session_clock(&self) -> &SharedClock {
        &self.session_clock
    }

    /// The key-press source used for abort detection.
    pub fn keys(&self) -> &SharedKeySource {
        &self.keys
    }

    /// Index of the last accepted trigger; -1 before the first.
    pub fn trigger_count(&self) -> i64 {
        self.trigger_count
    }

    /// Session time of the last accepted trigger.
    pub fn last_trigger_time(&self) -> Duration {
        self.last_trigger_time
    }

    /// Session time of the trigger that completed the first successful wait.
    pub fn first_trigger_time(&self) -> Option<Duration> {
        self.first_trigger_time
    }

    /// Returns `true` if the abort key was pressed since the last check.
    pub fn abort_requested(&self) -> bool {
        !self
            .keys
            .pressed_since(&self.abort_keys, self.session_clock.as_ref())
            .is_empty()
    }

    /// Counts an accepted edge, stamps it with the session clock and logs it.
    pub fn record_edge(&mut self) {
        let now = self.session_clock.now();
        self.record_edge_at(now);
    }

    /// Counts an accepted edge observed at `time` and logs it.
    pub fn record_edge_at(&mut self, time: Duration) {
        self.trigger_count += 1;
        self.last_trigger_time = time;
        let secs = time.as_secs_f64();
        info!(
            port_type = self.port_type,
            count = self.trigger_count,
            time_s = secs,
            "TRIGGER\t{}\t{:.6}",
            self.trigger_count,
            secs
        );
    }

    /// Fixes the time origin at the last accepted trigger, unless already set.
    pub fn mark_first_trigger(&mut self) {
        if self.first_trigger_time.is_none() {
            self.first_trigger_time = Some(self.last_trigger_time);
            debug!(
                port_type = self.port_type,
                count = self.trigger_count,
                "First trigger at {:.6}s",
                self.last_trigger_time.as_secs_f64()
            );
        }
    }

    /// Takes over the counter and timestamp of a delegate device.
    pub fn adopt(&mut self, trigger_count: i64, last_trigger_time: Duration) {
        self.trigger_count = self.trigger_count.max(trigger_count);
        self.last_trigger_time = last_trigger_time;
    }

    /// Aligns the counter with an owning device before delegating a wait.
    pub fn sync_count(&mut self, trigger_count: i64) {
        self.trigger_count = trigger_count;
    }

    pub(crate) fn restart_timeout(&self) {
        self.timeout_clock.reset();
    }

    pub(crate) fn timeout_elapsed(&self) -> Duration {
        self.timeout_clock.now()
    }
}

impl fmt::Debug for TriggerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerCore")
            .field("port_type", &self.port_type)
            .field("settings", &self.settings)
            .field("trigger_count", &self.trigger_count)
            .field("first_trigger_time", &self.first_trigger_time)
            .field("last_trigger_time", &self.last_trigger_time)
            .finish()
    }
}

/// A trigger channel ready to be opened and waited on.
pub struct TriggerDevice {
    backend: Box<dyn TriggerBackend>,
    core: TriggerCore,
    is_open: bool,
}

impl TriggerDevice {
    /// Wraps `backend` with fresh trigger state.
    pub fn new(
        backend: Box<dyn TriggerBackend>,
        settings: TriggerSettings,
        session_clock: SharedClock,
        keys: SharedKeySource,
    ) -> Self {
        let core = TriggerCore::new(backend.port_type(), settings, session_clock, keys);
        info!(
            "Created trigger {}: {}",
            backend.port_type().to_uppercase(),
            backend.describe()
        );
        Self {
            backend,
            core,
            is_open: false,
        }
    }

    /// Lowercase identifier of the backend.
    pub fn port_type(&self) -> &'static str {
        self.backend.port_type()
    }

    /// Human-readable description of the backend.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.port_type(), self.backend.describe())
    }

    /// Effective backend settings as JSON.
    pub fn backend_settings(&self) -> serde_json::Value {
        self.backend.settings()
    }

    /// Returns `true` between a successful `open()` and `close()`.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Trigger state.
    pub fn core(&self) -> &TriggerCore {
        &self.core
    }

    /// Index of the last accepted trigger; -1 before the first.
    pub fn trigger_count(&self) -> i64 {
        self.core.trigger_count()
    }

    /// Session time of the last accepted trigger.
    pub fn last_trigger_time(&self) -> Duration {
        self.core.last_trigger_time()
    }

    /// Session time of the trigger that defines the experiment origin.
    pub fn first_trigger_time(&self) -> Option<Duration> {
        self.core.first_trigger_time()
    }

    /// Acquires the backend resource. Opening twice is a no-op.
    pub fn open(&mut self) -> TriggerResult<()> {
        if self.is_open {
            return Ok(());
        }
        if let Err(e) = self.backend.open() {
            error!(port_type = self.port_type(), "Could not open trigger: {}", e);
            return Err(e);
        }
        self.is_open = true;
        info!("Initialized trigger {}", self.port_type());
        Ok(())
    }

    /// Releases the backend resource.
    pub fn close(&mut self) -> TriggerResult<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        self.backend.close()?;
        info!("Closed trigger {}", self.port_type());
        Ok(())
    }

    /// Non-blocking check for a new trigger edge.
    pub fn poll_once(&mut self) -> TriggerResult<bool> {
        self.ensure_open()?;
        protocol::poll_once(self.backend.as_mut(), &mut self.core)
    }

    /// Blocks until the `(skip + 1)`-th trigger edge of this call.
    ///
    /// Returns `Ok(true)` on success; a timeout or abort is always an error.
    pub fn wait_for_trigger(&mut self, skip: u32) -> TriggerResult<bool> {
        self.ensure_open()?;
        info!(port_type = self.port_type(), skip, "Wait for trigger ...");
        self.backend.wait_for_trigger(&mut self.core, skip)
    }

    /// Blocks until any single trigger edge.
    pub fn wait_for_trigger_gated(&mut self) -> TriggerResult<bool> {
        self.ensure_open()?;
        self.backend.wait_for_trigger_gated(&mut self.core)
    }

    fn ensure_open(&self) -> TriggerResult<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(TriggerError::PortNotOpen)
        }
    }
}

impl fmt::Debug for TriggerDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerDevice")
            .field("backend", &self.describe())
            .field("is_open", &self.is_open)
            .field("core", &self.core)
            .finish()
    }
}

impl Drop for TriggerDevice {
    fn drop(&mut self) {
        if self.is_open {
            if let Err(e) = self.close() {
                warn!("Failed to close trigger {}: {}", self.port_type(), e);
            }
        }
    }
}
