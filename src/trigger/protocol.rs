//! The trigger-detection protocol.
//!
//! A blocking wait is a cooperative polling loop. Every iteration observes
//! exactly one [`WaitEvent`], in this order:
//!
//! 1. the abort key (checked before touching the backend),
//! 2. one backend poll,
//! 3. the timeout clock, when the poll saw nothing.
//!
//! [`WaitMachine::step`] turns that observation into the next [`WaitState`].
//! The timeout only applies until the first edge of the call has been
//! accepted; once triggering has started, the gap between edges is the
//! caller's business.

use super::{TriggerBackend, TriggerCore};
use crate::error::{TriggerError, TriggerResult};
use std::time::Duration;
use tracing::warn;

/// Progress of a single wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Created, nothing observed yet.
    Idle,
    /// Waiting for (more) edges.
    Polling,
    /// The edge completing the wait was accepted.
    Triggered,
    /// No edge arrived within the timeout.
    TimedOut,
    /// The abort key was pressed.
    Aborted,
}

impl WaitState {
    /// Returns `true` for states that end the wait call.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WaitState::Triggered | WaitState::TimedOut | WaitState::Aborted
        )
    }
}

/// One observation of the wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The abort key was seen.
    AbortPressed,
    /// The backend reported an accepted edge.
    Edge,
    /// Nothing happened; `elapsed` is the time since the wait began.
    NoEdge {
        /// Time on the timeout clock.
        elapsed: Duration,
    },
}

/// Transition function of a single wait call.
#[derive(Debug, Clone)]
pub struct WaitMachine {
    state: WaitState,
    remaining_skip: u32,
    edges_accepted: u32,
    timeout: Duration,
}

impl WaitMachine {
    /// Starts a wait that completes on the `(skip + 1)`-th edge.
    pub fn new(skip: u32, timeout: Duration) -> Self {
        Self {
            state: WaitState::Idle,
            remaining_skip: skip,
            edges_accepted: 0,
            timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Edges accepted since the wait began.
    pub fn edges_accepted(&self) -> u32 {
        self.edges_accepted
    }

    /// Applies one observation. Terminal states absorb further events.
    pub fn step(&mut self, event: WaitEvent) -> WaitState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.state = match event {
            WaitEvent::AbortPressed => WaitState::Aborted,
            WaitEvent::Edge => {
                self.edges_accepted += 1;
                if self.remaining_skip == 0 {
                    WaitState::Triggered
                } else {
                    self.remaining_skip -= 1;
                    WaitState::Polling
                }
            }
            WaitEvent::NoEdge { elapsed } => {
                if self.edges_accepted == 0 && elapsed > self.timeout {
                    WaitState::TimedOut
                } else {
                    WaitState::Polling
                }
            }
        };
        self.state
    }
}

/// Polls the backend once and records an accepted edge on the core.
pub fn poll_once<B>(backend: &mut B, core: &mut TriggerCore) -> TriggerResult<bool>
where
    B: TriggerBackend + ?Sized,
{
    if backend.poll_edge()? {
        core.record_edge();
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Blocks until the `(skip + 1)`-th edge, then fixes the first trigger time.
///
/// # Errors
///
/// - [`TriggerError::Aborted`] when the abort key is seen.
/// - [`TriggerError::Timeout`] when no edge was accepted within the timeout.
/// - Any backend read error, unchanged.
pub fn wait_for_trigger<B>(
    backend: &mut B,
    core: &mut TriggerCore,
    skip: u32,
) -> TriggerResult<bool>
where
    B: TriggerBackend + ?Sized,
{
    let machine = WaitMachine::new(skip, core.settings().timeout_duration());
    run_wait(backend, core, machine)
}

/// Blocks until any single edge, with the same abort and timeout rules.
pub fn wait_for_trigger_gated<B>(backend: &mut B, core: &mut TriggerCore) -> TriggerResult<bool>
where
    B: TriggerBackend + ?Sized,
{
    let machine = WaitMachine::new(0, core.settings().timeout_duration());
    run_wait(backend, core, machine)
}

fn run_wait<B>(
    backend: &mut B,
    core: &mut TriggerCore,
    mut machine: WaitMachine,
) -> TriggerResult<bool>
where
    B: TriggerBackend + ?Sized,
{
    core.restart_timeout();
    let pause = core.settings().poll_interval();

    loop {
        let event = if core.abort_requested() || backend.take_abort() {
            WaitEvent::AbortPressed
        } else if poll_once(backend, core)? {
            WaitEvent::Edge
        } else {
            WaitEvent::NoEdge {
                elapsed: core.timeout_elapsed(),
            }
        };

        match machine.step(event) {
            WaitState::Triggered => {
                core.mark_first_trigger();
                return Ok(true);
            }
            WaitState::TimedOut => {
                let timeout = core.settings().timeout_duration();
                warn!(
                    port_type = core.port_type(),
                    "Waiting for trigger timed out after {:?}", timeout
                );
                return Err(TriggerError::Timeout(timeout));
            }
            WaitState::Aborted => {
                warn!(port_type = core.port_type(), "Experiment aborted by the user");
                return Err(TriggerError::Aborted);
            }
            WaitState::Idle | WaitState::Polling => cooperative_pause(pause),
        }
    }
}

fn cooperative_pause(pause: Duration) {
    if pause.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(pause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MonotonicClock};
    use crate::config::TriggerSettings;
    use crate::input::KeyQueue;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tracing_test::traced_test;

    /// Backend reporting a scripted sequence of polls, then silence.
    struct ScriptedBackend {
        polls: VecDeque<bool>,
        abort_after: Option<usize>,
        calls: usize,
    }

    impl ScriptedBackend {
        fn new(polls: &[bool]) -> Self {
            Self {
                polls: polls.iter().copied().collect(),
                abort_after: None,
                calls: 0,
            }
        }
    }

    impl TriggerBackend for ScriptedBackend {
        fn port_type(&self) -> &'static str {
            "scripted"
        }

        fn open(&mut self) -> TriggerResult<()> {
            Ok(())
        }

        fn close(&mut self) -> TriggerResult<()> {
            Ok(())
        }

        fn poll_edge(&mut self) -> TriggerResult<bool> {
            self.calls += 1;
            Ok(self.polls.pop_front().unwrap_or(false))
        }

        fn take_abort(&mut self) -> bool {
            self.abort_after.is_some_and(|n| self.calls >= n)
        }
    }

    fn core_with(timeout: f64) -> (TriggerCore, Arc<KeyQueue>) {
        let keys = KeyQueue::shared();
        let mut table = toml::Table::new();
        table.insert("timeout".to_string(), toml::Value::Float(timeout));
        let settings =
            TriggerSettings::from_config(&toml::Value::Table(table)).expect("valid settings");
        let core = TriggerCore::new("scripted", settings, MonotonicClock::shared(), keys.clone());
        (core, keys)
    }

    #[test]
    fn test_machine_skip_counts_edges() {
        let mut machine = WaitMachine::new(2, Duration::from_secs(1));
        assert_eq!(machine.state(), WaitState::Idle);
        assert_eq!(machine.step(WaitEvent::Edge), WaitState::Polling);
        assert_eq!(machine.step(WaitEvent::Edge), WaitState::Polling);
        assert_eq!(machine.step(WaitEvent::Edge), WaitState::Triggered);
        assert_eq!(machine.edges_accepted(), 3);
    }

    #[test]
    fn test_machine_timeout_only_before_first_edge() {
        let mut machine = WaitMachine::new(1, Duration::from_millis(100));
        let late = WaitEvent::NoEdge {
            elapsed: Duration::from_millis(150),
        };
        let early = WaitEvent::NoEdge {
            elapsed: Duration::from_millis(50),
        };
        assert_eq!(machine.step(early), WaitState::Polling);
        assert_eq!(machine.step(WaitEvent::Edge), WaitState::Polling);
        // Triggering has started: a long gap is not a timeout
        assert_eq!(machine.step(late), WaitState::Polling);

        let mut fresh = WaitMachine::new(0, Duration::from_millis(100));
        assert_eq!(fresh.step(late), WaitState::TimedOut);
    }

    #[test]
    fn test_machine_terminal_states_absorb() {
        let mut machine = WaitMachine::new(0, Duration::from_secs(1));
        assert_eq!(machine.step(WaitEvent::AbortPressed), WaitState::Aborted);
        assert_eq!(machine.step(WaitEvent::Edge), WaitState::Aborted);
        assert_eq!(machine.edges_accepted(), 0);
    }

    #[test]
    fn test_poll_once_without_edge_keeps_count() {
        let (mut core, _keys) = core_with(1.0);
        let mut backend = ScriptedBackend::new(&[false, false]);
        assert!(!poll_once(&mut backend, &mut core).expect("poll"));
        assert!(!poll_once(&mut backend, &mut core).expect("poll"));
        assert_eq!(core.trigger_count(), -1);
    }

    #[test]
    #[traced_test]
    fn test_poll_once_logs_trigger() {
        let (mut core, _keys) = core_with(1.0);
        let mut backend = ScriptedBackend::new(&[true]);
        assert!(poll_once(&mut backend, &mut core).expect("poll"));
        assert_eq!(core.trigger_count(), 0);
        assert!(core.last_trigger_time() <= core.session_clock().now());
        assert!(logs_contain("TRIGGER"));
        assert!(logs_contain("count=0"));
    }

    #[test]
    fn test_wait_with_skip_sets_first_trigger_at_last_edge() {
        let (mut core, _keys) = core_with(1.0);
        let mut backend = ScriptedBackend::new(&[false, true, false, true, true, true]);
        assert!(wait_for_trigger(&mut backend, &mut core, 2).expect("wait"));
        assert_eq!(core.trigger_count(), 2);
        assert_eq!(core.first_trigger_time(), Some(core.last_trigger_time()));
        // The fourth scripted edge is left for the next call
        assert_eq!(backend.polls.len(), 1);
    }

    #[test]
    fn test_first_trigger_time_is_set_once() {
        let (mut core, _keys) = core_with(1.0);
        let mut backend = ScriptedBackend::new(&[true, false, true]);
        wait_for_trigger(&mut backend, &mut core, 0).expect("first wait");
        let origin = core.first_trigger_time();
        std::thread::sleep(Duration::from_millis(2));
        wait_for_trigger_gated(&mut backend, &mut core).expect("second wait");
        assert_eq!(core.trigger_count(), 1);
        assert_eq!(core.first_trigger_time(), origin);
        assert!(core.last_trigger_time() > origin.unwrap_or_default());
    }

    #[test]
    fn test_wait_times_out() {
        let (mut core, _keys) = core_with(0.05);
        let mut backend = ScriptedBackend::new(&[]);
        let start = std::time::Instant::now();
        let err = wait_for_trigger(&mut backend, &mut core, 0).unwrap_err();
        assert!(matches!(err, TriggerError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(core.trigger_count(), -1);
    }

    #[test]
    fn test_abort_key_before_edge() {
        let (mut core, keys) = core_with(5.0);
        keys.push("escape");
        let mut backend = ScriptedBackend::new(&[true]);
        let err = wait_for_trigger(&mut backend, &mut core, 0).unwrap_err();
        assert!(matches!(err, TriggerError::Aborted));
        assert_eq!(core.trigger_count(), -1);
        assert_eq!(backend.calls, 0);
    }

    #[test]
    fn test_backend_reported_abort() {
        let (mut core, _keys) = core_with(5.0);
        let mut backend = ScriptedBackend::new(&[false, true]);
        backend.abort_after = Some(1);
        let err = wait_for_trigger(&mut backend, &mut core, 3).unwrap_err();
        assert!(matches!(err, TriggerError::Aborted));
        assert_eq!(core.trigger_count(), -1);
    }
}
