//! Scanner-emulation composite backend.
//!
//! A run starts by handing control to a [`ScanLauncher`], which returns once
//! the scan is running and its first sync pulse has been seen. That pulse is
//! trigger 0. Any further triggers the caller wants to skip are then read
//! from an owned keyboard backend listening for the sync key.
//!
//! The default launcher, [`SyncKeyLauncher`], has two modes:
//!
//! - **scan**: waits for the scanner to deliver the first sync key.
//! - **test**: starts a background emulator that injects the sync key every
//!   TR for the configured number of volumes, then waits for the first one.

use super::keyboard::{KeyboardTrigger, KeyboardTriggerConfig};
use crate::config::{parse_settings, positive_seconds};
use crate::error::{TriggerError, TriggerResult};
use crate::input::SharedKeySource;
use crate::registry::{BackendContext, BackendRegistry};
use crate::trigger::{protocol, TriggerBackend, TriggerCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Registry identifier.
pub const PORT_TYPE: &str = "launchscan";

const EMULATOR_TICK: Duration = Duration::from_millis(5);
const LAUNCH_POLL: Duration = Duration::from_millis(1);

// =============================================================================
// Settings
// =============================================================================

/// Where the sync pulses come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// A real scanner sends the sync key.
    #[default]
    #[serde(alias = "Scan")]
    Scan,
    /// Pulses are emulated in-process.
    #[serde(alias = "Test")]
    Test,
}

/// Scan protocol as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Repetition time in seconds.
    #[serde(default, rename = "TR", alias = "tr")]
    pub tr: Option<f64>,
    /// Number of volumes in the run.
    #[serde(default)]
    pub volumes: Option<u32>,
    /// Key the scanner sends on every volume.
    #[serde(default = "default_sync_key")]
    pub sync: String,
    /// Volumes acquired before the first sync pulse (dummy scans).
    #[serde(default)]
    pub skip: u32,
}

fn default_sync_key() -> String {
    "5".to_string()
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            tr: None,
            volumes: None,
            sync: default_sync_key(),
            skip: 0,
        }
    }
}

/// Settings of the composite backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchScanConfig {
    /// Scan protocol.
    #[serde(default)]
    pub settings: ScanSettings,
    /// Pulse source of the default launcher.
    #[serde(default)]
    pub mode: ScanMode,
    /// Seconds the default launcher waits for the first pulse; defaults to
    /// the device timeout.
    #[serde(default)]
    pub wait_timeout: Option<f64>,
}

/// Validated scan protocol handed to a launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanProtocol {
    /// Repetition time.
    pub tr: Duration,
    /// Number of volumes in the run.
    pub volumes: u32,
    /// Key the scanner sends on every volume.
    pub sync_key: String,
    /// Volumes acquired before the first sync pulse.
    pub skip: u32,
}

impl ScanProtocol {
    /// Validates `settings`; `TR` and `volumes` are mandatory.
    pub fn from_settings(settings: &ScanSettings) -> TriggerResult<Self> {
        let (Some(tr), Some(volumes)) = (settings.tr, settings.volumes) else {
            return Err(TriggerError::Configuration(
                "launchscan settings must define TR and volumes".to_string(),
            ));
        };
        let tr = positive_seconds("TR", tr)?;
        if volumes == 0 {
            return Err(TriggerError::Configuration(
                "launchscan volumes must be at least 1".to_string(),
            ));
        }
        if settings.sync.is_empty() {
            return Err(TriggerError::Configuration(
                "launchscan sync key cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            tr,
            volumes,
            sync_key: settings.sync.clone(),
            skip: settings.skip,
        })
    }
}

// =============================================================================
// Launchers
// =============================================================================

/// Starts a scan and returns once its first sync pulse has been seen.
pub trait ScanLauncher: Send {
    /// Launches the scan described by `protocol`. `core` provides the key
    /// source, session clock and abort key of the owning device.
    fn launch(&mut self, protocol: &ScanProtocol, core: &TriggerCore) -> TriggerResult<()>;

    /// Stops anything the launcher left running.
    fn stop(&mut self) {}
}

/// Default launcher waiting for the sync key, optionally emulating it.
pub struct SyncKeyLauncher {
    mode: ScanMode,
    wait_timeout: Option<Duration>,
    emulator: Option<PulseEmulator>,
}

impl SyncKeyLauncher {
    /// Creates a launcher. Without `wait_timeout` the device timeout applies.
    pub fn new(mode: ScanMode, wait_timeout: Option<Duration>) -> Self {
        Self {
            mode,
            wait_timeout,
            emulator: None,
        }
    }

    /// Pulse source.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    fn emulation_failed(&self) -> bool {
        self.emulator.as_ref().is_some_and(PulseEmulator::failed)
    }
}

impl ScanLauncher for SyncKeyLauncher {
    fn launch(&mut self, protocol: &ScanProtocol, core: &TriggerCore) -> TriggerResult<()> {
        self.stop();
        info!(
            mode = ?self.mode,
            tr_s = protocol.tr.as_secs_f64(),
            volumes = protocol.volumes,
            "Launching scan, waiting for sync key '{}'",
            protocol.sync_key
        );
        if self.mode == ScanMode::Test {
            self.emulator = Some(PulseEmulator::start(core.keys().clone(), protocol));
        }

        let esc_key = core.settings().esc_key.clone();
        let query = vec![protocol.sync_key.clone(), esc_key.clone()];
        let limit = self
            .wait_timeout
            .unwrap_or_else(|| core.settings().timeout_duration());
        let started = Instant::now();

        loop {
            let presses = core
                .keys()
                .pressed_since(&query, core.session_clock().as_ref());
            if presses.iter().any(|p| p.key == esc_key) {
                self.stop();
                return Err(TriggerError::Aborted);
            }
            if let Some(press) = presses.iter().find(|p| p.key == protocol.sync_key) {
                debug!("First sync pulse at {:.6}s", press.time.as_secs_f64());
                return Ok(());
            }
            if self.emulation_failed() {
                self.stop();
                return Err(TriggerError::Launch(
                    "key source cannot emulate sync key presses".to_string(),
                ));
            }
            if started.elapsed() >= limit {
                self.stop();
                return Err(TriggerError::Timeout(limit));
            }
            thread::sleep(LAUNCH_POLL);
        }
    }

    fn stop(&mut self) {
        if let Some(mut emulator) = self.emulator.take() {
            emulator.stop();
        }
    }
}

impl Drop for SyncKeyLauncher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background thread injecting the sync key every TR.
struct PulseEmulator {
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PulseEmulator {
    fn start(keys: SharedKeySource, protocol: &ScanProtocol) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let tr = protocol.tr;
        let volumes = protocol.volumes;
        let skip = protocol.skip;
        let sync_key = protocol.sync_key.clone();
        let thread_stop = stop.clone();
        let thread_failed = failed.clone();

        let handle = thread::spawn(move || {
            let origin = Instant::now();
            for volume in 0..volumes {
                let due = origin + tr * (skip + volume);
                loop {
                    if thread_stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let now = Instant::now();
                    if now >= due {
                        break;
                    }
                    thread::sleep((due - now).min(EMULATOR_TICK));
                }
                if !keys.emulate_press(&sync_key) {
                    warn!("Key source rejected emulated sync key");
                    thread_failed.store(true, Ordering::Relaxed);
                    return;
                }
                debug!(volume, "Emulated sync pulse");
            }
        });

        Self {
            stop,
            failed,
            handle: Some(handle),
        }
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Sync pulse emulator panicked");
            }
        }
    }
}

impl Drop for PulseEmulator {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Composite backend: launcher for trigger 0, keyboard for the rest.
pub struct LaunchScanTrigger {
    protocol: ScanProtocol,
    launcher: Box<dyn ScanLauncher>,
    keyboard: KeyboardTrigger,
    keyboard_core: TriggerCore,
}

impl LaunchScanTrigger {
    /// Builds the backend from a factory context.
    ///
    /// Uses the context's launcher if one is supplied, a [`SyncKeyLauncher`]
    /// otherwise.
    pub fn from_context(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        Self::build(ctx).map_err(|e| {
            error!("Could not initialize trigger LAUNCHSCAN: {}", e);
            e
        })
    }

    fn build(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        if let Some(device) = &ctx.device {
            return Err(super::mismatched_device(PORT_TYPE, device));
        }
        let config: LaunchScanConfig = parse_settings(ctx.config)?;
        let protocol = ScanProtocol::from_settings(&config.settings)?;
        let launcher = match ctx.launcher {
            Some(launcher) => launcher,
            None => {
                let wait_timeout = config
                    .wait_timeout
                    .map(|secs| positive_seconds("wait_timeout", secs))
                    .transpose()?;
                Box::new(SyncKeyLauncher::new(config.mode, wait_timeout))
            }
        };
        let keyboard = KeyboardTrigger::new(
            KeyboardTriggerConfig {
                keys: vec![protocol.sync_key.clone()],
            },
            &ctx.settings.esc_key,
            ctx.keys.clone(),
            ctx.session_clock.clone(),
        )?;
        let keyboard_core =
            TriggerCore::new(PORT_TYPE, ctx.settings.clone(), ctx.session_clock, ctx.keys);
        Ok(Self {
            protocol,
            launcher,
            keyboard,
            keyboard_core,
        })
    }

    /// Validated scan protocol.
    pub fn protocol(&self) -> &ScanProtocol {
        &self.protocol
    }
}

impl TriggerBackend for LaunchScanTrigger {
    fn port_type(&self) -> &'static str {
        PORT_TYPE
    }

    fn describe(&self) -> String {
        format!(
            "TR {:.3} s, {} volumes, sync key '{}'",
            self.protocol.tr.as_secs_f64(),
            self.protocol.volumes,
            self.protocol.sync_key
        )
    }

    fn settings(&self) -> serde_json::Value {
        json!({
            "TR": self.protocol.tr.as_secs_f64(),
            "volumes": self.protocol.volumes,
            "sync": self.protocol.sync_key,
            "skip": self.protocol.skip,
        })
    }

    fn open(&mut self) -> TriggerResult<()> {
        self.keyboard.open()
    }

    fn close(&mut self) -> TriggerResult<()> {
        self.launcher.stop();
        self.keyboard.close()
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        self.keyboard.poll_edge()
    }

    fn take_abort(&mut self) -> bool {
        self.keyboard.take_abort()
    }

    fn wait_for_trigger(&mut self, core: &mut TriggerCore, skip: u32) -> TriggerResult<bool> {
        self.launcher.launch(&self.protocol, core)?;
        core.record_edge();
        core.mark_first_trigger();

        if skip > 0 {
            self.keyboard_core.sync_count(core.trigger_count());
            protocol::wait_for_trigger(&mut self.keyboard, &mut self.keyboard_core, skip - 1)?;
            core.adopt(
                self.keyboard_core.trigger_count(),
                self.keyboard_core.last_trigger_time(),
            );
        }
        Ok(true)
    }
}

/// Adds the composite backend to `registry`.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(PORT_TYPE, |ctx| {
        Ok(Box::new(LaunchScanTrigger::from_context(ctx)?) as Box<dyn TriggerBackend>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::TriggerSettings;
    use crate::input::KeyQueue;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingLauncher {
        launches: Arc<Mutex<Vec<ScanProtocol>>>,
    }

    impl ScanLauncher for RecordingLauncher {
        fn launch(&mut self, protocol: &ScanProtocol, _core: &TriggerCore) -> TriggerResult<()> {
            self.launches.lock().expect("lock").push(protocol.clone());
            Ok(())
        }
    }

    fn table(text: &str) -> toml::Value {
        toml::from_str(text).expect("toml")
    }

    fn composite(
        config: &toml::Value,
        keys: Arc<KeyQueue>,
        launcher: Option<Box<dyn ScanLauncher>>,
    ) -> TriggerResult<(LaunchScanTrigger, TriggerCore)> {
        let settings = TriggerSettings::from_config(config)?;
        let clock = MonotonicClock::shared();
        let ctx = BackendContext {
            config,
            settings: &settings,
            session_clock: clock.clone(),
            keys: keys.clone(),
            device: None,
            launcher,
        };
        let trigger = LaunchScanTrigger::from_context(ctx)?;
        let core = TriggerCore::new(PORT_TYPE, settings, clock, keys);
        Ok((trigger, core))
    }

    #[test]
    fn test_protocol_requires_tr_and_volumes() {
        let result = composite(&table("[settings]\nvolumes = 10"), KeyQueue::shared(), None);
        assert!(matches!(result, Err(TriggerError::Configuration(_))));
        let result = composite(&table("[settings]\nTR = 2.0"), KeyQueue::shared(), None);
        assert!(matches!(result, Err(TriggerError::Configuration(_))));
    }

    #[test]
    fn test_settings_parse() {
        let config: LaunchScanConfig = parse_settings(&table(
            "mode = 'test'\nwait_timeout = 5.0\n[settings]\nTR = 2.0\nvolumes = 100\nsync = 't'",
        ))
        .expect("parse");
        assert_eq!(config.mode, ScanMode::Test);
        let protocol = ScanProtocol::from_settings(&config.settings).expect("protocol");
        assert_eq!(protocol.tr, Duration::from_secs(2));
        assert_eq!(protocol.volumes, 100);
        assert_eq!(protocol.sync_key, "t");
    }

    #[test]
    fn test_launch_counts_as_trigger_zero() {
        let launcher = RecordingLauncher::default();
        let (mut trigger, mut core) = composite(
            &table("[settings]\nTR = 1.0\nvolumes = 5"),
            KeyQueue::shared(),
            Some(Box::new(launcher.clone())),
        )
        .expect("composite");
        trigger.open().expect("open");
        assert!(trigger.wait_for_trigger(&mut core, 0).expect("wait"));
        assert_eq!(core.trigger_count(), 0);
        assert_eq!(core.first_trigger_time(), Some(core.last_trigger_time()));
        assert_eq!(launcher.launches.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_skip_is_read_from_keyboard() {
        let keys = KeyQueue::shared();
        let (mut trigger, mut core) = composite(
            &table("timeout = 5.0\n[settings]\nTR = 1.0\nvolumes = 5"),
            keys.clone(),
            Some(Box::new(RecordingLauncher::default())),
        )
        .expect("composite");
        trigger.open().expect("open");

        let pusher = {
            let keys = keys.clone();
            thread::spawn(move || {
                for _ in 0..2 {
                    thread::sleep(Duration::from_millis(20));
                    keys.push("5");
                }
            })
        };
        assert!(trigger.wait_for_trigger(&mut core, 2).expect("wait"));
        pusher.join().expect("pusher");

        assert_eq!(core.trigger_count(), 2);
        assert!(core.first_trigger_time() < Some(core.last_trigger_time()));
    }

    #[test]
    fn test_test_mode_emulates_pulses() {
        let keys = KeyQueue::shared();
        let config = table("timeout = 5.0\nmode = 'test'\n[settings]\nTR = 0.02\nvolumes = 4");
        let (mut trigger, mut core) = composite(&config, keys, None).expect("composite");
        trigger.open().expect("open");
        assert!(trigger.wait_for_trigger(&mut core, 3).expect("wait"));
        assert_eq!(core.trigger_count(), 3);
        trigger.close().expect("close");
    }

    #[test]
    fn test_scan_mode_times_out_without_pulse() {
        let config = table("wait_timeout = 0.05\n[settings]\nTR = 1.0\nvolumes = 5");
        let (mut trigger, mut core) =
            composite(&config, KeyQueue::shared(), None).expect("composite");
        let result = trigger.wait_for_trigger(&mut core, 0);
        assert!(matches!(result, Err(TriggerError::Timeout(_))));
        assert_eq!(core.trigger_count(), -1);
    }

    #[test]
    fn test_escape_aborts_launch() {
        let keys = KeyQueue::shared();
        keys.push("escape");
        let config = table("[settings]\nTR = 1.0\nvolumes = 5");
        let (mut trigger, mut core) = composite(&config, keys, None).expect("composite");
        assert!(matches!(
            trigger.wait_for_trigger(&mut core, 0),
            Err(TriggerError::Aborted)
        ));
    }
}
