//! Trigger backend implementations
//!
//! Each module implements [`crate::trigger::TriggerBackend`] for one kind of
//! trigger channel and owns a typed settings struct deserialized from the
//! factory input table. [`register_builtin`] adds all of them to a registry.
//!
//! | Port type    | Module              | Signal                               |
//! |--------------|---------------------|--------------------------------------|
//! | `dummy`      | [`dummy`]           | synthetic pulse every `interval` s   |
//! | `serial`     | [`serial_adapter`]  | sync byte on a serial line           |
//! | `parallel`   | [`parallel`]        | level change on a parallel-port pin  |
//! | `keyboard`   | [`keyboard`]        | sync key press                       |
//! | `cedrus`     | [`response_pad`]    | sync key press on an XID pad         |
//! | `launchscan` | [`launch_scan`]     | launch helper, then keyboard         |

use crate::error::TriggerError;
use crate::hardware::PreopenedDevice;
use crate::registry::BackendRegistry;

pub mod dummy;
pub mod keyboard;
pub mod launch_scan;
pub mod parallel;
pub mod response_pad;
pub mod serial_adapter;

pub use dummy::DummyTrigger;
pub use keyboard::KeyboardTrigger;
pub use launch_scan::{LaunchScanTrigger, ScanLauncher, ScanMode, ScanProtocol, SyncKeyLauncher};
pub use parallel::{EdgePolarity, ParallelTrigger};
pub use response_pad::ResponsePadTrigger;
pub use serial_adapter::{SerialTrigger, SyncByte};

/// Registers every built-in backend.
pub fn register_builtin(registry: &mut BackendRegistry) {
    dummy::register(registry);
    serial_adapter::register(registry);
    parallel::register(registry);
    keyboard::register(registry);
    response_pad::register(registry);
    launch_scan::register(registry);
}

/// Rejects a pre-opened handle of the wrong kind.
fn mismatched_device(expected: &str, device: &PreopenedDevice) -> TriggerError {
    TriggerError::Configuration(format!(
        "a pre-opened {} device cannot drive a {} trigger",
        device.kind(),
        expected
    ))
}
