//! Core library for the scanner_trigger application.
//!
//! This library synchronizes experiment timelines with an MRI scanner. It
//! exposes a uniform "wait for trigger" protocol over several physical
//! trigger channels (serial line, parallel port, keyboard, response pad), a
//! synthetic dummy source and a scanner-emulation composite. Backends are
//! created by name through the [`registry`].
//!
//! The probe binary (`scanner_trigger`) is a thin CLI over this library.

pub mod adapters;
pub mod clock;
pub mod config;
pub mod error;
pub mod hardware;
pub mod input;
pub mod registry;
pub mod trigger;

pub use clock::{Clock, MonotonicClock, SharedClock};
pub use error::{TriggerError, TriggerResult};
pub use input::{KeyQueue, KeySource, SharedKeySource};
pub use registry::{create, register, Collaborators};
pub use trigger::{TriggerBackend, TriggerCore, TriggerDevice};
