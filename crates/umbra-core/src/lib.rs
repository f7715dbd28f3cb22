//! Umbra shared foundation
//!
//! Domain model, error taxonomy, configuration snapshot, vendor extraction,
//! and the realtime event seam. Every other Umbra crate builds on this one;
//! nothing here performs I/O beyond reading the environment at startup.

pub mod config;
pub mod error;
pub mod events;
pub mod types;
pub mod vendor;

pub use config::UmbraConfig;
pub use error::{Result, UmbraError};
pub use events::{EventKind, EventSink, NullSink, RealtimeEvent, Topic};
pub use types::*;
