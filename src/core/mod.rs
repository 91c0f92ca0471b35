// src/core/mod.rs

pub mod errors;
pub mod events;
pub mod protocol;

// Re-export
pub use errors::{CamHubError, ResultCode};
pub use events::{EventChannel, Priority};
pub use protocol::{CommandKind, CommandMessage, CommandParams, Event, EventKind, EventPayload};
