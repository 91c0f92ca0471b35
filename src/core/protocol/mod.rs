// src/core/protocol/mod.rs

//! Fixed-layout wire records exchanged between client and server.
//!
//! Every record is a small, bounded, little-endian struct; the transport
//! frames each one as a single whole message. There is no self-describing
//! serialization here on purpose: the command set is a fixed enumeration,
//! not a user-extensible RPC surface.

pub mod command;
pub mod event;
pub mod handshake;

pub use command::{CommandKind, CommandMessage, CommandParams, MAX_BUFFERS, MAX_INPUTS};
pub use event::{Event, EventKind, EventPayload};
pub use handshake::{CapabilityFlags, HandshakeRecord, CLIENT_API_VERSION, SUPPORTED_VERSIONS};

/// Upper bound for any framed message on a command or event connection.
/// Handshake, command, and event records all fit well within this.
pub const MAX_MESSAGE_LEN: usize = 256;
