// src/core/protocol/handshake.rs

//! The rendezvous handshake record: the first (and only) message exchanged
//! on the well-known rendezvous connection. Sent client to server, echoed
//! back with the connection-id range rewritten to the assigned one and the
//! result code set.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::core::errors::{CamHubError, ResultCode};

/// Protocol version declared by this client library.
pub const CLIENT_API_VERSION: u16 = 0x0102;

/// Versions the server accepts. A whitelisted version that differs from
/// [`CLIENT_API_VERSION`] is served with a warning; anything outside this
/// list is a hard handshake failure.
pub const SUPPORTED_VERSIONS: [u16; 3] = [0x0100, 0x0101, 0x0102];

/// Wire size of one handshake record.
pub const HANDSHAKE_WIRE_LEN: usize = 30;

bitflags! {
    /// Capability bits carried in the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        /// The context being established is the health-tracked one for this
        /// peer process.
        const HEALTH_TRACKED = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Requested (client) or assigned (server echo) base connection id.
    pub conn_id: u32,
    /// Size of the private connection-id range.
    pub conn_count: u32,
    /// Randomly generated per-process group id, shared by every context the
    /// peer process opens. Used for health-triggered group eviction.
    pub group_id: u64,
    /// Peer process id.
    pub pid: u32,
    /// Version the peer declares for itself.
    pub peer_version: u16,
    /// Version of the client library that built the record.
    pub lib_version: u16,
    pub result: ResultCode,
    pub flags: CapabilityFlags,
}

impl HandshakeRecord {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_WIRE_LEN);
        buf.put_u32_le(self.conn_id);
        buf.put_u32_le(self.conn_count);
        buf.put_u64_le(self.group_id);
        buf.put_u32_le(self.pid);
        buf.put_u16_le(self.peer_version);
        buf.put_u16_le(self.lib_version);
        buf.put_u16_le(self.result.to_u16());
        buf.put_u32_le(self.flags.bits());
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CamHubError> {
        if buf.remaining() < HANDSHAKE_WIRE_LEN {
            return Err(CamHubError::ProtocolViolation(
                "truncated handshake record".to_string(),
            ));
        }
        let conn_id = buf.get_u32_le();
        let conn_count = buf.get_u32_le();
        let group_id = buf.get_u64_le();
        let pid = buf.get_u32_le();
        let peer_version = buf.get_u16_le();
        let lib_version = buf.get_u16_le();
        let result_raw = buf.get_u16_le();
        let result = ResultCode::from_u16(result_raw).ok_or_else(|| {
            CamHubError::ProtocolViolation(format!("unknown result code {result_raw}"))
        })?;
        let flags = CapabilityFlags::from_bits_truncate(buf.get_u32_le());
        Ok(Self {
            conn_id,
            conn_count,
            group_id,
            pid,
            peer_version,
            lib_version,
            result,
            flags,
        })
    }

    /// Server-side version gate.
    pub fn validate_version(&self) -> Result<(), CamHubError> {
        if SUPPORTED_VERSIONS.contains(&self.peer_version) {
            Ok(())
        } else {
            Err(CamHubError::VersionUnsupported(self.peer_version))
        }
    }
}
