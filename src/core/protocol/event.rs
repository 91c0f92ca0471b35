// src/core/protocol/event.rs

//! Asynchronous event records. Events travel exclusively on the event
//! connection, server to client, and are copied by value through the
//! Event Channel on both ends.

use bytes::{Buf, BufMut, BytesMut};

use crate::core::errors::{CamHubError, ResultCode};

/// Wire size of one event record: kind + reserved + seq + two payload words.
pub const EVENT_WIRE_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InputSignal,
    FrameReady,
    Error,
    HealthPing,
}

impl EventKind {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::InputSignal => 1,
            Self::FrameReady => 2,
            Self::Error => 3,
            Self::HealthPing => 4,
        }
    }

    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::InputSignal),
            2 => Some(Self::FrameReady),
            3 => Some(Self::Error),
            4 => Some(Self::HealthPing),
            _ => None,
        }
    }
}

/// Payload union, interpreted per kind. Two 64-bit words on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    /// An input gained or lost signal lock.
    InputSignal { input: u32, present: bool },
    /// A captured frame is ready for `get-frame`.
    FrameReady { index: u32, timestamp_ns: u64 },
    /// An asynchronous failure (peer death, health timeout, engine fault).
    Error { code: ResultCode },
    /// Liveness probe from the health monitor.
    HealthPing,
}

/// A small fixed-size event record. The sequence counter is stamped at
/// enqueue time and is diagnostic only; gaps after drop-oldest are expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub payload: EventPayload,
    pub seq: u64,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self { payload, seq: 0 }
    }

    pub fn health_ping() -> Self {
        Self::new(EventPayload::HealthPing)
    }

    pub fn error(code: ResultCode) -> Self {
        Self::new(EventPayload::Error { code })
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::InputSignal { .. } => EventKind::InputSignal,
            EventPayload::FrameReady { .. } => EventKind::FrameReady,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::HealthPing => EventKind::HealthPing,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(EVENT_WIRE_LEN);
        buf.put_u16_le(self.kind().to_u16());
        buf.put_u16_le(0);
        buf.put_u64_le(self.seq);
        let (a, b) = match self.payload {
            EventPayload::InputSignal { input, present } => (input as u64, present as u64),
            EventPayload::FrameReady {
                index,
                timestamp_ns,
            } => (index as u64, timestamp_ns),
            EventPayload::Error { code } => (code.to_u16() as u64, 0),
            EventPayload::HealthPing => (0, 0),
        };
        buf.put_u64_le(a);
        buf.put_u64_le(b);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CamHubError> {
        if buf.remaining() < EVENT_WIRE_LEN {
            return Err(CamHubError::ProtocolViolation(
                "truncated event record".to_string(),
            ));
        }
        let kind_raw = buf.get_u16_le();
        let kind = EventKind::from_u16(kind_raw).ok_or_else(|| {
            CamHubError::ProtocolViolation(format!("unknown event kind {kind_raw}"))
        })?;
        let _reserved = buf.get_u16_le();
        let seq = buf.get_u64_le();
        let a = buf.get_u64_le();
        let b = buf.get_u64_le();
        let payload = match kind {
            EventKind::InputSignal => EventPayload::InputSignal {
                input: a as u32,
                present: b != 0,
            },
            EventKind::FrameReady => EventPayload::FrameReady {
                index: a as u32,
                timestamp_ns: b,
            },
            EventKind::Error => EventPayload::Error {
                code: ResultCode::from_u16(a as u16).unwrap_or(ResultCode::Failed),
            },
            EventKind::HealthPing => EventPayload::HealthPing,
        };
        Ok(Self { payload, seq })
    }
}
