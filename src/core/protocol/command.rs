// src/core/protocol/command.rs

//! Command messages: a fixed header (kind + result) followed by a
//! kind-specific fixed-layout parameter block.
//!
//! The same record round-trips through one buffer for request and response;
//! the responder overwrites the result code and any output fields in place.
//! The command kind in a response must equal the kind of the request it
//! answers; a mismatch is protocol-fatal for that exchange.

use bytes::{Buf, BufMut, BytesMut};
use strum_macros::Display;

use crate::core::errors::{CamHubError, ResultCode};

/// Maximum number of input descriptors reported by `query-inputs`.
pub const MAX_INPUTS: usize = 16;

/// Maximum buffer count accepted by a single `set-buffers` round.
pub const MAX_BUFFERS: u32 = 32;

/// The fixed command enumeration. Wire discriminants are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CommandKind {
    QueryInputs,
    Open,
    Close,
    GetParam,
    SetParam,
    SetBuffers,
    Start,
    Stop,
    Pause,
    Resume,
    GetFrame,
    ReleaseFrame,
    /// Reserved by the protocol; events travel on the event connection only.
    GetEvent,
    HealthAck,
}

impl CommandKind {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::QueryInputs => 1,
            Self::Open => 2,
            Self::Close => 3,
            Self::GetParam => 4,
            Self::SetParam => 5,
            Self::SetBuffers => 6,
            Self::Start => 7,
            Self::Stop => 8,
            Self::Pause => 9,
            Self::Resume => 10,
            Self::GetFrame => 11,
            Self::ReleaseFrame => 12,
            Self::GetEvent => 13,
            Self::HealthAck => 14,
        }
    }

    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::QueryInputs),
            2 => Some(Self::Open),
            3 => Some(Self::Close),
            4 => Some(Self::GetParam),
            5 => Some(Self::SetParam),
            6 => Some(Self::SetBuffers),
            7 => Some(Self::Start),
            8 => Some(Self::Stop),
            9 => Some(Self::Pause),
            10 => Some(Self::Resume),
            11 => Some(Self::GetFrame),
            12 => Some(Self::ReleaseFrame),
            13 => Some(Self::GetEvent),
            14 => Some(Self::HealthAck),
            _ => None,
        }
    }

    /// True for the per-frame commands that route to a work connection
    /// instead of the main control connection.
    pub const fn routes_to_work_connection(self) -> bool {
        matches!(self, Self::GetFrame | Self::ReleaseFrame)
    }
}

/// Kind-specific parameter block. Request and response share the same
/// layout; output-only fields are zero in requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParams {
    QueryInputs {
        count: u32,
        inputs: [u32; MAX_INPUTS],
    },
    Open {
        descriptor: u32,
        handle: u64,
        work_connections: u32,
    },
    Close {
        handle: u64,
    },
    GetParam {
        handle: u64,
        param: u32,
        value: u64,
    },
    SetParam {
        handle: u64,
        param: u32,
        value: u64,
    },
    SetBuffers {
        handle: u64,
        count: u32,
    },
    Start {
        handle: u64,
    },
    Stop {
        handle: u64,
    },
    Pause {
        handle: u64,
    },
    Resume {
        handle: u64,
    },
    GetFrame {
        handle: u64,
        timeout_ms: u32,
        flags: u32,
        index: u32,
        timestamp_ns: u64,
        len: u64,
    },
    ReleaseFrame {
        handle: u64,
        index: u32,
    },
    GetEvent,
    HealthAck {
        handle: u64,
    },
}

impl CommandParams {
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::QueryInputs { .. } => CommandKind::QueryInputs,
            Self::Open { .. } => CommandKind::Open,
            Self::Close { .. } => CommandKind::Close,
            Self::GetParam { .. } => CommandKind::GetParam,
            Self::SetParam { .. } => CommandKind::SetParam,
            Self::SetBuffers { .. } => CommandKind::SetBuffers,
            Self::Start { .. } => CommandKind::Start,
            Self::Stop { .. } => CommandKind::Stop,
            Self::Pause { .. } => CommandKind::Pause,
            Self::Resume { .. } => CommandKind::Resume,
            Self::GetFrame { .. } => CommandKind::GetFrame,
            Self::ReleaseFrame { .. } => CommandKind::ReleaseFrame,
            Self::GetEvent => CommandKind::GetEvent,
            Self::HealthAck { .. } => CommandKind::HealthAck,
        }
    }
}

/// One full command message: header plus parameter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub result: ResultCode,
    pub params: CommandParams,
}

impl CommandMessage {
    /// Builds a request: result starts at `Ok` and is overwritten by the
    /// responder.
    pub fn request(params: CommandParams) -> Self {
        Self {
            result: ResultCode::Ok,
            params,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.params.kind()
    }

    /// Enforces the response-correlation invariant: the response kind must
    /// equal the request kind.
    pub fn correlate(&self, expected: CommandKind) -> Result<(), CamHubError> {
        if self.kind() == expected {
            Ok(())
        } else {
            Err(CamHubError::ProtocolViolation(format!(
                "response kind {} does not match request kind {}",
                self.kind(),
                expected
            )))
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(96);
        buf.put_u16_le(self.kind().to_u16());
        buf.put_u16_le(self.result.to_u16());
        match &self.params {
            CommandParams::QueryInputs { count, inputs } => {
                buf.put_u32_le(*count);
                for input in inputs {
                    buf.put_u32_le(*input);
                }
            }
            CommandParams::Open {
                descriptor,
                handle,
                work_connections,
            } => {
                buf.put_u32_le(*descriptor);
                buf.put_u64_le(*handle);
                buf.put_u32_le(*work_connections);
            }
            CommandParams::Close { handle }
            | CommandParams::Start { handle }
            | CommandParams::Stop { handle }
            | CommandParams::Pause { handle }
            | CommandParams::Resume { handle }
            | CommandParams::HealthAck { handle } => {
                buf.put_u64_le(*handle);
            }
            CommandParams::GetParam {
                handle,
                param,
                value,
            }
            | CommandParams::SetParam {
                handle,
                param,
                value,
            } => {
                buf.put_u64_le(*handle);
                buf.put_u32_le(*param);
                buf.put_u64_le(*value);
            }
            CommandParams::SetBuffers { handle, count } => {
                buf.put_u64_le(*handle);
                buf.put_u32_le(*count);
            }
            CommandParams::GetFrame {
                handle,
                timeout_ms,
                flags,
                index,
                timestamp_ns,
                len,
            } => {
                buf.put_u64_le(*handle);
                buf.put_u32_le(*timeout_ms);
                buf.put_u32_le(*flags);
                buf.put_u32_le(*index);
                buf.put_u64_le(*timestamp_ns);
                buf.put_u64_le(*len);
            }
            CommandParams::ReleaseFrame { handle, index } => {
                buf.put_u64_le(*handle);
                buf.put_u32_le(*index);
            }
            CommandParams::GetEvent => {}
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CamHubError> {
        if buf.remaining() < 4 {
            return Err(CamHubError::ProtocolViolation(
                "command message shorter than header".to_string(),
            ));
        }
        let kind_raw = buf.get_u16_le();
        let kind = CommandKind::from_u16(kind_raw).ok_or_else(|| {
            CamHubError::ProtocolViolation(format!("unknown command kind {kind_raw}"))
        })?;
        let result_raw = buf.get_u16_le();
        let result = ResultCode::from_u16(result_raw).ok_or_else(|| {
            CamHubError::ProtocolViolation(format!("unknown result code {result_raw}"))
        })?;

        let need = |buf: &&[u8], n: usize| -> Result<(), CamHubError> {
            if buf.remaining() < n {
                Err(CamHubError::ProtocolViolation(format!(
                    "truncated {kind} parameter block"
                )))
            } else {
                Ok(())
            }
        };

        let params = match kind {
            CommandKind::QueryInputs => {
                need(&buf, 4 + 4 * MAX_INPUTS)?;
                let count = buf.get_u32_le();
                let mut inputs = [0u32; MAX_INPUTS];
                for slot in inputs.iter_mut() {
                    *slot = buf.get_u32_le();
                }
                if count as usize > MAX_INPUTS {
                    return Err(CamHubError::ProtocolViolation(format!(
                        "input count {count} exceeds table size {MAX_INPUTS}"
                    )));
                }
                CommandParams::QueryInputs { count, inputs }
            }
            CommandKind::Open => {
                need(&buf, 16)?;
                CommandParams::Open {
                    descriptor: buf.get_u32_le(),
                    handle: buf.get_u64_le(),
                    work_connections: buf.get_u32_le(),
                }
            }
            CommandKind::Close => {
                need(&buf, 8)?;
                CommandParams::Close {
                    handle: buf.get_u64_le(),
                }
            }
            CommandKind::GetParam => {
                need(&buf, 20)?;
                CommandParams::GetParam {
                    handle: buf.get_u64_le(),
                    param: buf.get_u32_le(),
                    value: buf.get_u64_le(),
                }
            }
            CommandKind::SetParam => {
                need(&buf, 20)?;
                CommandParams::SetParam {
                    handle: buf.get_u64_le(),
                    param: buf.get_u32_le(),
                    value: buf.get_u64_le(),
                }
            }
            CommandKind::SetBuffers => {
                need(&buf, 12)?;
                CommandParams::SetBuffers {
                    handle: buf.get_u64_le(),
                    count: buf.get_u32_le(),
                }
            }
            CommandKind::Start => {
                need(&buf, 8)?;
                CommandParams::Start {
                    handle: buf.get_u64_le(),
                }
            }
            CommandKind::Stop => {
                need(&buf, 8)?;
                CommandParams::Stop {
                    handle: buf.get_u64_le(),
                }
            }
            CommandKind::Pause => {
                need(&buf, 8)?;
                CommandParams::Pause {
                    handle: buf.get_u64_le(),
                }
            }
            CommandKind::Resume => {
                need(&buf, 8)?;
                CommandParams::Resume {
                    handle: buf.get_u64_le(),
                }
            }
            CommandKind::GetFrame => {
                need(&buf, 36)?;
                CommandParams::GetFrame {
                    handle: buf.get_u64_le(),
                    timeout_ms: buf.get_u32_le(),
                    flags: buf.get_u32_le(),
                    index: buf.get_u32_le(),
                    timestamp_ns: buf.get_u64_le(),
                    len: buf.get_u64_le(),
                }
            }
            CommandKind::ReleaseFrame => {
                need(&buf, 12)?;
                CommandParams::ReleaseFrame {
                    handle: buf.get_u64_le(),
                    index: buf.get_u32_le(),
                }
            }
            CommandKind::GetEvent => CommandParams::GetEvent,
            CommandKind::HealthAck => {
                need(&buf, 8)?;
                CommandParams::HealthAck {
                    handle: buf.get_u64_le(),
                }
            }
        };

        Ok(Self { result, params })
    }
}
