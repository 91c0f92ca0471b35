// src/core/errors.rs

//! Defines the primary error type for the entire crate, plus the stable
//! wire-level result codes that cross the command channel.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the arbiter.
///
/// Transport backends translate their own error codes into this taxonomy at
/// the `Connection` boundary; nothing backend-specific leaks above it.
#[derive(Error, Debug, Clone)]
pub enum CamHubError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Handle not found in registry")]
    BadHandle,

    #[error("Operation invalid in current state: {0}")]
    BadState(String),

    #[error("No free context slots")]
    NoResources,

    #[error("Timed out waiting for peer")]
    Timeout,

    #[error("Protocol version {0:#06x} is not supported")]
    VersionUnsupported(u16),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl PartialEq for CamHubError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CamHubError::Io(e1), CamHubError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CamHubError::BadParameter(s1), CamHubError::BadParameter(s2)) => s1 == s2,
            (CamHubError::BadState(s1), CamHubError::BadState(s2)) => s1 == s2,
            (CamHubError::VersionUnsupported(v1), CamHubError::VersionUnsupported(v2)) => v1 == v2,
            (CamHubError::ProtocolViolation(s1), CamHubError::ProtocolViolation(s2)) => s1 == s2,
            (CamHubError::Failed(s1), CamHubError::Failed(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for CamHubError {
    fn from(e: std::io::Error) -> Self {
        CamHubError::Io(Arc::new(e))
    }
}

impl CamHubError {
    /// True for the bounded-wait outcomes a caller may retry (`connect`,
    /// `receive`, `import`); everything else is fatal for the exchange.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CamHubError::Timeout)
    }
}

/// Result code carried in every command/handshake header.
///
/// This is the wire projection of [`CamHubError`]: codes are stable across
/// versions and never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResultCode {
    Ok = 0,
    BadParameter = 1,
    BadHandle = 2,
    BadState = 3,
    NoResources = 4,
    Timeout = 5,
    VersionUnsupported = 6,
    ProtocolViolation = 7,
    Failed = 8,
}

impl ResultCode {
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::BadParameter),
            2 => Some(Self::BadHandle),
            3 => Some(Self::BadState),
            4 => Some(Self::NoResources),
            5 => Some(Self::Timeout),
            6 => Some(Self::VersionUnsupported),
            7 => Some(Self::ProtocolViolation),
            8 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Converts a wire result code back into a call result on the receiving
    /// side. The textual detail of the original error does not cross the
    /// wire; only the taxonomy does.
    pub fn into_result(self) -> Result<(), CamHubError> {
        match self {
            ResultCode::Ok => Ok(()),
            ResultCode::BadParameter => {
                Err(CamHubError::BadParameter("rejected by peer".to_string()))
            }
            ResultCode::BadHandle => Err(CamHubError::BadHandle),
            ResultCode::BadState => Err(CamHubError::BadState("rejected by peer".to_string())),
            ResultCode::NoResources => Err(CamHubError::NoResources),
            ResultCode::Timeout => Err(CamHubError::Timeout),
            ResultCode::VersionUnsupported => Err(CamHubError::VersionUnsupported(0)),
            ResultCode::ProtocolViolation => Err(CamHubError::ProtocolViolation(
                "reported by peer".to_string(),
            )),
            ResultCode::Failed => Err(CamHubError::Failed("reported by peer".to_string())),
        }
    }
}

impl From<&CamHubError> for ResultCode {
    fn from(e: &CamHubError) -> Self {
        match e {
            CamHubError::Io(_) => ResultCode::Failed,
            CamHubError::BadParameter(_) => ResultCode::BadParameter,
            CamHubError::BadHandle => ResultCode::BadHandle,
            CamHubError::BadState(_) => ResultCode::BadState,
            CamHubError::NoResources => ResultCode::NoResources,
            CamHubError::Timeout => ResultCode::Timeout,
            CamHubError::VersionUnsupported(_) => ResultCode::VersionUnsupported,
            CamHubError::ProtocolViolation(_) => ResultCode::ProtocolViolation,
            CamHubError::Failed(_) => ResultCode::Failed,
        }
    }
}
