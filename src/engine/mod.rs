// src/engine/mod.rs

//! The camera-engine collaborator boundary.
//!
//! The arbiter core never interprets pixel data or buffer contents; it
//! consults the engine through this narrow interface and forwards the
//! engine's asynchronous events into the owning context's Event Channel.

pub mod testpattern;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::errors::CamHubError;
use crate::core::protocol::Event;

pub use testpattern::TestPatternEngine;

/// Opaque identifier for an open camera input. Zero is never a valid handle.
pub type EngineHandle = u64;

/// Descriptor + size pair handed to the engine by `set-buffers`. The
/// descriptor is owned by the connection's buffer map; the engine must not
/// close it.
#[derive(Debug, Clone, Copy)]
pub struct EngineBuffer {
    pub fd: std::os::fd::RawFd,
    pub size: u64,
}

/// Metadata for one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub index: u32,
    pub timestamp_ns: u64,
    pub len: u64,
}

/// The image-processing engine owned by the server process.
#[async_trait]
pub trait CameraEngine: Send + Sync + 'static {
    /// Lists the input descriptors currently attached.
    async fn query_inputs(&self) -> Result<Vec<u32>, CamHubError>;

    /// Opens one input and returns a non-zero handle.
    async fn open(&self, descriptor: u32) -> Result<EngineHandle, CamHubError>;

    async fn close(&self, handle: EngineHandle) -> Result<(), CamHubError>;

    async fn get_param(&self, handle: EngineHandle, param: u32) -> Result<u64, CamHubError>;

    async fn set_param(
        &self,
        handle: EngineHandle,
        param: u32,
        value: u64,
    ) -> Result<(), CamHubError>;

    async fn set_buffers(
        &self,
        handle: EngineHandle,
        buffers: Vec<EngineBuffer>,
    ) -> Result<(), CamHubError>;

    async fn start(&self, handle: EngineHandle) -> Result<(), CamHubError>;

    async fn stop(&self, handle: EngineHandle) -> Result<(), CamHubError>;

    async fn pause(&self, handle: EngineHandle) -> Result<(), CamHubError>;

    async fn resume(&self, handle: EngineHandle) -> Result<(), CamHubError>;

    /// Waits up to `timeout` for a captured frame.
    async fn get_frame(
        &self,
        handle: EngineHandle,
        timeout: Duration,
        flags: u32,
    ) -> Result<FrameInfo, CamHubError>;

    async fn release_frame(&self, handle: EngineHandle, index: u32) -> Result<(), CamHubError>;

    /// Hands out the engine's asynchronous event stream for one handle.
    /// The server forwards it into the context's Event Channel. Returns
    /// `None` when the stream was already taken or the handle is unknown.
    fn take_event_stream(&self, handle: EngineHandle) -> Option<mpsc::UnboundedReceiver<Event>>;
}
