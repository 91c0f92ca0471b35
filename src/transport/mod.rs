// src/transport/mod.rs

//! Connection transport abstraction: a point-to-point, ordered, reliable
//! whole-message stream plus a side-channel buffer-exchange operation.
//!
//! The core is written against the [`Transport`]/[`Endpoint`] capability
//! traits and never against a concrete backend; `unix` provides the
//! Unix-domain stream-socket backend. Backend failures are translated into
//! the crate error taxonomy here and never leak upward.

pub mod buffer_map;
pub mod unix;

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::core::errors::CamHubError;
pub use buffer_map::{BufferEntry, BufferMap, FlushMode};
pub use unix::UnixTransport;

/// Numeric rendezvous key identifying one connection endpoint pair.
pub type ConnId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Uninitialized,
    Listening,
    Connecting,
    Ready,
    Closed,
}

/// How `accept` treats the listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
    /// The listener stays open for further accepts; a fresh `Ready`
    /// connection is produced.
    Spawn,
    /// The listener's identity is handed to the accepted peer and the
    /// listener is retired; the connection itself becomes `Ready`.
    Transfer,
}

/// One transport-level endpoint: either a listener or a connected stream.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Blocks until a peer connects. Valid on listeners only.
    async fn accept(&self) -> Result<Box<dyn Endpoint>, CamHubError>;

    /// Sends one whole message. The transport must not coalesce it with an
    /// adjacent send from the receiver's point of view.
    async fn send(&self, buf: &[u8]) -> Result<(), CamHubError>;

    /// Receives one whole message, waiting up to `timeout`. A timeout is
    /// retryable and distinct from hard failure.
    async fn recv(&self, timeout: Duration) -> Result<Bytes, CamHubError>;

    /// Hands a memory region's descriptor to the peer along with its size.
    async fn send_fd(&self, fd: RawFd, size: u64) -> Result<(), CamHubError>;

    /// Receives one descriptor and its declared size.
    async fn recv_fd(&self, timeout: Duration) -> Result<(OwnedFd, u64), CamHubError>;

    /// Unblocks every operation currently waiting on this endpoint. Sync and
    /// idempotent; callers observe a fatal status within their own timeout.
    fn shutdown(&self);
}

/// Factory for endpoints of one backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Allocates listening resources for rendezvous key `id`.
    async fn listen(&self, id: ConnId, max_peers: u32) -> Result<Box<dyn Endpoint>, CamHubError>;

    /// Actively joins a connection opened by a peer under the same `id`,
    /// retrying on "not yet listening" until `retry_for` elapses.
    async fn connect(&self, id: ConnId, retry_for: Duration)
    -> Result<Box<dyn Endpoint>, CamHubError>;
}

/// An ownership-exclusive, stateful connection endpoint with its abort flag,
/// status, buffer-map generations, and per-connection I/O ordering lock.
///
/// Once `Closed` a connection is never reused; allocate a new value.
pub struct Connection {
    id: ConnId,
    max_peers: u32,
    status: parking_lot::Mutex<ConnStatus>,
    abort: AtomicBool,
    endpoint: parking_lot::Mutex<Option<Arc<dyn Endpoint>>>,
    buffers: parking_lot::Mutex<BufferMap>,
    /// Serializes one request/response exchange at a time on this connection.
    io_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(id: ConnId, max_peers: u32) -> Self {
        Self {
            id,
            max_peers,
            status: parking_lot::Mutex::new(ConnStatus::Uninitialized),
            abort: AtomicBool::new(false),
            endpoint: parking_lot::Mutex::new(None),
            buffers: parking_lot::Mutex::new(BufferMap::new()),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn ready_with(id: ConnId, endpoint: Arc<dyn Endpoint>) -> Self {
        let conn = Self::new(id, 1);
        *conn.endpoint.lock() = Some(endpoint);
        *conn.status.lock() = ConnStatus::Ready;
        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn status(&self) -> ConnStatus {
        *self.status.lock()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Result<Arc<dyn Endpoint>, CamHubError> {
        if self.is_aborted() {
            return Err(CamHubError::BadState("connection is closed".to_string()));
        }
        self.endpoint
            .lock()
            .clone()
            .ok_or_else(|| CamHubError::BadState("connection is not established".to_string()))
    }

    /// Moves `Uninitialized -> Listening` by allocating backend listening
    /// resources for this connection's rendezvous key.
    pub async fn open(&self, transport: &dyn Transport) -> Result<(), CamHubError> {
        {
            let status = self.status.lock();
            if *status != ConnStatus::Uninitialized {
                return Err(CamHubError::BadState(format!(
                    "open on connection {} in state {:?}",
                    self.id, *status
                )));
            }
        }
        let endpoint = transport.listen(self.id, self.max_peers).await?;
        *self.endpoint.lock() = Some(Arc::from(endpoint));
        *self.status.lock() = ConnStatus::Listening;
        Ok(())
    }

    /// Moves `Uninitialized -> Connecting -> Ready` by joining a peer's
    /// listener, retrying on "not yet listening" until `retry_for` elapses.
    pub async fn connect(
        &self,
        transport: &dyn Transport,
        retry_for: Duration,
    ) -> Result<(), CamHubError> {
        {
            let mut status = self.status.lock();
            if *status != ConnStatus::Uninitialized {
                return Err(CamHubError::BadState(format!(
                    "connect on connection {} in state {:?}",
                    self.id, *status
                )));
            }
            *status = ConnStatus::Connecting;
        }
        match transport.connect(self.id, retry_for).await {
            Ok(endpoint) => {
                *self.endpoint.lock() = Some(Arc::from(endpoint));
                *self.status.lock() = ConnStatus::Ready;
                Ok(())
            }
            Err(e) => {
                *self.status.lock() = ConnStatus::Uninitialized;
                Err(e)
            }
        }
    }

    /// Blocks until a peer connects to this listening connection.
    ///
    /// `Spawn` returns `Some(fresh Ready connection)` and keeps listening;
    /// `Transfer` retires the listener, makes this connection itself `Ready`
    /// on the accepted stream, and returns `None`.
    pub async fn accept(&self, mode: AcceptMode) -> Result<Option<Connection>, CamHubError> {
        if self.status() != ConnStatus::Listening {
            return Err(CamHubError::BadState(format!(
                "accept on connection {} in state {:?}",
                self.id,
                self.status()
            )));
        }
        let listener = self.endpoint()?;
        let accepted = listener.accept().await?;
        match mode {
            AcceptMode::Spawn => Ok(Some(Connection::ready_with(self.id, Arc::from(accepted)))),
            AcceptMode::Transfer => {
                // Dropping the listener endpoint releases the rendezvous
                // resources; the accepted stream takes over this
                // connection's identity.
                listener.shutdown();
                *self.endpoint.lock() = Some(Arc::from(accepted));
                *self.status.lock() = ConnStatus::Ready;
                Ok(None)
            }
        }
    }

    pub async fn send(&self, buf: &[u8]) -> Result<(), CamHubError> {
        self.endpoint()?.send(buf).await
    }

    pub async fn recv(&self, timeout: Duration) -> Result<Bytes, CamHubError> {
        self.endpoint()?.recv(timeout).await
    }

    /// Exports a memory region to the peer. The handle is duplicated into
    /// the active buffer-map generation so the region outlives the caller's
    /// descriptor until the generation is flushed.
    pub async fn export(&self, fd: BorrowedFd<'_>, size: u64) -> Result<(), CamHubError> {
        let endpoint = self.endpoint()?;
        let retained = fd.try_clone_to_owned().map_err(CamHubError::from)?;
        endpoint.send_fd(retained.as_raw_fd(), size).await?;
        self.buffers.lock().record(retained, size);
        Ok(())
    }

    /// Imports one memory handle from the peer. The returned descriptor is
    /// owned by this connection's active buffer-map generation and stays
    /// valid until that generation is flushed.
    pub async fn import(&self, timeout: Duration) -> Result<(RawFd, u64), CamHubError> {
        let endpoint = self.endpoint()?;
        let (fd, size) = endpoint.recv_fd(timeout).await?;
        let raw = fd.as_raw_fd();
        self.buffers.lock().record(fd, size);
        Ok((raw, size))
    }

    /// Releases one buffer-map generation; see [`FlushMode`].
    pub fn flush(&self, mode: FlushMode) -> usize {
        let released = self.buffers.lock().flush(mode);
        if released > 0 {
            debug!(
                conn = self.id,
                released, ?mode,
                "released buffer-map generation"
            );
        }
        released
    }

    /// Drops the active buffer-map generation without rotating; the set from
    /// the last completed round stays live. Used when a buffer round fails
    /// partway through.
    pub fn discard_pending_buffers(&self) -> usize {
        let released = self.buffers.lock().discard_current();
        if released > 0 {
            debug!(conn = self.id, released, "discarded aborted buffer round");
        }
        released
    }

    /// Descriptors of the active buffer-map generation, oldest first.
    pub fn current_buffers(&self) -> Vec<(RawFd, u64)> {
        self.buffers.lock().current_fds()
    }

    pub fn buffers_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// Serializes a send/receive pair against concurrent callers on this
    /// connection.
    pub async fn lock_io(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.io_lock.lock().await
    }

    /// Sets the abort flag, unblocks every waiter, releases both buffer-map
    /// generations, and moves to `Closed`. Idempotent and synchronous.
    pub fn close(&self) {
        if self.abort.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.shutdown();
        }
        self.flush(FlushMode::Teardown);
        self.flush(FlushMode::Teardown);
        *self.status.lock() = ConnStatus::Closed;
        debug!(conn = self.id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
