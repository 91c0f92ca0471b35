// src/transport/unix.rs

//! Unix-domain stream-socket transport backend.
//!
//! A rendezvous key maps to a socket path inside the configured socket
//! directory. Whole-message semantics are imposed with a length prefix so a
//! byte-stream transport cannot coalesce adjacent sends from the receiver's
//! point of view. Buffer export/import rides SCM_RIGHTS ancillary data on
//! the same socket.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, Shutdown, recvmsg, sendmsg, shutdown,
};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::errors::CamHubError;
use crate::core::protocol::MAX_MESSAGE_LEN;
use crate::transport::{ConnId, Endpoint, Transport};

/// Poll interval while waiting for a peer that is not yet listening.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

fn nix_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn closed_locally() -> CamHubError {
    CamHubError::Failed("connection closed locally".to_string())
}

fn peer_closed() -> CamHubError {
    CamHubError::Failed("peer closed the connection".to_string())
}

/// Backend factory for Unix-domain sockets under one directory.
#[derive(Debug, Clone)]
pub struct UnixTransport {
    dir: PathBuf,
}

impl UnixTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn socket_path(&self, id: ConnId) -> PathBuf {
        self.dir.join(format!("camhub-{id}.sock"))
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn listen(&self, id: ConnId, _max_peers: u32) -> Result<Box<dyn Endpoint>, CamHubError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.socket_path(id);
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                // Singleton guard: reclaim the path only if nothing answers
                // on it, so two processes cannot own the same rendezvous id.
                match UnixStream::connect(&path).await {
                    Ok(_) => {
                        return Err(CamHubError::Failed(format!(
                            "rendezvous id {id} is already owned by a live peer"
                        )));
                    }
                    Err(_) => {
                        debug!(id, path = %path.display(), "reclaiming stale rendezvous socket");
                        std::fs::remove_file(&path)?;
                        UnixListener::bind(&path)?
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(ListenerEndpoint {
            listener,
            path,
            close_tx: watch::Sender::new(false),
        }))
    }

    async fn connect(
        &self,
        id: ConnId,
        retry_for: Duration,
    ) -> Result<Box<dyn Endpoint>, CamHubError> {
        let path = self.socket_path(id);
        let deadline = Instant::now() + retry_for;
        loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => return Ok(Box::new(StreamEndpoint::new(stream))),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return Err(CamHubError::Timeout);
                    }
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Listening half of a rendezvous key. Unlinks its socket path on drop.
struct ListenerEndpoint {
    listener: UnixListener,
    path: PathBuf,
    close_tx: watch::Sender<bool>,
}

#[async_trait]
impl Endpoint for ListenerEndpoint {
    async fn accept(&self) -> Result<Box<dyn Endpoint>, CamHubError> {
        let mut closed = self.close_tx.subscribe();
        if *closed.borrow() {
            return Err(closed_locally());
        }
        tokio::select! {
            biased;
            _ = closed.changed() => Err(closed_locally()),
            res = self.listener.accept() => {
                let (stream, _) = res?;
                Ok(Box::new(StreamEndpoint::new(stream)) as Box<dyn Endpoint>)
            }
        }
    }

    async fn send(&self, _buf: &[u8]) -> Result<(), CamHubError> {
        Err(CamHubError::BadState(
            "listener endpoint carries no payload traffic".to_string(),
        ))
    }

    async fn recv(&self, _timeout: Duration) -> Result<Bytes, CamHubError> {
        Err(CamHubError::BadState(
            "listener endpoint carries no payload traffic".to_string(),
        ))
    }

    async fn send_fd(&self, _fd: RawFd, _size: u64) -> Result<(), CamHubError> {
        Err(CamHubError::BadState(
            "listener endpoint carries no payload traffic".to_string(),
        ))
    }

    async fn recv_fd(&self, _timeout: Duration) -> Result<(OwnedFd, u64), CamHubError> {
        Err(CamHubError::BadState(
            "listener endpoint carries no payload traffic".to_string(),
        ))
    }

    fn shutdown(&self) {
        self.close_tx.send_replace(true);
    }
}

impl Drop for ListenerEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to unlink socket: {e}");
            }
        }
    }
}

/// Connected stream endpoint. All I/O goes through readiness + `try_io`
/// against `&self`, so shutdown can unblock waiters from any task.
struct StreamEndpoint {
    stream: UnixStream,
    close_tx: watch::Sender<bool>,
}

impl StreamEndpoint {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            close_tx: watch::Sender::new(false),
        }
    }

    async fn wait_ready(&self, interest: Interest) -> Result<(), CamHubError> {
        let mut closed = self.close_tx.subscribe();
        if *closed.borrow() {
            return Err(closed_locally());
        }
        tokio::select! {
            biased;
            _ = closed.changed() => Err(closed_locally()),
            res = self.stream.ready(interest) => {
                res?;
                Ok(())
            }
        }
    }

    async fn write_all(&self, buf: &[u8]) -> Result<(), CamHubError> {
        let mut off = 0;
        while off < buf.len() {
            self.wait_ready(Interest::WRITABLE).await?;
            match self.stream.try_write(&buf[off..]) {
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), CamHubError> {
        let mut off = 0;
        while off < buf.len() {
            self.wait_ready(Interest::READABLE).await?;
            match self.stream.try_read(&mut buf[off..]) {
                Ok(0) => return Err(peer_closed()),
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn recv_message(&self) -> Result<Bytes, CamHubError> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header).await?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(CamHubError::ProtocolViolation(format!(
                "frame length {len} exceeds cap {MAX_MESSAGE_LEN}"
            )));
        }
        let mut body = vec![0u8; len];
        self.read_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }

    async fn recv_fd_inner(&self) -> Result<(OwnedFd, u64), CamHubError> {
        loop {
            self.wait_ready(Interest::READABLE).await?;
            let res = self.stream.try_io(Interest::READABLE, || {
                let mut payload = [0u8; 8];
                let mut iov = [IoSliceMut::new(&mut payload)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
                let msg = recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(nix_to_io)?;
                let bytes = msg.bytes;
                let mut received: Option<RawFd> = None;
                for cmsg in msg.cmsgs().map_err(nix_to_io)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        received = fds.first().copied();
                    }
                }
                Ok((bytes, payload, received))
            });
            match res {
                Ok((0, _, None)) => return Err(peer_closed()),
                Ok((n, payload, received)) => {
                    let Some(raw) = received else {
                        return Err(CamHubError::ProtocolViolation(
                            "buffer import carried no descriptor".to_string(),
                        ));
                    };
                    // SAFETY: the descriptor was just installed into this
                    // process by recvmsg and is owned by nobody else.
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    if n != payload.len() {
                        return Err(CamHubError::ProtocolViolation(format!(
                            "buffer import size record truncated ({n} bytes)"
                        )));
                    }
                    return Ok((fd, u64::from_le_bytes(payload)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Endpoint for StreamEndpoint {
    async fn accept(&self) -> Result<Box<dyn Endpoint>, CamHubError> {
        Err(CamHubError::BadState(
            "stream endpoint cannot accept".to_string(),
        ))
    }

    async fn send(&self, buf: &[u8]) -> Result<(), CamHubError> {
        if buf.len() > MAX_MESSAGE_LEN {
            return Err(CamHubError::BadParameter(format!(
                "message length {} exceeds cap {MAX_MESSAGE_LEN}",
                buf.len()
            )));
        }
        // One contiguous frame per send call; the length prefix keeps the
        // receiver message-aligned even if the kernel coalesces writes.
        let mut frame = Vec::with_capacity(4 + buf.len());
        frame.extend_from_slice(&(buf.len() as u32).to_le_bytes());
        frame.extend_from_slice(buf);
        self.write_all(&frame).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Bytes, CamHubError> {
        match tokio::time::timeout(timeout, self.recv_message()).await {
            Ok(res) => res,
            Err(_) => Err(CamHubError::Timeout),
        }
    }

    async fn send_fd(&self, fd: RawFd, size: u64) -> Result<(), CamHubError> {
        let payload = size.to_le_bytes();
        loop {
            self.wait_ready(Interest::WRITABLE).await?;
            let res = self.stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&payload)];
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(nix_to_io)
            });
            match res {
                Ok(n) if n == payload.len() => return Ok(()),
                Ok(n) => {
                    return Err(CamHubError::Failed(format!(
                        "short descriptor send ({n} bytes)"
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn recv_fd(&self, timeout: Duration) -> Result<(OwnedFd, u64), CamHubError> {
        match tokio::time::timeout(timeout, self.recv_fd_inner()).await {
            Ok(res) => res,
            Err(_) => Err(CamHubError::Timeout),
        }
    }

    fn shutdown(&self) {
        let _ = shutdown(self.stream.as_raw_fd(), Shutdown::Both);
        self.close_tx.send_replace(true);
    }
}
