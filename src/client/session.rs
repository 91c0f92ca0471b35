// src/client/session.rs

//! An established client session: the typed command surface over the main
//! and work connections, plus the event/heartbeat machinery behind it.

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::client::ClientConfig;
use crate::core::errors::CamHubError;
use crate::core::events::EventChannel;
use crate::core::protocol::{
    CommandMessage, CommandParams, Event, EventKind, MAX_BUFFERS, MAX_INPUTS,
};
use crate::engine::FrameInfo;
use crate::transport::{Connection, FlushMode};

/// State shared between the session value and its background tasks.
pub(crate) struct SessionShared {
    pub(crate) config: ClientConfig,
    pub(crate) main: Arc<Connection>,
    pub(crate) event: Arc<Connection>,
    pub(crate) work: Mutex<Vec<Arc<Connection>>>,
    /// Local priority staging between the event receive task and delivery.
    pub(crate) events: EventChannel,
    /// Engine handle; zero until the open exchange completes.
    pub(crate) handle: AtomicU64,
    pub(crate) health_tracked: bool,
    pub(crate) closed: AtomicBool,
    /// Latched when the first heartbeat ping has been acked.
    pub(crate) first_ping_tx: watch::Sender<bool>,
    /// Set on every acked heartbeat ping, mirroring the server's per-tick
    /// liveness flag; consumed by [`CamSession::take_signal_received`].
    pub(crate) signal_received: AtomicBool,
    /// Application-facing event stream.
    pub(crate) user_tx: mpsc::UnboundedSender<Event>,
    next_work: AtomicUsize,
}

impl SessionShared {
    pub(crate) fn new(
        config: ClientConfig,
        main: Arc<Connection>,
        event: Arc<Connection>,
        health_tracked: bool,
        user_tx: mpsc::UnboundedSender<Event>,
    ) -> Arc<Self> {
        let (first_ping_tx, _) = watch::channel(false);
        Arc::new(Self {
            events: EventChannel::with_default_classifier(config.event_queue_capacity),
            config,
            main,
            event,
            work: Mutex::new(Vec::new()),
            handle: AtomicU64::new(0),
            health_tracked,
            closed: AtomicBool::new(false),
            first_ping_tx,
            signal_received: AtomicBool::new(false),
            user_tx,
            next_work: AtomicUsize::new(0),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn handle(&self) -> u64 {
        self.handle.load(Ordering::SeqCst)
    }

    /// One serialized request/response exchange on `conn`.
    pub(crate) async fn exchange(
        &self,
        conn: &Connection,
        params: CommandParams,
    ) -> Result<CommandMessage, CamHubError> {
        self.exchange_with_timeout(conn, params, self.config.command_timeout)
            .await
    }

    pub(crate) async fn exchange_with_timeout(
        &self,
        conn: &Connection,
        params: CommandParams,
        recv_timeout: Duration,
    ) -> Result<CommandMessage, CamHubError> {
        if self.is_closed() {
            return Err(CamHubError::BadState("session is closed".to_string()));
        }
        let kind = params.kind();
        let request = CommandMessage::request(params);
        let _guard = conn.lock_io().await;
        conn.send(&request.encode()).await?;
        let frame = conn.recv(recv_timeout).await?;
        let reply = CommandMessage::decode(&frame)?;
        reply.correlate(kind)?;
        reply.result.into_result()?;
        Ok(reply)
    }

    fn pick_work_conn(&self) -> Result<Arc<Connection>, CamHubError> {
        let work = self.work.lock();
        if work.is_empty() {
            return Err(CamHubError::BadState(
                "no work connections established".to_string(),
            ));
        }
        let idx = self.next_work.fetch_add(1, Ordering::Relaxed) % work.len();
        Ok(work[idx].clone())
    }

    /// Tears the local side down. Never blocks; safe from `Drop`.
    pub(crate) fn shutdown_local(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.signal();
        for conn in self.work.lock().drain(..) {
            conn.close();
        }
        self.event.close();
        self.main.close();
    }
}

/// Receives raw event records from the event connection and stages them in
/// the session's priority channel.
pub(crate) async fn event_receive_task(shared: Arc<SessionShared>) {
    let poll = shared.config.event_poll;
    loop {
        if shared.is_closed() || shared.event.is_aborted() {
            break;
        }
        match shared.event.recv(poll).await {
            Ok(frame) => match Event::decode(&frame) {
                Ok(event) => shared.events.enqueue(event),
                Err(err) => {
                    warn!(%err, "undecodable event record");
                }
            },
            Err(CamHubError::Timeout) => continue,
            Err(err) => {
                if !shared.is_closed() {
                    debug!(%err, "event connection lost");
                    let _ = shared
                        .user_tx
                        .send(Event::error(crate::core::errors::ResultCode::Failed));
                }
                break;
            }
        }
    }
}

/// Drains the staged events in priority order: heartbeat pings are answered
/// on the main connection, everything else goes to the application.
pub(crate) async fn event_delivery_task(shared: Arc<SessionShared>) {
    let poll = shared.config.event_poll;
    loop {
        if shared.is_closed() {
            break;
        }
        let event = match shared.events.dequeue(poll).await {
            Ok(event) => event,
            Err(CamHubError::Timeout) => continue,
            Err(_) => break,
        };
        if event.kind() == EventKind::HealthPing {
            let handle = shared.handle();
            match shared
                .exchange(&shared.main, CommandParams::HealthAck { handle })
                .await
            {
                Ok(_) => {
                    shared.signal_received.store(true, Ordering::Relaxed);
                    shared.first_ping_tx.send_replace(true);
                }
                Err(err) => {
                    if !shared.is_closed() {
                        debug!(%err, "heartbeat ack failed");
                    }
                }
            }
            continue;
        }
        if shared.user_tx.send(event).is_err() {
            // Application dropped its receiver; keep draining pings only.
            continue;
        }
    }
}

/// One open camera input. Commands are methods; asynchronous events arrive
/// through [`CamSession::events`].
pub struct CamSession {
    shared: Arc<SessionShared>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl CamSession {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            shared,
            events_rx: Some(events_rx),
        }
    }

    pub fn handle(&self) -> u64 {
        self.shared.handle()
    }

    pub fn is_health_tracked(&self) -> bool {
        self.shared.health_tracked
    }

    /// Consumes the local liveness flag: true when a heartbeat ping has been
    /// acked since the last call. Lets the application notice a stale event
    /// connection before the server evicts it.
    pub fn take_signal_received(&self) -> bool {
        self.shared.signal_received.swap(false, Ordering::Relaxed)
    }

    /// Takes the application-facing event stream. Yields `None` after the
    /// first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.events_rx.take()
    }

    pub async fn query_inputs(&self) -> Result<Vec<u32>, CamHubError> {
        let reply = self
            .shared
            .exchange(
                &self.shared.main,
                CommandParams::QueryInputs {
                    count: 0,
                    inputs: [0; MAX_INPUTS],
                },
            )
            .await?;
        match reply.params {
            CommandParams::QueryInputs { count, inputs } => {
                Ok(inputs[..count as usize].to_vec())
            }
            _ => unreachable!("correlate checked the kind"),
        }
    }

    pub async fn get_param(&self, param: u32) -> Result<u64, CamHubError> {
        let reply = self
            .shared
            .exchange(
                &self.shared.main,
                CommandParams::GetParam {
                    handle: self.handle(),
                    param,
                    value: 0,
                },
            )
            .await?;
        match reply.params {
            CommandParams::GetParam { value, .. } => Ok(value),
            _ => unreachable!("correlate checked the kind"),
        }
    }

    pub async fn set_param(&self, param: u32, value: u64) -> Result<(), CamHubError> {
        self.shared
            .exchange(
                &self.shared.main,
                CommandParams::SetParam {
                    handle: self.handle(),
                    param,
                    value,
                },
            )
            .await
            .map(|_| ())
    }

    /// The three-phase buffer exchange: request, export each memory handle on
    /// the side channel, then collect the final result. On success the
    /// previously exported round is released.
    pub async fn set_buffers(&self, buffers: &[(BorrowedFd<'_>, u64)]) -> Result<(), CamHubError> {
        let count = buffers.len() as u32;
        if count == 0 || count > MAX_BUFFERS {
            return Err(CamHubError::BadParameter(format!(
                "buffer count {count} outside 1..={MAX_BUFFERS}"
            )));
        }
        if self.shared.is_closed() {
            return Err(CamHubError::BadState("session is closed".to_string()));
        }
        let conn = &self.shared.main;
        let params = CommandParams::SetBuffers {
            handle: self.handle(),
            count,
        };
        let request = CommandMessage::request(params);
        let _guard = conn.lock_io().await;
        conn.send(&request.encode()).await?;

        // Phase 1: the server acknowledges before any handle moves.
        let frame = conn.recv(self.shared.config.command_timeout).await?;
        let ack = CommandMessage::decode(&frame)?;
        ack.correlate(request.kind())?;
        ack.result.into_result()?;

        // Phase 2 and 3: export the handles, then collect the final verdict.
        let outcome = async {
            for (fd, size) in buffers {
                conn.export(*fd, *size).await?;
            }
            let frame = conn.recv(self.shared.config.command_timeout).await?;
            let fin = CommandMessage::decode(&frame)?;
            fin.correlate(request.kind())?;
            fin.result.into_result()
        }
        .await;
        match outcome {
            Ok(()) => {
                conn.flush(FlushMode::CompletedRound);
                Ok(())
            }
            Err(err) => {
                conn.discard_pending_buffers();
                Err(err)
            }
        }
    }

    pub async fn start(&self) -> Result<(), CamHubError> {
        self.simple_command(CommandParams::Start {
            handle: self.handle(),
        })
        .await
    }

    pub async fn stop(&self) -> Result<(), CamHubError> {
        self.simple_command(CommandParams::Stop {
            handle: self.handle(),
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), CamHubError> {
        self.simple_command(CommandParams::Pause {
            handle: self.handle(),
        })
        .await
    }

    pub async fn resume(&self) -> Result<(), CamHubError> {
        self.simple_command(CommandParams::Resume {
            handle: self.handle(),
        })
        .await
    }

    /// Waits up to `timeout` for a captured frame. Routed to a work
    /// connection so it never stalls control traffic on the main one.
    pub async fn get_frame(
        &self,
        timeout: Duration,
        flags: u32,
    ) -> Result<FrameInfo, CamHubError> {
        let conn = self.shared.pick_work_conn()?;
        // The server blocks up to `timeout` before answering, on top of the
        // normal exchange bound.
        let recv_timeout = self.shared.config.command_timeout + timeout;
        let reply = self
            .shared
            .exchange_with_timeout(
                &conn,
                CommandParams::GetFrame {
                    handle: self.handle(),
                    timeout_ms: timeout.as_millis().min(u128::from(u32::MAX)) as u32,
                    flags,
                    index: 0,
                    timestamp_ns: 0,
                    len: 0,
                },
                recv_timeout,
            )
            .await?;
        match reply.params {
            CommandParams::GetFrame {
                index,
                timestamp_ns,
                len,
                ..
            } => Ok(FrameInfo {
                index,
                timestamp_ns,
                len,
            }),
            _ => unreachable!("correlate checked the kind"),
        }
    }

    pub async fn release_frame(&self, index: u32) -> Result<(), CamHubError> {
        let conn = self.shared.pick_work_conn()?;
        self.shared
            .exchange(
                &conn,
                CommandParams::ReleaseFrame {
                    handle: self.handle(),
                    index,
                },
            )
            .await
            .map(|_| ())
    }

    async fn simple_command(&self, params: CommandParams) -> Result<(), CamHubError> {
        self.shared
            .exchange(&self.shared.main, params)
            .await
            .map(|_| ())
    }

    /// Orderly close: tells the server, then tears the local side down.
    /// Idempotent; after the first call every command fails with `BadState`.
    pub async fn close(&mut self) -> Result<(), CamHubError> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let outcome = self
            .shared
            .exchange(
                &self.shared.main,
                CommandParams::Close {
                    handle: self.handle(),
                },
            )
            .await;
        self.shared.shutdown_local();
        match outcome {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(%err, "close command failed; local teardown done anyway");
                Err(err)
            }
        }
    }
}

impl Drop for CamSession {
    fn drop(&mut self) {
        // Best effort: the server notices the dropped connections and frees
        // the context on its side.
        self.shared.shutdown_local();
    }
}

impl std::fmt::Debug for CamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CamSession")
            .field("handle", &self.handle())
            .field("health_tracked", &self.shared.health_tracked)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
