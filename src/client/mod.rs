// src/client/mod.rs

//! The client library: rendezvous, session establishment, and the typed
//! command surface.
//!
//! A [`CamClient`] is cheap and stateless apart from its per-process group
//! id; each [`CamClient::open`] produces an independent [`CamSession`] with
//! its own private connection range on the server.

mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::core::errors::{CamHubError, ResultCode};
use crate::core::protocol::{
    CLIENT_API_VERSION, CapabilityFlags, CommandMessage, CommandParams, HandshakeRecord,
};
use crate::transport::{Connection, Transport, UnixTransport};

pub use session::CamSession;
use session::{SessionShared, event_delivery_task, event_receive_task};

/// Client-side tuning. Defaults mirror the server's.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_dir: PathBuf,
    pub rendezvous_id: u32,
    /// How long `connect` retries a not-yet-listening server.
    pub connect_retry_for: Duration,
    /// Bound on one command/response exchange.
    pub command_timeout: Duration,
    /// Event receive/dequeue wakeup interval.
    pub event_poll: Duration,
    /// Bound on the first heartbeat ping after a health-tracked open.
    pub first_ping_timeout: Duration,
    pub event_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/camhub"),
            rendezvous_id: 1,
            connect_retry_for: Duration::from_secs(3),
            command_timeout: Duration::from_secs(5),
            event_poll: Duration::from_millis(250),
            first_ping_timeout: Duration::from_secs(2),
            event_queue_capacity: 64,
        }
    }
}

/// Clients co-located with the arbiter can derive their tuning from the same
/// loaded configuration file instead of repeating the values.
impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        Self {
            socket_dir: config.socket_dir.clone(),
            rendezvous_id: config.rendezvous_id,
            connect_retry_for: config.timeouts.connect_retry_for,
            command_timeout: config.timeouts.command,
            event_poll: config.timeouts.event_poll,
            first_ping_timeout: config.health.ack_timeout,
            event_queue_capacity: config.events.queue_capacity,
        }
    }
}

/// Per-open options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request heartbeat tracking for this session. The server grants at
    /// most one tracked context per client process and degrades the rest.
    pub health_tracked: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            health_tracked: true,
        }
    }
}

/// Entry point for client processes.
pub struct CamClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    group_id: u64,
}

impl CamClient {
    pub fn new(config: ClientConfig) -> Self {
        let transport = Arc::new(UnixTransport::new(&config.socket_dir));
        // Shared by every session this process opens; the server evicts the
        // whole group when the tracked session goes silent.
        let group_id = SmallRng::from_entropy().r#gen();
        Self {
            transport,
            config,
            group_id,
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Opens one camera input: rendezvous handshake, private connections,
    /// the open exchange, work connections, and (for tracked sessions) the
    /// first heartbeat round trip.
    pub async fn open(
        &self,
        descriptor: u32,
        options: ClientOptions,
    ) -> Result<CamSession, CamHubError> {
        let reply = self.rendezvous(&options).await?;
        let health_tracked = reply.flags.contains(CapabilityFlags::HEALTH_TRACKED);

        let main = Arc::new(Connection::new(reply.conn_id, 1));
        main.connect(&*self.transport, self.config.connect_retry_for)
            .await?;
        let event = Arc::new(Connection::new(reply.conn_id + 1, 1));
        if let Err(err) = event
            .connect(&*self.transport, self.config.connect_retry_for)
            .await
        {
            main.close();
            return Err(err);
        }

        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let shared = SessionShared::new(
            self.config.clone(),
            main,
            event,
            health_tracked,
            user_tx,
        );
        // The event tasks must run before the open exchange: the server may
        // queue the first heartbeat ping while open is still in flight.
        tokio::spawn(event_receive_task(shared.clone()));
        tokio::spawn(event_delivery_task(shared.clone()));

        let opened = self.open_exchange(&shared, descriptor).await;
        let work_connections = match opened {
            Ok(n) => n,
            Err(err) => {
                shared.shutdown_local();
                return Err(err);
            }
        };

        for i in 0..work_connections {
            let conn = Arc::new(Connection::new(reply.conn_id + 2 + i, 1));
            if let Err(err) = conn
                .connect(&*self.transport, self.config.connect_retry_for)
                .await
            {
                shared.shutdown_local();
                return Err(err);
            }
            shared.work.lock().push(conn);
        }

        if health_tracked {
            if let Err(err) = self.await_first_ping(&shared).await {
                shared.shutdown_local();
                return Err(err);
            }
        }

        info!(
            descriptor,
            handle = shared.handle.load(Ordering::SeqCst),
            conn_base = reply.conn_id,
            work_connections,
            health_tracked,
            "session established"
        );
        Ok(CamSession::new(shared, user_rx))
    }

    async fn rendezvous(&self, options: &ClientOptions) -> Result<HandshakeRecord, CamHubError> {
        let rdv = Connection::new(self.config.rendezvous_id, 1);
        rdv.connect(&*self.transport, self.config.connect_retry_for)
            .await?;
        let record = HandshakeRecord {
            conn_id: 0,
            conn_count: 0,
            group_id: self.group_id,
            pid: std::process::id(),
            peer_version: CLIENT_API_VERSION,
            lib_version: CLIENT_API_VERSION,
            result: ResultCode::Ok,
            flags: if options.health_tracked {
                CapabilityFlags::HEALTH_TRACKED
            } else {
                CapabilityFlags::empty()
            },
        };
        rdv.send(&record.encode()).await?;
        let frame = rdv.recv(self.config.command_timeout).await?;
        rdv.close();
        let reply = HandshakeRecord::decode(&frame)?;
        reply.result.into_result()?;
        debug!(
            conn_base = reply.conn_id,
            conn_count = reply.conn_count,
            "rendezvous complete"
        );
        Ok(reply)
    }

    async fn open_exchange(
        &self,
        shared: &Arc<SessionShared>,
        descriptor: u32,
    ) -> Result<u32, CamHubError> {
        let reply = shared
            .exchange(
                &shared.main,
                CommandParams::Open {
                    descriptor,
                    handle: 0,
                    work_connections: 0,
                },
            )
            .await?;
        let CommandMessage {
            params:
                CommandParams::Open {
                    handle,
                    work_connections,
                    ..
                },
            ..
        } = reply
        else {
            unreachable!("correlate checked the kind");
        };
        if handle == 0 {
            return Err(CamHubError::ProtocolViolation(
                "server returned a null handle".to_string(),
            ));
        }
        shared.handle.store(handle, Ordering::SeqCst);
        Ok(work_connections)
    }

    /// Blocks until the delivery task has answered the first heartbeat ping,
    /// so a returned tracked session is already visible to the monitor.
    async fn await_first_ping(&self, shared: &Arc<SessionShared>) -> Result<(), CamHubError> {
        let mut acked = shared.first_ping_tx.subscribe();
        let wait = async {
            while !*acked.borrow_and_update() {
                if acked.changed().await.is_err() {
                    return Err(CamHubError::Failed(
                        "event delivery task gone".to_string(),
                    ));
                }
            }
            Ok(())
        };
        match tokio::time::timeout(self.config.first_ping_timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(CamHubError::Timeout),
        }
    }
}
