// src/server/context.rs

//! Per-client session state. One `ServerContext` owns the private connection
//! range assigned at rendezvous, the priority Event Channel feeding the
//! client's event connection, and the health counters the monitor reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::events::EventChannel;
use crate::engine::EngineHandle;
use crate::server::registry::HandleState;
use crate::server::state::ServerState;
use crate::transport::Connection;

pub struct ServerContext {
    pub slot: usize,
    pub peer_pid: u32,
    pub peer_group: u64,
    pub peer_version: u16,
    pub conn_base: u32,
    pub conn_count: u32,
    pub health_tracked: bool,

    handle: Mutex<HandleState>,
    pub main_conn: Mutex<Option<Arc<Connection>>>,
    pub event_conn: Mutex<Option<Arc<Connection>>>,
    pub work_conns: Mutex<Vec<Arc<Connection>>>,
    pub events: EventChannel,

    /// Set by the dispatcher on every successful command and by the client's
    /// heartbeat ack; cleared by the monitor on each tick.
    signal_received: AtomicBool,
    missed_ticks: AtomicU32,
    /// Latched by the first heartbeat ack. The monitor does not count misses
    /// before the client has proven it can answer pings at all.
    health_enabled: AtomicBool,
    abort_in_progress: AtomicBool,
}

impl ServerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: usize,
        peer_pid: u32,
        peer_group: u64,
        peer_version: u16,
        conn_base: u32,
        conn_count: u32,
        health_tracked: bool,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            slot,
            peer_pid,
            peer_group,
            peer_version,
            conn_base,
            conn_count,
            health_tracked,
            handle: Mutex::new(HandleState::Allocated),
            main_conn: Mutex::new(None),
            event_conn: Mutex::new(None),
            work_conns: Mutex::new(Vec::new()),
            events: EventChannel::with_default_classifier(queue_capacity),
            signal_received: AtomicBool::new(false),
            missed_ticks: AtomicU32::new(0),
            health_enabled: AtomicBool::new(false),
            abort_in_progress: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> HandleState {
        *self.handle.lock()
    }

    /// Rejects a second open on a context that already holds an engine handle.
    pub fn expect_closed(&self) -> Result<(), crate::core::errors::CamHubError> {
        match *self.handle.lock() {
            HandleState::Open(_) => Err(crate::core::errors::CamHubError::BadState(
                "context already has an open input".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Validates a client-supplied handle against the one this context owns.
    pub fn expect_open(
        &self,
        handle: EngineHandle,
    ) -> Result<EngineHandle, crate::core::errors::CamHubError> {
        match *self.handle.lock() {
            HandleState::Open(h) if h == handle => Ok(h),
            _ => Err(crate::core::errors::CamHubError::BadHandle),
        }
    }

    pub fn set_open(&self, handle: EngineHandle) {
        *self.handle.lock() = HandleState::Open(handle);
    }

    /// Detaches the engine handle, returning it if one was open. Used by the
    /// close path so teardown does not close the engine twice.
    pub fn take_handle(&self) -> Option<EngineHandle> {
        let mut guard = self.handle.lock();
        match std::mem::replace(&mut *guard, HandleState::Free) {
            HandleState::Open(h) => Some(h),
            _ => None,
        }
    }

    pub fn mark_signal(&self) {
        self.signal_received.store(true, Ordering::Relaxed);
    }

    pub fn enable_health(&self) {
        self.health_enabled.store(true, Ordering::Relaxed);
        self.missed_ticks.store(0, Ordering::Relaxed);
    }

    pub fn health_armed(&self) -> bool {
        self.health_enabled.load(Ordering::Relaxed)
    }

    /// One monitor tick: consumes the signal flag and returns the updated
    /// consecutive-miss count (zero when the client was heard from).
    pub fn health_tick(&self) -> u32 {
        if self.signal_received.swap(false, Ordering::Relaxed) {
            self.missed_ticks.store(0, Ordering::Relaxed);
            0
        } else {
            self.missed_ticks.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn is_aborting(&self) -> bool {
        self.abort_in_progress.load(Ordering::Relaxed)
    }

    /// Full context teardown: wake event delivery, close every connection,
    /// release the engine handle, and free the registry slot. Idempotent;
    /// concurrent callers beyond the first return immediately.
    pub async fn teardown(&self, state: &ServerState) {
        if self.abort_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            slot = self.slot,
            pid = self.peer_pid,
            group = self.peer_group,
            "tearing down client context"
        );
        // Wake the event forwarder so it observes the abort flag.
        self.events.signal();
        if let Some(conn) = self.event_conn.lock().take() {
            conn.close();
        }
        let works: Vec<_> = std::mem::take(&mut *self.work_conns.lock());
        for conn in works {
            conn.close();
        }
        if let Some(conn) = self.main_conn.lock().take() {
            conn.close();
        }
        if let Some(handle) = self.take_handle() {
            if let Err(err) = state.engine.close(handle).await {
                warn!(slot = self.slot, handle, %err, "engine close failed during teardown");
            }
        }
        state.registry.free(self.slot);
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("slot", &self.slot)
            .field("peer_pid", &self.peer_pid)
            .field("peer_group", &self.peer_group)
            .field("conn_base", &self.conn_base)
            .field("health_tracked", &self.health_tracked)
            .finish()
    }
}
