// src/server/connection_loop.rs

//! The rendezvous accept loop and client admission.
//!
//! Every client begins on the well-known rendezvous connection: it sends one
//! handshake record, the server allocates a context and a private
//! connection-id range, echoes the record back with the assignment, and the
//! client moves off to its own connections. The rendezvous stream carries
//! nothing else.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::core::errors::{CamHubError, ResultCode};
use crate::core::protocol::{CLIENT_API_VERSION, CapabilityFlags, HandshakeRecord};
use crate::server::context::ServerContext;
use crate::server::dispatcher;
use crate::server::state::ServerState;
use crate::transport::{AcceptMode, Connection};

/// Accepts rendezvous peers until shutdown, spawning one admission task per
/// peer. On exit every live context is torn down.
pub(crate) async fn run(
    state: Arc<ServerState>,
    rendezvous: Arc<Connection>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(conn = rendezvous.id(), "rendezvous listener up");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            accepted = rendezvous.accept(AcceptMode::Spawn) => match accepted {
                Ok(Some(conn)) => {
                    let state = state.clone();
                    tokio::spawn(admit_client(state, Arc::new(conn)));
                }
                Ok(None) => unreachable!("spawn accept always yields a connection"),
                Err(err) => {
                    if rendezvous.is_aborted() {
                        break;
                    }
                    error!(%err, "rendezvous accept failed");
                    break;
                }
            },
        }
    }
    rendezvous.close();
    for ctx in state.registry.live_contexts() {
        ctx.teardown(&state).await;
    }
    info!("rendezvous loop stopped");
}

/// One client admission: handshake, context allocation, private-range
/// assignment, then main and event connection establishment.
async fn admit_client(state: Arc<ServerState>, conn: Arc<Connection>) {
    let handshake_timeout = state.config.timeouts.handshake;
    let frame = match conn.recv(handshake_timeout).await {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%err, "rendezvous peer sent no handshake");
            conn.close();
            return;
        }
    };
    let mut record = match HandshakeRecord::decode(&frame) {
        Ok(record) => record,
        Err(err) => {
            warn!(%err, "malformed handshake record");
            conn.close();
            return;
        }
    };

    if let Err(err) = record.validate_version() {
        warn!(
            pid = record.pid,
            version = format_args!("{:#06x}", record.peer_version),
            %err,
            "rejecting client with unsupported version"
        );
        record.result = ResultCode::from(&err);
        let _ = conn.send(&record.encode()).await;
        conn.close();
        return;
    }
    if record.peer_version != CLIENT_API_VERSION {
        warn!(
            pid = record.pid,
            peer = format_args!("{:#06x}", record.peer_version),
            server = format_args!("{:#06x}", CLIENT_API_VERSION),
            "serving whitelisted older client version"
        );
    }

    // At most one health-tracked context per peer process; later requests
    // are degraded to untracked rather than refused.
    let mut health_tracked =
        state.config.health.enabled && record.flags.contains(CapabilityFlags::HEALTH_TRACKED);
    if health_tracked
        && state.registry.live_contexts().iter().any(|c| {
            c.health_tracked && c.peer_pid == record.pid && c.peer_group == record.group_id
        })
    {
        warn!(
            pid = record.pid,
            group = record.group_id,
            "peer already has a health-tracked context; degrading to untracked"
        );
        health_tracked = false;
    }

    let allocated = state.registry.allocate(|slot| {
        let (base, count) = state.config.conn_range_for_slot(slot);
        ServerContext::new(
            slot,
            record.pid,
            record.group_id,
            record.peer_version,
            base,
            count,
            health_tracked,
            state.config.events.queue_capacity,
        )
    });
    let ctx = match allocated {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(pid = record.pid, %err, "context allocation failed");
            record.result = ResultCode::from(&err);
            let _ = conn.send(&record.encode()).await;
            conn.close();
            return;
        }
    };

    // Listeners must exist before the reply so the client's connect never
    // races the bind.
    let main_conn = Arc::new(Connection::new(ctx.conn_base, 1));
    let event_conn = Arc::new(Connection::new(ctx.conn_base + 1, 1));
    if let Err(err) = main_conn.open(&*state.transport).await {
        error!(slot = ctx.slot, %err, "main listener failed");
        record.result = ResultCode::from(&err);
        let _ = conn.send(&record.encode()).await;
        conn.close();
        ctx.teardown(&state).await;
        return;
    }
    if let Err(err) = event_conn.open(&*state.transport).await {
        error!(slot = ctx.slot, %err, "event listener failed");
        record.result = ResultCode::from(&err);
        let _ = conn.send(&record.encode()).await;
        conn.close();
        main_conn.close();
        ctx.teardown(&state).await;
        return;
    }
    *ctx.main_conn.lock() = Some(main_conn.clone());
    *ctx.event_conn.lock() = Some(event_conn.clone());

    record.conn_id = ctx.conn_base;
    record.conn_count = ctx.conn_count;
    record.result = ResultCode::Ok;
    record.flags = if health_tracked {
        CapabilityFlags::HEALTH_TRACKED
    } else {
        CapabilityFlags::empty()
    };
    if conn.send(&record.encode()).await.is_err() {
        debug!(slot = ctx.slot, "peer vanished before handshake reply");
        conn.close();
        ctx.teardown(&state).await;
        return;
    }
    conn.close();

    for (label, listener) in [("main", &main_conn), ("event", &event_conn)] {
        match tokio::time::timeout(handshake_timeout, listener.accept(AcceptMode::Transfer)).await
        {
            Ok(Ok(None)) => {}
            Ok(Ok(Some(_))) => unreachable!("transfer accept yields no spawned connection"),
            Ok(Err(err)) => {
                warn!(slot = ctx.slot, %err, "{label} connection accept failed");
                ctx.teardown(&state).await;
                return;
            }
            Err(_) => {
                warn!(slot = ctx.slot, "{label} connection never joined");
                ctx.teardown(&state).await;
                return;
            }
        }
    }

    info!(
        slot = ctx.slot,
        pid = ctx.peer_pid,
        group = ctx.peer_group,
        base = ctx.conn_base,
        count = ctx.conn_count,
        health_tracked = ctx.health_tracked,
        "client admitted"
    );

    tokio::spawn(dispatcher::run(
        state.clone(),
        ctx.clone(),
        main_conn,
        true,
    ));
    tokio::spawn(event_forwarder(state, ctx, event_conn));
}

/// Drains the context's Event Channel onto the event connection in priority
/// order. A dead event connection ends the whole context.
async fn event_forwarder(
    state: Arc<ServerState>,
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
) {
    let poll = state.config.timeouts.event_poll;
    loop {
        if ctx.is_aborting() || conn.is_aborted() {
            break;
        }
        match ctx.events.dequeue(poll).await {
            Ok(event) => {
                if conn.send(&event.encode()).await.is_err() {
                    if !ctx.is_aborting() {
                        debug!(slot = ctx.slot, "event connection lost");
                        ctx.teardown(&state).await;
                    }
                    break;
                }
            }
            Err(CamHubError::Timeout) => continue,
            Err(_) => break,
        }
    }
}
