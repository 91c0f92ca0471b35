// src/server/dispatcher.rs

//! Command dispatch: one task per established command connection. Requests
//! arrive as whole messages, route to the engine through the owning context,
//! and the same record is sent back with the result code and output fields
//! filled in.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::errors::{CamHubError, ResultCode};
use crate::core::protocol::{
    CommandKind, CommandMessage, CommandParams, Event, MAX_BUFFERS, MAX_INPUTS,
};
use crate::engine::EngineBuffer;
use crate::server::context::ServerContext;
use crate::server::state::ServerState;
use crate::transport::{AcceptMode, Connection, FlushMode};

/// What the loop does after one exchange.
enum Flow {
    Continue,
    /// The connection is unusable; a work connection dies alone.
    CloseConnection,
    /// The context is unusable; the main connection takes everything with it.
    TeardownContext,
}

/// Receive loop for one command connection. `is_main` decides whether a
/// fatal transport error ends just this connection or the whole context.
pub(crate) async fn run(
    state: Arc<ServerState>,
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    is_main: bool,
) {
    let recv_timeout = state.config.timeouts.recv;
    loop {
        if ctx.is_aborting() || conn.is_aborted() {
            break;
        }
        let frame = match conn.recv(recv_timeout).await {
            Ok(frame) => frame,
            Err(CamHubError::Timeout) => continue,
            Err(err) => {
                if !ctx.is_aborting() {
                    debug!(conn = conn.id(), slot = ctx.slot, %err, "command connection lost");
                }
                if is_main {
                    ctx.teardown(&state).await;
                }
                return;
            }
        };
        let msg = match CommandMessage::decode(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(conn = conn.id(), slot = ctx.slot, %err, "undecodable command");
                if is_main {
                    ctx.teardown(&state).await;
                } else {
                    conn.close();
                }
                return;
            }
        };
        match dispatch_one(&state, &ctx, &conn, msg, is_main).await {
            Flow::Continue => {}
            Flow::CloseConnection => {
                conn.close();
                return;
            }
            Flow::TeardownContext => {
                ctx.teardown(&state).await;
                return;
            }
        }
    }
}

async fn dispatch_one(
    state: &Arc<ServerState>,
    ctx: &Arc<ServerContext>,
    conn: &Arc<Connection>,
    mut msg: CommandMessage,
    is_main: bool,
) -> Flow {
    let kind = msg.kind();
    // set-buffers is a multi-phase exchange and owns its own send sequence.
    if let CommandParams::SetBuffers { handle, count } = msg.params {
        return handle_set_buffers(state, ctx, conn, msg, handle, count, is_main).await;
    }

    let outcome = route(state, ctx, &mut msg).await;
    let success = outcome.is_ok();
    msg.result = match &outcome {
        Ok(()) => ResultCode::Ok,
        Err(err) => {
            debug!(conn = conn.id(), slot = ctx.slot, command = %kind, %err, "command failed");
            ResultCode::from(err)
        }
    };
    if conn.send(&msg.encode()).await.is_err() {
        return fatal_flow(is_main);
    }
    if success {
        ctx.mark_signal();
    }
    match (kind, success) {
        // The response has been sent; now the context goes away.
        (CommandKind::Close, true) => Flow::TeardownContext,
        _ => Flow::Continue,
    }
}

/// The main connection carries the context's identity; losing it ends the
/// session. A work connection only takes itself down.
fn fatal_flow(is_main: bool) -> Flow {
    if is_main {
        Flow::TeardownContext
    } else {
        Flow::CloseConnection
    }
}

async fn route(
    state: &Arc<ServerState>,
    ctx: &Arc<ServerContext>,
    msg: &mut CommandMessage,
) -> Result<(), CamHubError> {
    match &mut msg.params {
        CommandParams::QueryInputs { count, inputs } => {
            let list = state.engine.query_inputs().await?;
            *count = list.len().min(MAX_INPUTS) as u32;
            for (slot, descriptor) in inputs.iter_mut().zip(list) {
                *slot = descriptor;
            }
            Ok(())
        }
        CommandParams::Open {
            descriptor,
            handle,
            work_connections,
        } => {
            let h = handle_open(state, ctx, *descriptor).await?;
            *handle = h;
            *work_connections = state.config.registry.work_connections;
            Ok(())
        }
        CommandParams::Close { handle } => {
            ctx.expect_open(*handle)?;
            // Detach first so teardown does not close the engine twice.
            if let Some(h) = ctx.take_handle() {
                state.engine.close(h).await?;
            }
            Ok(())
        }
        CommandParams::GetParam {
            handle,
            param,
            value,
        } => {
            let h = ctx.expect_open(*handle)?;
            *value = state.engine.get_param(h, *param).await?;
            Ok(())
        }
        CommandParams::SetParam {
            handle,
            param,
            value,
        } => {
            let h = ctx.expect_open(*handle)?;
            state.engine.set_param(h, *param, *value).await
        }
        CommandParams::Start { handle } => {
            let h = ctx.expect_open(*handle)?;
            state.engine.start(h).await
        }
        CommandParams::Stop { handle } => {
            let h = ctx.expect_open(*handle)?;
            state.engine.stop(h).await
        }
        CommandParams::Pause { handle } => {
            let h = ctx.expect_open(*handle)?;
            state.engine.pause(h).await
        }
        CommandParams::Resume { handle } => {
            let h = ctx.expect_open(*handle)?;
            state.engine.resume(h).await
        }
        CommandParams::GetFrame {
            handle,
            timeout_ms,
            flags,
            index,
            timestamp_ns,
            len,
        } => {
            let h = ctx.expect_open(*handle)?;
            let info = state
                .engine
                .get_frame(h, Duration::from_millis(u64::from(*timeout_ms)), *flags)
                .await?;
            *index = info.index;
            *timestamp_ns = info.timestamp_ns;
            *len = info.len;
            Ok(())
        }
        CommandParams::ReleaseFrame { handle, index } => {
            let h = ctx.expect_open(*handle)?;
            state.engine.release_frame(h, *index).await
        }
        CommandParams::GetEvent => Err(CamHubError::BadState(
            "events are delivered on the event connection".to_string(),
        )),
        // The ack arrives before the client learns its handle in some
        // orderings, so the handle field is not validated here.
        CommandParams::HealthAck { .. } => {
            ctx.enable_health();
            Ok(())
        }
        CommandParams::SetBuffers { .. } => unreachable!("handled by handle_set_buffers"),
    }
}

/// Open: allocate the engine handle, bring up the work-connection listeners,
/// wire the engine's event stream into the context's Event Channel, and (for
/// health-tracked contexts) issue the first heartbeat ping.
// Returns a boxed future to break the `Send` auto-trait cycle: the tasks
// spawned here re-enter `run`, whose future would otherwise contain this one.
fn handle_open<'a>(
    state: &'a Arc<ServerState>,
    ctx: &'a Arc<ServerContext>,
    descriptor: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, CamHubError>> + Send + 'a>> {
    Box::pin(async move {
        ctx.expect_closed()?;
        let handle = state.engine.open(descriptor).await?;
        ctx.set_open(handle);

        for i in 0..state.config.registry.work_connections {
            let conn = Arc::new(Connection::new(ctx.conn_base + 2 + i, 1));
            if let Err(err) = conn.open(&*state.transport).await {
                warn!(slot = ctx.slot, conn = conn.id(), %err, "work listener failed");
                // Close the listeners already opened so a retry on this context
                // can reclaim the whole connection-id range.
                let opened: Vec<_> = std::mem::take(&mut *ctx.work_conns.lock());
                for stale in opened {
                    stale.close();
                }
                if let Some(h) = ctx.take_handle() {
                    let _ = state.engine.close(h).await;
                }
                return Err(CamHubError::Failed(
                    "could not allocate work connections".to_string(),
                ));
            }
            ctx.work_conns.lock().push(conn.clone());
            let state = state.clone();
            let ctx = ctx.clone();
            let handshake = state.config.timeouts.handshake;
            tokio::spawn(async move {
                match tokio::time::timeout(handshake, conn.accept(AcceptMode::Transfer)).await {
                    Ok(Ok(None)) => run(state, ctx, conn, false).await,
                    Ok(Ok(Some(_))) => unreachable!("transfer accept yields no spawned connection"),
                    Ok(Err(err)) => {
                        if !ctx.is_aborting() {
                            debug!(conn = conn.id(), %err, "work accept failed");
                        }
                        conn.close();
                    }
                    Err(_) => {
                        debug!(conn = conn.id(), "work connection never joined");
                        conn.close();
                    }
                }
            });
        }

        if let Some(mut stream) = state.engine.take_event_stream(handle) {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.recv().await {
                    if ctx.is_aborting() {
                        break;
                    }
                    ctx.events.enqueue(event);
                }
            });
        }

        if ctx.health_tracked {
            ctx.events.enqueue(Event::health_ping());
        }
        Ok(handle)
    })
}

/// The three-phase buffer exchange: validate and acknowledge, import `count`
/// memory handles on the side channel, hand them to the engine, and send the
/// final result. Descriptors from the previous completed round stay valid
/// until this round succeeds.
async fn handle_set_buffers(
    state: &Arc<ServerState>,
    ctx: &Arc<ServerContext>,
    conn: &Arc<Connection>,
    mut msg: CommandMessage,
    handle: u64,
    count: u32,
    is_main: bool,
) -> Flow {
    let validated = ctx.expect_open(handle).and_then(|h| {
        if count == 0 || count > MAX_BUFFERS {
            Err(CamHubError::BadParameter(format!(
                "buffer count {count} outside 1..={MAX_BUFFERS}"
            )))
        } else {
            Ok(h)
        }
    });
    let h = match validated {
        Ok(h) => h,
        Err(err) => {
            msg.result = ResultCode::from(&err);
            if conn.send(&msg.encode()).await.is_err() {
                return fatal_flow(is_main);
            }
            return Flow::Continue;
        }
    };

    // Phase 1: acknowledge so the client starts exporting.
    msg.result = ResultCode::Ok;
    if conn.send(&msg.encode()).await.is_err() {
        return fatal_flow(is_main);
    }

    // Phase 2: import the handles into this connection's buffer map.
    let mut result = ResultCode::Ok;
    for _ in 0..count {
        if let Err(err) = conn.import(state.config.timeouts.import).await {
            warn!(slot = ctx.slot, %err, "buffer import failed");
            result = ResultCode::from(&err);
            break;
        }
    }

    // Phase 3: hand the complete set to the engine, then retire the previous
    // generation.
    if result == ResultCode::Ok {
        let buffers: Vec<EngineBuffer> = conn
            .current_buffers()
            .into_iter()
            .map(|(fd, size)| EngineBuffer { fd, size })
            .collect();
        if let Err(err) = state.engine.set_buffers(h, buffers).await {
            result = ResultCode::from(&err);
        }
    }
    if result == ResultCode::Ok {
        conn.flush(FlushMode::CompletedRound);
        ctx.mark_signal();
    } else {
        conn.discard_pending_buffers();
    }

    msg.result = result;
    if conn.send(&msg.encode()).await.is_err() {
        return fatal_flow(is_main);
    }
    Flow::Continue
}
