// src/server/mod.rs

//! The arbiter server: rendezvous accept loop, per-client dispatchers, and
//! the health monitor, tied together by a broadcast shutdown signal.

mod connection_loop;
mod context;
mod dispatcher;
mod health;
mod registry;
mod state;

use std::sync::Arc;

use anyhow::Context as _;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::CameraEngine;
use crate::transport::{Connection, UnixTransport};

pub use context::ServerContext;
pub use health::HealthMonitor;
pub use registry::{HandleState, Registry};
pub use state::ServerState;

/// A running arbiter instance. Tests embed one in-process; the binary wraps
/// it with signal handling via [`run`].
pub struct Server {
    pub state: Arc<ServerState>,
    tasks: JoinSet<()>,
}

impl Server {
    pub async fn start(config: Config, engine: Arc<dyn CameraEngine>) -> anyhow::Result<Server> {
        let transport = Arc::new(UnixTransport::new(&config.socket_dir));
        let state = ServerState::new(config, engine, transport);

        let rendezvous = Arc::new(Connection::new(
            state.config.rendezvous_id,
            state.config.registry.max_contexts as u32,
        ));
        rendezvous
            .open(&*state.transport)
            .await
            .context("failed to open the rendezvous listener")?;

        let mut tasks = JoinSet::new();
        let monitor = HealthMonitor::new(state.clone());
        tasks.spawn(monitor.run(state.shutdown_tx.subscribe()));
        tasks.spawn(connection_loop::run(
            state.clone(),
            rendezvous,
            state.shutdown_tx.subscribe(),
        ));

        info!(
            socket_dir = %state.config.socket_dir.display(),
            rendezvous = state.config.rendezvous_id,
            max_contexts = state.config.registry.max_contexts,
            "arbiter server started"
        );
        Ok(Server { state, tasks })
    }

    /// Broadcasts shutdown and waits for the background tasks to drain.
    pub async fn shutdown(mut self) {
        self.state.shutdown();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                if !err.is_cancelled() {
                    warn!(%err, "server task ended abnormally");
                }
            }
        }
        info!("arbiter server stopped");
    }
}

/// Binary entry point: starts the server and runs until SIGINT or SIGTERM.
pub async fn run(config: Config, engine: Arc<dyn CameraEngine>) -> anyhow::Result<()> {
    let server = Server::start(config, engine).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!(%err, "ctrl-c handler failed");
            }
            info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
        }
    }

    server.shutdown().await;
    Ok(())
}
