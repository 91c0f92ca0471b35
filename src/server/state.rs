// src/server/state.rs

//! The shared server state handed to every task.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::engine::CameraEngine;
use crate::server::registry::Registry;
use crate::transport::Transport;

/// Everything the accept loop, dispatchers, and health monitor share.
/// Config is immutable after startup; per-client mutability lives in the
/// registry's contexts.
pub struct ServerState {
    pub config: Config,
    pub engine: Arc<dyn CameraEngine>,
    pub transport: Arc<dyn Transport>,
    pub registry: Registry,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ServerState {
    pub fn new(
        config: Config,
        engine: Arc<dyn CameraEngine>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);
        let registry = Registry::new(config.registry.max_contexts);
        Arc::new(Self {
            config,
            engine,
            transport,
            registry,
            shutdown_tx,
        })
    }

    /// Broadcasts shutdown to every background task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
