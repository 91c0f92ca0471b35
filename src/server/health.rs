// src/server/health.rs

//! The heartbeat health monitor.
//!
//! Each tick the monitor checks whether a tracked context was heard from
//! since the previous tick (any successful command counts, the ack to the
//! ping included) and enqueues the next ping. A context silent for more
//! than `miss_threshold` consecutive ticks is declared dead and its whole
//! client group is evicted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::errors::ResultCode;
use crate::core::protocol::Event;
use crate::server::state::ServerState;

/// Pause between queueing the eviction error event and tearing the context
/// down, so the event forwarder gets a chance to put it on the wire.
const EVICTION_FLUSH_GRACE: Duration = Duration::from_millis(100);

pub struct HealthMonitor {
    state: Arc<ServerState>,
}

impl HealthMonitor {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.state.config.health.enabled {
            info!("health monitor disabled by configuration");
            return;
        }
        let mut ticker = tokio::time::interval(self.state.config.health.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = ?self.state.config.health.tick_interval,
            threshold = self.state.config.health.miss_threshold,
            "health monitor started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("health monitor stopped");
    }

    async fn tick(&self) {
        let threshold = self.state.config.health.miss_threshold;
        let mut evictions: Vec<(u32, u64)> = Vec::new();
        for ctx in self.state.registry.live_contexts() {
            // Contexts are counted only once the client has answered the
            // first ping; an open still in flight never accrues misses.
            if !ctx.health_tracked || !ctx.health_armed() || ctx.is_aborting() {
                continue;
            }
            let missed = ctx.health_tick();
            if missed > threshold {
                warn!(
                    slot = ctx.slot,
                    pid = ctx.peer_pid,
                    group = ctx.peer_group,
                    missed,
                    "client missed too many heartbeats"
                );
                if !evictions.contains(&(ctx.peer_pid, ctx.peer_group)) {
                    evictions.push((ctx.peer_pid, ctx.peer_group));
                }
            } else {
                if missed > 0 {
                    debug!(slot = ctx.slot, missed, "heartbeat miss");
                }
                ctx.events.enqueue(Event::health_ping());
            }
        }
        for (pid, group) in evictions {
            self.evict_group(pid, group).await;
        }
    }

    /// Evicts every context of one client group: an error event is queued to
    /// each so surviving delivery paths can report the reason, then the
    /// contexts are torn down.
    async fn evict_group(&self, pid: u32, group: u64) {
        let victims: Vec<_> = self
            .state
            .registry
            .live_contexts()
            .into_iter()
            .filter(|c| c.peer_pid == pid && c.peer_group == group)
            .collect();
        warn!(
            pid,
            group,
            contexts = victims.len(),
            "evicting unresponsive client group"
        );
        for ctx in &victims {
            ctx.events.enqueue(Event::error(ResultCode::Timeout));
        }
        tokio::time::sleep(EVICTION_FLUSH_GRACE).await;
        for ctx in victims {
            ctx.teardown(&self.state).await;
        }
    }
}
