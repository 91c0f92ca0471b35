// src/config.rs

//! Manages server configuration: loading, defaulting, and validation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// Sizing of the context registry and per-context connection fan-out.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegistryConfig {
    /// Fixed capacity of the context arena.
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,
    /// Work (per-stream) command connections spawned per open context.
    #[serde(default = "default_work_connections")]
    pub work_connections: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_contexts: default_max_contexts(),
            work_connections: default_work_connections(),
        }
    }
}

fn default_max_contexts() -> usize {
    16
}
fn default_work_connections() -> u32 {
    2
}

/// Every blocking operation in the arbiter is bounded by one of these, so
/// shutdown is always observable within one timeout interval.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutConfig {
    /// How long `connect` keeps retrying a peer that is not yet listening.
    #[serde(with = "humantime_serde", default = "default_connect_retry_for")]
    pub connect_retry_for: Duration,
    /// Receive-loop wakeup interval on command and event connections.
    #[serde(with = "humantime_serde", default = "default_recv")]
    pub recv: Duration,
    /// Bound on the rendezvous handshake and main/event accept phase.
    #[serde(with = "humantime_serde", default = "default_handshake")]
    pub handshake: Duration,
    /// Client-side bound on one command/response exchange.
    #[serde(with = "humantime_serde", default = "default_command")]
    pub command: Duration,
    /// Bound on one buffer-handle import.
    #[serde(with = "humantime_serde", default = "default_import")]
    pub import: Duration,
    /// Event Channel dequeue interval for the delivery/forwarding tasks.
    #[serde(with = "humantime_serde", default = "default_event_poll")]
    pub event_poll: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_retry_for: default_connect_retry_for(),
            recv: default_recv(),
            handshake: default_handshake(),
            command: default_command(),
            import: default_import(),
            event_poll: default_event_poll(),
        }
    }
}

fn default_connect_retry_for() -> Duration {
    Duration::from_secs(3)
}
fn default_recv() -> Duration {
    Duration::from_millis(500)
}
fn default_handshake() -> Duration {
    Duration::from_secs(2)
}
fn default_command() -> Duration {
    Duration::from_secs(5)
}
fn default_import() -> Duration {
    Duration::from_secs(2)
}
fn default_event_poll() -> Duration {
    Duration::from_millis(250)
}

/// Heartbeat protocol tuning. The false-positive window is
/// `miss_threshold * tick_interval` and must sit well above worst-case
/// scheduling jitter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Consecutive missed pings tolerated before eviction.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Client-side bound on the first ping/ack round trip during open.
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            tick_interval: default_tick_interval(),
            miss_threshold: default_miss_threshold(),
            ack_timeout: default_ack_timeout(),
        }
    }
}

fn default_health_enabled() -> bool {
    true
}
fn default_tick_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_miss_threshold() -> u32 {
    3
}
fn default_ack_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Event Channel sizing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventConfig {
    /// Capacity of each priority sub-queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Directory holding the rendezvous and per-context sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Well-known rendezvous connection id.
    #[serde(default = "default_rendezvous_id")]
    pub rendezvous_id: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub events: EventConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            rendezvous_id: default_rendezvous_id(),
            log_level: default_log_level(),
            registry: RegistryConfig::default(),
            timeouts: TimeoutConfig::default(),
            health: HealthConfig::default(),
            events: EventConfig::default(),
        }
    }
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/camhub")
}
fn default_rendezvous_id() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let mut config: Config =
            toml::from_str(&raw).with_context(|| format!("failed to parse config file '{path}'"))?;
        config.validate_and_fix();
        Ok(config)
    }

    /// Clamps out-of-range values instead of refusing to start, logging what
    /// was adjusted.
    pub fn validate_and_fix(&mut self) {
        if self.registry.max_contexts == 0 {
            warn!("registry.max_contexts of 0 is unusable; raising to 1");
            self.registry.max_contexts = 1;
        }
        if self.registry.work_connections == 0 {
            warn!("registry.work_connections of 0 is unusable; raising to 1");
            self.registry.work_connections = 1;
        }
        if self.health.miss_threshold == 0 {
            warn!("health.miss_threshold of 0 would evict on the first tick; raising to 1");
            self.health.miss_threshold = 1;
        }
        if self.health.tick_interval < Duration::from_millis(50) {
            warn!(
                "health.tick_interval below 50ms is inside scheduling jitter; raising to 50ms"
            );
            self.health.tick_interval = Duration::from_millis(50);
        }
        if self.events.queue_capacity < 8 {
            warn!("events.queue_capacity below 8 drops events too eagerly; raising to 8");
            self.events.queue_capacity = 8;
        }
    }

    /// Connection ids per context: main + event + work connections.
    pub fn conns_per_context(&self) -> u32 {
        2 + self.registry.work_connections
    }

    /// The private connection-id range assigned to the context in `slot`.
    pub fn conn_range_for_slot(&self, slot: usize) -> (u32, u32) {
        let count = self.conns_per_context();
        let base = self.rendezvous_id + 1 + slot as u32 * count;
        (base, count)
    }
}
