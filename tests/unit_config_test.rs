// tests/unit_config_test.rs

use std::io::Write;
use std::time::Duration;

use camhub::client::ClientConfig;
use camhub::config::Config;

#[test]
fn defaults_are_sane() {
    let config = Config::default();
    assert_eq!(config.rendezvous_id, 1);
    assert_eq!(config.registry.max_contexts, 16);
    assert_eq!(config.registry.work_connections, 2);
    assert!(config.health.enabled);
    assert_eq!(config.health.miss_threshold, 3);
    assert_eq!(config.events.queue_capacity, 64);
    assert_eq!(config.conns_per_context(), 4);
}

#[test]
fn conn_ranges_are_disjoint_per_slot() {
    let config = Config::default();
    let (base0, count0) = config.conn_range_for_slot(0);
    let (base1, _) = config.conn_range_for_slot(1);
    // The rendezvous id itself is never inside a private range.
    assert!(base0 > config.rendezvous_id);
    assert_eq!(base1, base0 + count0);
}

#[test]
fn validate_and_fix_clamps_degenerate_values() {
    let mut config = Config::default();
    config.registry.max_contexts = 0;
    config.registry.work_connections = 0;
    config.health.miss_threshold = 0;
    config.health.tick_interval = Duration::from_millis(1);
    config.events.queue_capacity = 0;
    config.validate_and_fix();

    assert_eq!(config.registry.max_contexts, 1);
    assert_eq!(config.registry.work_connections, 1);
    assert_eq!(config.health.miss_threshold, 1);
    assert_eq!(config.health.tick_interval, Duration::from_millis(50));
    assert_eq!(config.events.queue_capacity, 8);
}

#[test]
fn from_file_parses_partial_toml_with_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
socket_dir = "/tmp/camhub-test"
rendezvous_id = 7

[registry]
max_contexts = 4

[health]
tick_interval = "250ms"
miss_threshold = 5

[timeouts]
command = "2s"
"#
    )
    .unwrap();

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.rendezvous_id, 7);
    assert_eq!(config.registry.max_contexts, 4);
    // Unspecified fields fall back to defaults.
    assert_eq!(config.registry.work_connections, 2);
    assert_eq!(config.health.tick_interval, Duration::from_millis(250));
    assert_eq!(config.health.miss_threshold, 5);
    assert_eq!(config.timeouts.command, Duration::from_secs(2));
    assert_eq!(config.timeouts.recv, Duration::from_millis(500));
}

#[test]
fn client_config_derives_from_a_loaded_server_config() {
    let mut config = Config::default();
    config.socket_dir = "/tmp/camhub-shared".into();
    config.rendezvous_id = 9;
    config.timeouts.connect_retry_for = Duration::from_secs(1);
    config.timeouts.command = Duration::from_secs(2);
    config.timeouts.event_poll = Duration::from_millis(100);
    config.health.ack_timeout = Duration::from_millis(750);
    config.events.queue_capacity = 32;

    let client = ClientConfig::from(&config);
    assert_eq!(client.socket_dir, config.socket_dir);
    assert_eq!(client.rendezvous_id, 9);
    assert_eq!(client.connect_retry_for, Duration::from_secs(1));
    assert_eq!(client.command_timeout, Duration::from_secs(2));
    assert_eq!(client.event_poll, Duration::from_millis(100));
    assert_eq!(client.first_ping_timeout, Duration::from_millis(750));
    assert_eq!(client.event_queue_capacity, 32);
}

#[test]
fn from_file_rejects_malformed_toml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "rendezvous_id = \"not a number\"").unwrap();
    assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
}

#[test]
fn from_file_reports_missing_file() {
    assert!(Config::from_file("/nonexistent/camhub.toml").is_err());
}
