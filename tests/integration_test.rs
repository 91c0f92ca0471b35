// tests/integration_test.rs

//! Whole-stack tests: a real server with the test-pattern engine and real
//! clients over Unix sockets in a private temporary directory.

use std::io::Write;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use camhub::client::{CamClient, ClientConfig, ClientOptions};
use camhub::config::Config;
use camhub::core::errors::{CamHubError, ResultCode};
use camhub::core::protocol::{
    CLIENT_API_VERSION, CapabilityFlags, CommandMessage, CommandParams, Event, EventKind,
    EventPayload, HandshakeRecord,
};
use camhub::engine::TestPatternEngine;
use camhub::server::Server;
use camhub::transport::{Connection, UnixTransport};

struct TestBed {
    _dir: tempfile::TempDir,
    server: Server,
    client_config: ClientConfig,
}

async fn start_server(tweak: impl FnOnce(&mut Config)) -> TestBed {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config {
        socket_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);
    config.validate_and_fix();
    let client_config = ClientConfig::from(&config);
    let engine = Arc::new(TestPatternEngine::default());
    let server = Server::start(config, engine).await.expect("server start");
    TestBed {
        _dir: dir,
        server,
        client_config,
    }
}

fn frame_buffers(count: usize, size: u64) -> Vec<std::fs::File> {
    (0..count)
        .map(|i| {
            let mut f = tempfile::tempfile().unwrap();
            writeln!(f, "buffer {i}").unwrap();
            f.set_len(size).unwrap();
            f
        })
        .collect()
}

#[tokio::test]
async fn full_session_lifecycle() {
    let bed = start_server(|_| {}).await;
    let client = CamClient::new(bed.client_config.clone());

    let mut session = client
        .open(3, ClientOptions::default())
        .await
        .expect("open");
    assert!(session.handle() != 0);
    assert!(session.is_health_tracked());
    // The first heartbeat round trip completed during open; the local
    // liveness flag is consumed by reading it.
    assert!(session.take_signal_received());
    assert!(!session.take_signal_received());
    let mut events = session.events().expect("event stream");
    assert!(session.events().is_none());

    assert_eq!(session.query_inputs().await.unwrap(), vec![0, 1, 2, 3]);

    session.set_param(0x10, 77).await.unwrap();
    assert_eq!(session.get_param(0x10).await.unwrap(), 77);
    assert_eq!(session.get_param(0x11).await.unwrap(), 0);

    let files = frame_buffers(4, 4096);
    let handles: Vec<_> = files.iter().map(|f| (f.as_fd(), 4096u64)).collect();
    session.set_buffers(&handles).await.unwrap();

    session.start().await.unwrap();
    let frame = session
        .get_frame(Duration::from_millis(500), 0)
        .await
        .unwrap();
    assert_eq!(frame.len, 4096);
    session.release_frame(frame.index).await.unwrap();

    session.pause().await.unwrap();
    let err = session
        .get_frame(Duration::from_millis(100), 0)
        .await
        .unwrap_err();
    assert_eq!(err, CamHubError::Timeout);
    session.resume().await.unwrap();
    let _ = session.get_frame(Duration::from_millis(500), 0).await.unwrap();

    // The engine's signal-lock event and free-running frame notifications
    // arrive on the event stream; heartbeat pings never do.
    let mut saw_signal = false;
    let mut saw_frame = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !(saw_signal && saw_frame) && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Some(event)) => match event.payload {
                EventPayload::InputSignal { input, present } => {
                    assert_eq!((input, present), (3, true));
                    saw_signal = true;
                }
                EventPayload::FrameReady { .. } => saw_frame = true,
                EventPayload::HealthPing => panic!("ping leaked to the application"),
                EventPayload::Error { .. } => {}
            },
            _ => break,
        }
    }
    assert!(saw_signal, "input-signal event never arrived");
    assert!(saw_frame, "frame-ready event never arrived");

    session.stop().await.unwrap();
    session.close().await.unwrap();
    // Close is idempotent and later commands fail cleanly.
    session.close().await.unwrap();
    assert!(matches!(
        session.start().await.unwrap_err(),
        CamHubError::BadState(_)
    ));

    bed.server.shutdown().await;
}

#[tokio::test]
async fn open_rejects_unknown_descriptor() {
    let bed = start_server(|_| {}).await;
    let client = CamClient::new(bed.client_config.clone());
    let err = client
        .open(99, ClientOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CamHubError::BadParameter(_)));
    // The failed open released its slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bed.server.state.registry.live_count(), 0);
    bed.server.shutdown().await;
}

#[tokio::test]
async fn registry_exhaustion_and_slot_reuse() {
    let bed = start_server(|c| c.registry.max_contexts = 1).await;
    let client = CamClient::new(bed.client_config.clone());

    let mut first = client
        .open(0, ClientOptions { health_tracked: false })
        .await
        .unwrap();
    let err = client
        .open(1, ClientOptions { health_tracked: false })
        .await
        .unwrap_err();
    assert_eq!(err, CamHubError::NoResources);

    first.close().await.unwrap();
    // The server frees the slot just after acknowledging the close.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while bed.server.state.registry.live_count() != 0
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // The freed slot (and its connection-id range) is reusable.
    let mut second = client
        .open(1, ClientOptions { health_tracked: false })
        .await
        .expect("slot reuse after close");
    second.close().await.unwrap();
    bed.server.shutdown().await;
}

#[tokio::test]
async fn second_tracked_request_is_degraded() {
    let bed = start_server(|_| {}).await;
    let client = CamClient::new(bed.client_config.clone());

    let session_a = client.open(0, ClientOptions::default()).await.unwrap();
    assert!(session_a.is_health_tracked());
    let session_b = client.open(1, ClientOptions::default()).await.unwrap();
    assert!(!session_b.is_health_tracked());

    drop(session_a);
    drop(session_b);
    bed.server.shutdown().await;
}

#[tokio::test]
async fn dropping_a_session_frees_the_server_slot() {
    let bed = start_server(|_| {}).await;
    let client = CamClient::new(bed.client_config.clone());
    let session = client
        .open(2, ClientOptions { health_tracked: false })
        .await
        .unwrap();
    assert_eq!(bed.server.state.registry.live_count(), 1);
    drop(session);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while bed.server.state.registry.live_count() != 0
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(bed.server.state.registry.live_count(), 0);
    bed.server.shutdown().await;
}

/// Raw-protocol client half, for scenarios the library client cannot
/// misbehave into.
mod raw {
    use super::*;

    pub async fn rendezvous(
        transport: &UnixTransport,
        config: &ClientConfig,
        flags: CapabilityFlags,
        peer_version: u16,
    ) -> (Connection, HandshakeRecord) {
        let rdv = Connection::new(config.rendezvous_id, 1);
        rdv.connect(transport, Duration::from_secs(1)).await.unwrap();
        let record = HandshakeRecord {
            conn_id: 0,
            conn_count: 0,
            group_id: 0x51DE_CA5E,
            pid: std::process::id(),
            peer_version,
            lib_version: CLIENT_API_VERSION,
            result: ResultCode::Ok,
            flags,
        };
        rdv.send(&record.encode()).await.unwrap();
        let frame = rdv.recv(Duration::from_secs(2)).await.unwrap();
        let reply = HandshakeRecord::decode(&frame).unwrap();
        (rdv, reply)
    }

    pub async fn exchange(conn: &Connection, params: CommandParams) -> CommandMessage {
        let request = CommandMessage::request(params);
        conn.send(&request.encode()).await.unwrap();
        let frame = conn.recv(Duration::from_secs(2)).await.unwrap();
        let reply = CommandMessage::decode(&frame).unwrap();
        reply.correlate(request.kind()).unwrap();
        reply
    }
}

#[tokio::test]
async fn unsupported_version_is_rejected_at_rendezvous() {
    let bed = start_server(|_| {}).await;
    let transport = UnixTransport::new(&bed.client_config.socket_dir);
    let (rdv, reply) = raw::rendezvous(
        &transport,
        &bed.client_config,
        CapabilityFlags::empty(),
        0x0099,
    )
    .await;
    assert_eq!(reply.result, ResultCode::VersionUnsupported);
    rdv.close();
    assert_eq!(bed.server.state.registry.live_count(), 0);
    bed.server.shutdown().await;
}

#[tokio::test]
async fn whitelisted_older_version_is_served() {
    let bed = start_server(|_| {}).await;
    let transport = UnixTransport::new(&bed.client_config.socket_dir);
    let (rdv, reply) = raw::rendezvous(
        &transport,
        &bed.client_config,
        CapabilityFlags::empty(),
        0x0100,
    )
    .await;
    assert_eq!(reply.result, ResultCode::Ok);
    assert!(reply.conn_id > bed.client_config.rendezvous_id);
    assert_eq!(reply.conn_count, 4);
    rdv.close();
    bed.server.shutdown().await;
}

#[tokio::test]
async fn acking_tracked_client_is_never_evicted() {
    let bed = start_server(|c| {
        c.health.tick_interval = Duration::from_millis(100);
        c.health.miss_threshold = 1;
    })
    .await;
    let client = CamClient::new(bed.client_config.clone());
    let session = client.open(0, ClientOptions::default()).await.unwrap();
    assert!(session.is_health_tracked());

    // Several thresholds' worth of ticks pass while the delivery task keeps
    // answering pings; the context must stay live throughout.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bed.server.state.registry.live_count(), 1);
    }
    assert!(session.take_signal_received());
    assert_eq!(session.get_param(0x11).await.unwrap(), 0);

    drop(session);
    bed.server.shutdown().await;
}

#[tokio::test]
async fn failed_work_listener_open_releases_the_connection_range() {
    let bed = start_server(|_| {}).await;
    let transport = UnixTransport::new(&bed.client_config.socket_dir);

    let (rdv, reply) = raw::rendezvous(
        &transport,
        &bed.client_config,
        CapabilityFlags::empty(),
        CLIENT_API_VERSION,
    )
    .await;
    assert_eq!(reply.result, ResultCode::Ok);
    rdv.close();

    let main = Connection::new(reply.conn_id, 1);
    main.connect(&transport, Duration::from_secs(1)).await.unwrap();
    let event = Connection::new(reply.conn_id + 1, 1);
    event.connect(&transport, Duration::from_secs(1)).await.unwrap();

    // Squat on the last work-connection id so the server's listener setup
    // fails after some listeners have already come up.
    let squatter = Connection::new(reply.conn_id + reply.conn_count - 1, 1);
    squatter.open(&transport).await.unwrap();

    let failed = raw::exchange(
        &main,
        CommandParams::Open {
            descriptor: 0,
            handle: 0,
            work_connections: 0,
        },
    )
    .await;
    assert_eq!(failed.result, ResultCode::Failed);
    squatter.close();

    // With the squatter gone, a retry on the same context must reclaim the
    // ids the aborted attempt had claimed. The aborted listeners unlink
    // asynchronously, so poll until the retry goes through.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let retry = raw::exchange(
            &main,
            CommandParams::Open {
                descriptor: 0,
                handle: 0,
                work_connections: 0,
            },
        )
        .await;
        if retry.result == ResultCode::Ok {
            break;
        }
        assert_eq!(retry.result, ResultCode::Failed);
        assert!(
            tokio::time::Instant::now() < deadline,
            "open retry never succeeded after the listener ids were freed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    main.close();
    event.close();
    bed.server.shutdown().await;
}

#[tokio::test]
async fn silent_tracked_client_is_evicted() {
    let bed = start_server(|c| {
        c.health.tick_interval = Duration::from_millis(100);
        c.health.miss_threshold = 1;
    })
    .await;
    let transport = UnixTransport::new(&bed.client_config.socket_dir);

    let (rdv, reply) = raw::rendezvous(
        &transport,
        &bed.client_config,
        CapabilityFlags::HEALTH_TRACKED,
        CLIENT_API_VERSION,
    )
    .await;
    assert_eq!(reply.result, ResultCode::Ok);
    assert!(reply.flags.contains(CapabilityFlags::HEALTH_TRACKED));
    rdv.close();

    let main = Connection::new(reply.conn_id, 1);
    main.connect(&transport, Duration::from_secs(1)).await.unwrap();
    let event = Connection::new(reply.conn_id + 1, 1);
    event.connect(&transport, Duration::from_secs(1)).await.unwrap();

    let opened = raw::exchange(
        &main,
        CommandParams::Open {
            descriptor: 0,
            handle: 0,
            work_connections: 0,
        },
    )
    .await;
    assert_eq!(opened.result, ResultCode::Ok);
    let CommandParams::Open { handle, .. } = opened.params else {
        unreachable!()
    };

    // Answer exactly one ping to arm the monitor, then go silent.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no ping arrived");
        let frame = event.recv(Duration::from_millis(500)).await;
        let Ok(frame) = frame else { continue };
        let ev = Event::decode(&frame).unwrap();
        if ev.kind() == EventKind::HealthPing {
            let ack = raw::exchange(&main, CommandParams::HealthAck { handle }).await;
            assert_eq!(ack.result, ResultCode::Ok);
            break;
        }
    }

    // The monitor must report the eviction on the event connection before
    // tearing the context down.
    let mut saw_timeout_error = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match event.recv(Duration::from_millis(500)).await {
            Ok(frame) => {
                let ev = Event::decode(&frame).unwrap();
                if let EventPayload::Error { code } = ev.payload {
                    assert_eq!(code, ResultCode::Timeout);
                    saw_timeout_error = true;
                    break;
                }
            }
            Err(CamHubError::Timeout) => continue,
            Err(_) => break,
        }
    }
    assert!(saw_timeout_error, "eviction error event never arrived");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while bed.server.state.registry.live_count() != 0
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(bed.server.state.registry.live_count(), 0);
    bed.server.shutdown().await;
}
