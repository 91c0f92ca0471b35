// tests/unit_protocol_test.rs

use camhub::core::errors::{CamHubError, ResultCode};
use camhub::core::protocol::{
    CLIENT_API_VERSION, CapabilityFlags, CommandKind, CommandMessage, CommandParams, Event,
    EventKind, EventPayload, HandshakeRecord, MAX_INPUTS, MAX_MESSAGE_LEN,
};

#[test]
fn command_round_trip_preserves_fields() {
    let msg = CommandMessage::request(CommandParams::GetFrame {
        handle: 7,
        timeout_ms: 250,
        flags: 0x1,
        index: 0,
        timestamp_ns: 0,
        len: 0,
    });
    let wire = msg.encode();
    assert!(wire.len() <= MAX_MESSAGE_LEN);
    let decoded = CommandMessage::decode(&wire).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.kind(), CommandKind::GetFrame);
}

#[test]
fn response_overwrites_result_in_place() {
    let mut msg = CommandMessage::request(CommandParams::Start { handle: 3 });
    msg.result = ResultCode::BadState;
    let decoded = CommandMessage::decode(&msg.encode()).unwrap();
    assert_eq!(decoded.result, ResultCode::BadState);
    assert_eq!(decoded.result.into_result().unwrap_err().to_string(),
        CamHubError::BadState("rejected by peer".to_string()).to_string());
}

#[test]
fn correlate_rejects_kind_mismatch() {
    let reply = CommandMessage::request(CommandParams::Stop { handle: 1 });
    assert!(reply.correlate(CommandKind::Stop).is_ok());
    let err = reply.correlate(CommandKind::Start).unwrap_err();
    assert!(matches!(err, CamHubError::ProtocolViolation(_)));
}

#[test]
fn unknown_command_kind_is_a_protocol_violation() {
    let mut wire = CommandMessage::request(CommandParams::GetEvent).encode();
    wire[0] = 0xEE;
    wire[1] = 0xEE;
    assert!(matches!(
        CommandMessage::decode(&wire),
        Err(CamHubError::ProtocolViolation(_))
    ));
}

#[test]
fn truncated_parameter_block_is_rejected() {
    let wire = CommandMessage::request(CommandParams::Close { handle: 9 }).encode();
    assert!(matches!(
        CommandMessage::decode(&wire[..wire.len() - 2]),
        Err(CamHubError::ProtocolViolation(_))
    ));
}

#[test]
fn query_inputs_count_is_bounded_by_table_size() {
    let mut msg = CommandMessage::request(CommandParams::QueryInputs {
        count: 0,
        inputs: [0; MAX_INPUTS],
    })
    .encode();
    // Overwrite the count field (right after the 4-byte header).
    msg[4..8].copy_from_slice(&(MAX_INPUTS as u32 + 1).to_le_bytes());
    assert!(matches!(
        CommandMessage::decode(&msg),
        Err(CamHubError::ProtocolViolation(_))
    ));
}

#[test]
fn event_round_trip() {
    for payload in [
        EventPayload::InputSignal {
            input: 2,
            present: true,
        },
        EventPayload::FrameReady {
            index: 41,
            timestamp_ns: 1_000_000,
        },
        EventPayload::Error {
            code: ResultCode::Timeout,
        },
        EventPayload::HealthPing,
    ] {
        let mut event = Event::new(payload);
        event.seq = 99;
        let decoded = Event::decode(&event.encode()).unwrap();
        assert_eq!(decoded, event);
    }
}

#[test]
fn truncated_event_is_rejected() {
    let wire = Event::health_ping().encode();
    assert!(matches!(
        Event::decode(&wire[..wire.len() - 1]),
        Err(CamHubError::ProtocolViolation(_))
    ));
}

#[test]
fn handshake_round_trip_keeps_flags() {
    let record = HandshakeRecord {
        conn_id: 10,
        conn_count: 4,
        group_id: 0xDEAD_BEEF_CAFE,
        pid: 4242,
        peer_version: CLIENT_API_VERSION,
        lib_version: CLIENT_API_VERSION,
        result: ResultCode::Ok,
        flags: CapabilityFlags::HEALTH_TRACKED,
    };
    let decoded = HandshakeRecord::decode(&record.encode()).unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn handshake_version_gate() {
    let mut record = HandshakeRecord {
        conn_id: 0,
        conn_count: 0,
        group_id: 1,
        pid: 1,
        peer_version: 0x0100,
        lib_version: CLIENT_API_VERSION,
        result: ResultCode::Ok,
        flags: CapabilityFlags::empty(),
    };
    // Whitelisted older version passes the gate.
    assert!(record.validate_version().is_ok());
    record.peer_version = 0x0099;
    assert_eq!(
        record.validate_version().unwrap_err(),
        CamHubError::VersionUnsupported(0x0099)
    );
}

#[test]
fn work_connection_routing_covers_frame_commands_only() {
    assert!(CommandKind::GetFrame.routes_to_work_connection());
    assert!(CommandKind::ReleaseFrame.routes_to_work_connection());
    assert!(!CommandKind::Open.routes_to_work_connection());
    assert!(!CommandKind::SetBuffers.routes_to_work_connection());
}
