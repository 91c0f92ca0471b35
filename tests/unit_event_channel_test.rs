// tests/unit_event_channel_test.rs

use std::time::Duration;

use camhub::core::errors::{CamHubError, ResultCode};
use camhub::core::events::{EventChannel, Priority, default_classifier};
use camhub::core::protocol::{Event, EventKind, EventPayload};

fn frame_ready(index: u32) -> Event {
    Event::new(EventPayload::FrameReady {
        index,
        timestamp_ns: 0,
    })
}

#[test]
fn classifier_routes_errors_above_frames() {
    assert_eq!(default_classifier(&Event::error(ResultCode::Failed)), Priority::High);
    assert_eq!(default_classifier(&Event::health_ping()), Priority::High);
    assert_eq!(default_classifier(&frame_ready(0)), Priority::Low);
}

#[tokio::test]
async fn dequeue_returns_higher_priority_first() {
    let chan = EventChannel::with_default_classifier(8);
    chan.enqueue(frame_ready(0));
    chan.enqueue(frame_ready(1));
    chan.enqueue(Event::error(ResultCode::Timeout));

    let first = chan.dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(first.kind(), EventKind::Error);
    let second = chan.dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(second.kind(), EventKind::FrameReady);
}

#[test]
fn full_queue_drops_oldest_of_same_priority() {
    let chan = EventChannel::with_default_classifier(2);
    chan.enqueue(frame_ready(0));
    chan.enqueue(frame_ready(1));
    chan.enqueue(frame_ready(2));

    assert_eq!(chan.len(), 2);
    let a = chan.try_dequeue().unwrap();
    let b = chan.try_dequeue().unwrap();
    match (a.payload, b.payload) {
        (
            EventPayload::FrameReady { index: ia, .. },
            EventPayload::FrameReady { index: ib, .. },
        ) => {
            assert_eq!((ia, ib), (1, 2));
        }
        other => panic!("unexpected payloads {other:?}"),
    }
}

#[test]
fn overflow_in_one_stratum_leaves_others_alone() {
    let chan = EventChannel::with_default_classifier(1);
    chan.enqueue(Event::error(ResultCode::Failed));
    chan.enqueue(frame_ready(0));
    chan.enqueue(frame_ready(1));

    // The error survives the frame-queue overflow.
    assert_eq!(chan.try_dequeue().unwrap().kind(), EventKind::Error);
    assert_eq!(chan.try_dequeue().unwrap().kind(), EventKind::FrameReady);
    assert!(chan.try_dequeue().is_none());
}

#[test]
fn sequence_numbers_are_monotonic_across_priorities() {
    let chan = EventChannel::with_default_classifier(8);
    chan.enqueue(frame_ready(0));
    chan.enqueue(Event::health_ping());
    chan.enqueue(frame_ready(1));

    let a = chan.try_dequeue().unwrap(); // ping, seq 1
    let b = chan.try_dequeue().unwrap(); // frame 0, seq 0
    let c = chan.try_dequeue().unwrap(); // frame 1, seq 2
    assert_eq!(a.seq, 1);
    assert_eq!(b.seq, 0);
    assert_eq!(c.seq, 2);
}

#[tokio::test]
async fn empty_dequeue_times_out() {
    let chan = EventChannel::with_default_classifier(4);
    let err = chan.dequeue(Duration::from_millis(20)).await.unwrap_err();
    assert_eq!(err, CamHubError::Timeout);
}

#[tokio::test]
async fn signal_wakes_a_blocked_dequeuer_without_an_event() {
    let chan = std::sync::Arc::new(EventChannel::with_default_classifier(4));
    let waker = chan.clone();
    let waiter = tokio::spawn(async move {
        chan.dequeue(Duration::from_secs(5)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    waker.signal();
    let res = waiter.await.unwrap();
    assert_eq!(res.unwrap_err(), CamHubError::Timeout);
}

#[tokio::test]
async fn enqueue_wakes_a_blocked_dequeuer() {
    let chan = std::sync::Arc::new(EventChannel::with_default_classifier(4));
    let producer = chan.clone();
    let waiter = tokio::spawn(async move { chan.dequeue(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    producer.enqueue(Event::health_ping());
    let event = waiter.await.unwrap().unwrap();
    assert_eq!(event.kind(), EventKind::HealthPing);
}
