// tests/unit_buffer_map_test.rs

use std::os::fd::OwnedFd;

use camhub::transport::{BufferMap, FlushMode};

fn make_fd() -> OwnedFd {
    OwnedFd::from(tempfile::tempfile().expect("tempfile"))
}

#[test]
fn completed_round_retires_the_generation_before_last() {
    let mut map = BufferMap::new();
    map.record(make_fd(), 4096);
    map.record(make_fd(), 4096);
    // First round completes: nothing older to release.
    assert_eq!(map.flush(FlushMode::CompletedRound), 0);
    assert_eq!(map.previous_len(), 2);
    assert_eq!(map.current_len(), 0);

    // Second round: the first set is released, the new one survives.
    map.record(make_fd(), 8192);
    assert_eq!(map.flush(FlushMode::CompletedRound), 2);
    assert_eq!(map.previous_len(), 1);
    assert_eq!(map.current_len(), 0);
}

#[test]
fn teardown_twice_empties_both_generations() {
    let mut map = BufferMap::new();
    map.record(make_fd(), 1);
    assert_eq!(map.flush(FlushMode::CompletedRound), 0);
    map.record(make_fd(), 2);
    map.record(make_fd(), 3);

    assert_eq!(map.flush(FlushMode::Teardown), 2);
    assert!(!map.is_empty());
    assert_eq!(map.flush(FlushMode::Teardown), 1);
    assert!(map.is_empty());
}

#[test]
fn current_fds_reports_active_generation_in_order() {
    let mut map = BufferMap::new();
    map.record(make_fd(), 10);
    map.record(make_fd(), 20);
    let fds = map.current_fds();
    assert_eq!(fds.len(), 2);
    assert_eq!(fds[0].1, 10);
    assert_eq!(fds[1].1, 20);
    assert!(fds[0].0 >= 0 && fds[1].0 >= 0);
}

#[test]
fn discarding_an_aborted_round_keeps_the_surviving_set() {
    let mut map = BufferMap::new();
    map.record(make_fd(), 4096);
    assert_eq!(map.flush(FlushMode::CompletedRound), 0);

    // A new round starts and aborts partway; only its entries go away.
    map.record(make_fd(), 8192);
    map.record(make_fd(), 8192);
    assert_eq!(map.discard_current(), 2);
    assert_eq!(map.current_len(), 0);
    assert_eq!(map.previous_len(), 1);
}

#[test]
fn flush_on_empty_map_is_a_no_op() {
    let mut map = BufferMap::new();
    assert_eq!(map.flush(FlushMode::CompletedRound), 0);
    assert_eq!(map.flush(FlushMode::Teardown), 0);
    assert!(map.is_empty());
}
