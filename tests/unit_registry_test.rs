// tests/unit_registry_test.rs

use camhub::server::{HandleState, Registry, ServerContext};

fn make_ctx(slot: usize, pid: u32, tracked: bool) -> std::sync::Arc<ServerContext> {
    ServerContext::new(slot, pid, 0xAB, 0x0102, 2 + slot as u32 * 4, 4, tracked, 16)
}

#[test]
fn allocate_fills_slots_in_order_until_exhaustion() {
    let registry = Registry::new(2);
    let a = registry.allocate(|slot| make_ctx(slot, 100, false)).unwrap();
    let b = registry.allocate(|slot| make_ctx(slot, 101, false)).unwrap();
    assert_eq!(a.slot, 0);
    assert_eq!(b.slot, 1);
    assert_eq!(registry.live_count(), 2);

    let err = registry.allocate(|slot| make_ctx(slot, 102, false)).unwrap_err();
    assert_eq!(err, camhub::core::errors::CamHubError::NoResources);
}

#[test]
fn freed_slot_is_reused() {
    let registry = Registry::new(2);
    let a = registry.allocate(|slot| make_ctx(slot, 100, false)).unwrap();
    let _b = registry.allocate(|slot| make_ctx(slot, 101, false)).unwrap();
    registry.free(a.slot);
    assert_eq!(registry.live_count(), 1);

    let c = registry.allocate(|slot| make_ctx(slot, 102, false)).unwrap();
    assert_eq!(c.slot, 0);
}

#[test]
fn free_is_idempotent_and_bounds_checked() {
    let registry = Registry::new(1);
    let ctx = registry.allocate(|slot| make_ctx(slot, 100, false)).unwrap();
    registry.free(ctx.slot);
    registry.free(ctx.slot);
    registry.free(99);
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn find_by_handle_matches_open_contexts_only() {
    let registry = Registry::new(2);
    let a = registry.allocate(|slot| make_ctx(slot, 100, false)).unwrap();
    let b = registry.allocate(|slot| make_ctx(slot, 101, false)).unwrap();

    // A freshly allocated context has no engine handle yet.
    assert_eq!(a.handle(), HandleState::Allocated);
    assert!(registry.find_by_handle(7).is_none());

    b.set_open(7);
    let found = registry.find_by_handle(7).unwrap();
    assert_eq!(found.slot, b.slot);
}

#[test]
fn take_handle_detaches_exactly_once() {
    let ctx = make_ctx(0, 100, false);
    ctx.set_open(42);
    assert!(ctx.expect_open(42).is_ok());
    assert_eq!(ctx.take_handle(), Some(42));
    assert_eq!(ctx.take_handle(), None);
    assert_eq!(ctx.handle(), HandleState::Free);
    assert!(ctx.expect_open(42).is_err());
}

#[test]
fn handle_validation_rejects_foreign_handles() {
    let ctx = make_ctx(0, 100, false);
    assert!(ctx.expect_closed().is_ok());
    ctx.set_open(5);
    assert!(ctx.expect_closed().is_err());
    assert!(ctx.expect_open(6).is_err());
}

#[test]
fn health_counters_arm_and_accumulate() {
    let ctx = make_ctx(0, 100, true);
    assert!(!ctx.health_armed());
    ctx.enable_health();
    assert!(ctx.health_armed());

    // Heard from: miss count stays at zero.
    ctx.mark_signal();
    assert_eq!(ctx.health_tick(), 0);
    // Silent ticks accumulate.
    assert_eq!(ctx.health_tick(), 1);
    assert_eq!(ctx.health_tick(), 2);
    // A signal resets the streak.
    ctx.mark_signal();
    assert_eq!(ctx.health_tick(), 0);
    assert_eq!(ctx.health_tick(), 1);
}
