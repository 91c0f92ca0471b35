// src/server/registry.rs

//! The fixed-capacity context arena. Allocate/find/free are the only
//! mutating operations; nothing outside this module indexes the slot table.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::CamHubError;
use crate::engine::EngineHandle;
use crate::server::context::ServerContext;

/// Handle slot of one context.
///
/// `Allocated` is the in-use sentinel: the slot is claimed but the engine
/// handle is not yet known, which keeps a second allocator from reusing the
/// slot before `open` completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Free,
    Allocated,
    Open(EngineHandle),
}

pub struct Registry {
    slots: Mutex<Vec<Option<Arc<ServerContext>>>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Claims the first free slot and installs the context `build` produces
    /// for it. Fails with `NoResources` when the arena is exhausted.
    pub fn allocate<F>(&self, build: F) -> Result<Arc<ServerContext>, CamHubError>
    where
        F: FnOnce(usize) -> Arc<ServerContext>,
    {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter()
            .position(Option::is_none)
            .ok_or(CamHubError::NoResources)?;
        let ctx = build(slot);
        slots[slot] = Some(ctx.clone());
        Ok(ctx)
    }

    /// Returns the slot to the free pool. Idempotent.
    pub fn free(&self, slot: usize) {
        if let Some(entry) = self.slots.lock().get_mut(slot) {
            entry.take();
        }
    }

    pub fn find_by_handle(&self, handle: EngineHandle) -> Option<Arc<ServerContext>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|ctx| ctx.handle() == HandleState::Open(handle))
            .cloned()
    }

    /// Snapshot of every live context; taken under the registry lock and
    /// released before the caller does anything blocking.
    pub fn live_contexts(&self) -> Vec<Arc<ServerContext>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }
}
