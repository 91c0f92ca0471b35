// src/transport/buffer_map.rs

//! Two-generation map of exported/imported buffer handles, owned exclusively
//! by a `Connection`. Raw platform handles never leave this type alive: an
//! entry's descriptor stays valid until the generation holding it is flushed.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Which release discipline `flush` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// A buffer round has completed: the generation before it is released
    /// and the just-completed set becomes the surviving (previous)
    /// generation.
    CompletedRound,
    /// Teardown: release one generation per call; `close` calls this twice
    /// to empty both.
    Teardown,
}

/// One exported-or-imported memory handle.
#[derive(Debug)]
pub struct BufferEntry {
    fd: OwnedFd,
    size: u64,
}

impl BufferEntry {
    pub fn new(fd: OwnedFd, size: u64) -> Self {
        Self { fd, size }
    }

    /// Borrowed descriptor; valid only while the owning generation is live.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Default)]
pub struct BufferMap {
    current: Vec<BufferEntry>,
    previous: Vec<BufferEntry>,
}

impl BufferMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one handle in the active generation.
    pub fn record(&mut self, fd: OwnedFd, size: u64) {
        self.current.push(BufferEntry::new(fd, size));
    }

    /// Releases one generation of entries, rotating first for a completed
    /// round so the newest set survives as `previous` until the round after
    /// it completes. Returns how many entries were released.
    pub fn flush(&mut self, mode: FlushMode) -> usize {
        if mode == FlushMode::CompletedRound {
            std::mem::swap(&mut self.current, &mut self.previous);
        }
        let released = self.current.len();
        self.current.clear();
        if mode == FlushMode::Teardown {
            std::mem::swap(&mut self.current, &mut self.previous);
        }
        released
    }

    /// Releases the active generation without rotating, leaving the
    /// surviving set untouched. Used when a buffer round aborts partway.
    pub fn discard_current(&mut self) -> usize {
        let released = self.current.len();
        self.current.clear();
        released
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn previous_len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty()
    }

    /// Raw descriptors of the active generation, oldest first.
    pub fn current_fds(&self) -> Vec<(RawFd, u64)> {
        self.current.iter().map(|e| (e.raw_fd(), e.size())).collect()
    }
}
