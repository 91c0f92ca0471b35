// src/core/events.rs

//! The Event Channel: a bounded, priority-stratified queue that decouples
//! "event arrived on the wire" from "event delivered to the application".
//!
//! The producer path never blocks: when a sub-queue is full the oldest entry
//! in that sub-queue is dropped to make room for the newest. The consumer
//! path (`dequeue`) is the only blocking operation and is always
//! timeout-bounded, so shutdown can never deadlock on an empty queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::errors::CamHubError;
use crate::core::protocol::{Event, EventKind};

/// Number of priority strata. Index 0 is scanned first.
pub const PRIORITY_LEVELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

/// Routes an event to one of the sub-queues.
pub type Classifier = dyn Fn(&Event) -> Priority + Send + Sync;

/// Errors, signal changes, and health pings must outlive frame pressure, so
/// they go to the high-priority stratum; frame-ready notifications are the
/// bulk traffic and sit at the bottom.
pub fn default_classifier(event: &Event) -> Priority {
    match event.kind() {
        EventKind::Error | EventKind::InputSignal | EventKind::HealthPing => Priority::High,
        EventKind::FrameReady => Priority::Low,
    }
}

pub struct EventChannel {
    queues: Mutex<[VecDeque<Event>; PRIORITY_LEVELS]>,
    capacity: usize,
    notify: Notify,
    seq: AtomicU64,
    classify: Box<Classifier>,
}

impl EventChannel {
    /// `capacity` bounds each sub-queue independently.
    pub fn new(capacity: usize, classify: Box<Classifier>) -> Self {
        Self {
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            classify,
        }
    }

    pub fn with_default_classifier(capacity: usize) -> Self {
        Self::new(capacity, Box::new(default_classifier))
    }

    /// Classifies and inserts. Never blocks; drops the oldest entry of the
    /// target sub-queue when it is full. Stamps the sequence counter.
    pub fn enqueue(&self, mut event: Event) {
        event.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let priority = (self.classify)(&event) as usize;
        {
            let mut queues = self.queues.lock();
            let queue = &mut queues[priority];
            if queue.len() == self.capacity {
                queue.pop_front();
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Returns the first available event, scanning sub-queues in priority
    /// order. Waits on the channel signal up to `timeout` and retries once;
    /// a wakeup without a deliverable event (see [`signal`](Self::signal))
    /// still returns `Timeout` so the caller can observe its abort flag.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Event, CamHubError> {
        if let Some(event) = self.try_dequeue() {
            return Ok(event);
        }
        if tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_err()
        {
            return Err(CamHubError::Timeout);
        }
        self.try_dequeue().ok_or(CamHubError::Timeout)
    }

    /// Non-blocking scan in priority order.
    pub fn try_dequeue(&self) -> Option<Event> {
        let mut queues = self.queues.lock();
        queues.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Wakes a blocked dequeuer without delivering an event. Used during
    /// shutdown so the delivery task observes the abort flag promptly
    /// instead of waiting out its dequeue timeout.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
