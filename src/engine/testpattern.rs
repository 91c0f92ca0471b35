// src/engine/testpattern.rs

//! A deterministic stand-in engine that synthesizes frames at a fixed rate.
//! Used by the server binary when no real engine is linked in, and by the
//! test suite.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::errors::CamHubError;
use crate::core::protocol::{Event, EventPayload};
use crate::engine::{CameraEngine, EngineBuffer, EngineHandle, FrameInfo};

struct Session {
    descriptor: u32,
    params: HashMap<u32, u64>,
    buffer_len: u64,
    frame_counter: u32,
    started: bool,
    paused: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
    emitter: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    next_handle: EngineHandle,
    sessions: HashMap<EngineHandle, Session>,
}

pub struct TestPatternEngine {
    inputs: Vec<u32>,
    frame_interval: Duration,
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl TestPatternEngine {
    pub fn new(inputs: Vec<u32>, frame_interval: Duration) -> Self {
        Self {
            inputs,
            frame_interval,
            epoch: Instant::now(),
            inner: Mutex::new(Inner {
                next_handle: 1,
                sessions: HashMap::new(),
            }),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn with_session<R>(
        &self,
        handle: EngineHandle,
        f: impl FnOnce(&mut Session) -> Result<R, CamHubError>,
    ) -> Result<R, CamHubError> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.get_mut(&handle).ok_or(CamHubError::BadHandle)?;
        f(session)
    }
}

impl Default for TestPatternEngine {
    fn default() -> Self {
        Self::new(vec![0, 1, 2, 3], Duration::from_millis(10))
    }
}

#[async_trait]
impl CameraEngine for TestPatternEngine {
    async fn query_inputs(&self) -> Result<Vec<u32>, CamHubError> {
        Ok(self.inputs.clone())
    }

    async fn open(&self, descriptor: u32) -> Result<EngineHandle, CamHubError> {
        if !self.inputs.contains(&descriptor) {
            return Err(CamHubError::BadParameter(format!(
                "no input with descriptor {descriptor}"
            )));
        }
        let mut inner = self.inner.lock();
        if inner.sessions.values().any(|s| s.descriptor == descriptor) {
            return Err(CamHubError::BadState(format!(
                "input {descriptor} is already open"
            )));
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(Event::new(EventPayload::InputSignal {
            input: descriptor,
            present: true,
        }));
        inner.sessions.insert(
            handle,
            Session {
                descriptor,
                params: HashMap::new(),
                buffer_len: 0,
                frame_counter: 0,
                started: false,
                paused: false,
                events_tx,
                events_rx: Some(events_rx),
                emitter: None,
            },
        );
        debug!(handle, descriptor, "test-pattern input opened");
        Ok(handle)
    }

    async fn close(&self, handle: EngineHandle) -> Result<(), CamHubError> {
        let session = self
            .inner
            .lock()
            .sessions
            .remove(&handle)
            .ok_or(CamHubError::BadHandle)?;
        if let Some(task) = session.emitter {
            task.abort();
        }
        debug!(handle, "test-pattern input closed");
        Ok(())
    }

    async fn get_param(&self, handle: EngineHandle, param: u32) -> Result<u64, CamHubError> {
        self.with_session(handle, |s| Ok(s.params.get(&param).copied().unwrap_or(0)))
    }

    async fn set_param(
        &self,
        handle: EngineHandle,
        param: u32,
        value: u64,
    ) -> Result<(), CamHubError> {
        self.with_session(handle, |s| {
            s.params.insert(param, value);
            Ok(())
        })
    }

    async fn set_buffers(
        &self,
        handle: EngineHandle,
        buffers: Vec<EngineBuffer>,
    ) -> Result<(), CamHubError> {
        self.with_session(handle, |s| {
            if s.started {
                return Err(CamHubError::BadState(
                    "cannot replace buffers while streaming".to_string(),
                ));
            }
            s.buffer_len = buffers.first().map(|b| b.size).unwrap_or(0);
            Ok(())
        })
    }

    async fn start(&self, handle: EngineHandle) -> Result<(), CamHubError> {
        let (events_tx, interval, epoch_ns) = self.with_session(handle, |s| {
            if s.started {
                return Err(CamHubError::BadState("already streaming".to_string()));
            }
            s.started = true;
            s.paused = false;
            Ok((s.events_tx.clone(), self.frame_interval, self.now_ns()))
        })?;
        // Frame-ready notifications are emitted independently of get-frame
        // consumption, like a free-running sensor.
        let emitter = tokio::spawn(async move {
            let mut index = 0u32;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let event = Event::new(EventPayload::FrameReady {
                    index,
                    timestamp_ns: epoch_ns + index as u64 * interval.as_nanos() as u64,
                });
                if events_tx.send(event).is_err() {
                    break;
                }
                index = index.wrapping_add(1);
            }
        });
        self.with_session(handle, |s| {
            s.emitter = Some(emitter);
            Ok(())
        })
    }

    async fn stop(&self, handle: EngineHandle) -> Result<(), CamHubError> {
        self.with_session(handle, |s| {
            if !s.started {
                return Err(CamHubError::BadState("not streaming".to_string()));
            }
            s.started = false;
            s.paused = false;
            if let Some(task) = s.emitter.take() {
                task.abort();
            }
            Ok(())
        })
    }

    async fn pause(&self, handle: EngineHandle) -> Result<(), CamHubError> {
        self.with_session(handle, |s| {
            if !s.started {
                return Err(CamHubError::BadState("not streaming".to_string()));
            }
            s.paused = true;
            Ok(())
        })
    }

    async fn resume(&self, handle: EngineHandle) -> Result<(), CamHubError> {
        self.with_session(handle, |s| {
            if !s.started {
                return Err(CamHubError::BadState("not streaming".to_string()));
            }
            s.paused = false;
            Ok(())
        })
    }

    async fn get_frame(
        &self,
        handle: EngineHandle,
        timeout: Duration,
        _flags: u32,
    ) -> Result<FrameInfo, CamHubError> {
        let paused = self.with_session(handle, |s| {
            if !s.started {
                return Err(CamHubError::BadState("not streaming".to_string()));
            }
            Ok(s.paused)
        })?;
        if paused {
            tokio::time::sleep(timeout).await;
            return Err(CamHubError::Timeout);
        }
        let wait = self.frame_interval.min(timeout);
        tokio::time::sleep(wait).await;
        self.with_session(handle, |s| {
            let index = s.frame_counter;
            s.frame_counter = s.frame_counter.wrapping_add(1);
            Ok(FrameInfo {
                index,
                timestamp_ns: self.now_ns(),
                len: s.buffer_len,
            })
        })
    }

    async fn release_frame(&self, handle: EngineHandle, index: u32) -> Result<(), CamHubError> {
        self.with_session(handle, |s| {
            if index >= s.frame_counter {
                return Err(CamHubError::BadParameter(format!(
                    "frame {index} was never delivered"
                )));
            }
            Ok(())
        })
    }

    fn take_event_stream(&self, handle: EngineHandle) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.inner
            .lock()
            .sessions
            .get_mut(&handle)
            .and_then(|s| s.events_rx.take())
    }
}
