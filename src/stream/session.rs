//! Idle/Active state of the live stream.
//!
//! All fields are read and written under one mutex. `generation` increases on
//! every camera open, so a worker or viewer holding an older generation knows
//! its session is over even if a new one has started since.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

/// Encoded multipart chunk shared by every viewer of a frame.
pub type FrameChunk = Arc<[u8]>;

pub(crate) struct Viewer {
    pub id: u64,
    pub tx: Sender<FrameChunk>,
}

pub(crate) struct SessionState {
    pub active: bool,
    /// True from camera open until the worker has released the device.
    pub device_open: bool,
    pub generation: u64,
    pub opened_at: Option<Instant>,
    /// Set once the current generation gained its first viewer.
    pub viewer_seen: bool,
    pub viewers: Vec<Viewer>,
    next_viewer_id: u64,
    pub worker: Option<JoinHandle<()>>,
}

impl SessionState {
    /// Attach a viewer with a one-frame in-flight window.
    pub fn subscribe(&mut self) -> (u64, Receiver<FrameChunk>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.next_viewer_id;
        self.next_viewer_id += 1;
        self.viewers.push(Viewer { id, tx });
        self.viewer_seen = true;
        (id, rx)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }
}

/// What the worker needs to know about viewers before processing a frame.
pub(crate) struct ViewerSnapshot {
    pub senders: Vec<(u64, Sender<FrameChunk>)>,
    pub viewer_seen: bool,
    pub opened_at: Option<Instant>,
}

/// Owned stream state plus its lock, shared by the controller, the capture
/// worker and the viewers.
pub struct StreamSession {
    state: Mutex<SessionState>,
    released: Condvar,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                active: false,
                device_open: false,
                generation: 0,
                opened_at: None,
                viewer_seen: false,
                viewers: Vec::new(),
                next_viewer_id: 0,
                worker: None,
            }),
            released: Condvar::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Number of camera opens so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn viewer_count(&self) -> usize {
        self.lock().viewers.len()
    }

    /// Block until no device is open or `timeout` elapses. Returns whether the
    /// device is released.
    pub fn wait_until_released(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .released
            .wait_timeout_while(state, timeout, |state| state.device_open)
            .unwrap_or_else(PoisonError::into_inner);
        !state.device_open
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_released<'a>(
        &self,
        guard: MutexGuard<'a, SessionState>,
    ) -> MutexGuard<'a, SessionState> {
        self.released
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.lock().is_current(generation)
    }

    pub(crate) fn viewers(&self, generation: u64) -> Option<ViewerSnapshot> {
        let state = self.lock();
        if !state.is_current(generation) {
            return None;
        }
        Some(ViewerSnapshot {
            senders: state
                .viewers
                .iter()
                .map(|viewer| (viewer.id, viewer.tx.clone()))
                .collect(),
            viewer_seen: state.viewer_seen,
            opened_at: state.opened_at,
        })
    }

    pub(crate) fn remove_viewers(&self, generation: u64, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.generation == generation {
            state.viewers.retain(|viewer| !ids.contains(&viewer.id));
        }
    }

    /// Called by the worker after it released the device.
    pub(crate) fn finish(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.active = false;
            state.device_open = false;
            state.viewers.clear();
            state.opened_at = None;
        }
        self.released.notify_all();
    }
}
