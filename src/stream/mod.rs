//! Live camera stream.
//!
//! One capture worker per active session runs capture → detect → encode and
//! hands each multipart chunk to every attached viewer. Each viewer has a
//! one-frame window, so a slow viewer slows capture instead of queueing
//! frames. Stopping is cooperative: the worker checks the session between
//! frames and while waiting on a viewer.

pub mod mjpeg;
mod session;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError};
use serde::Serialize;

use crate::capture::{CameraDevice, CameraOpener};
use crate::detect::Detector;
use crate::error::{PipelineError, PipelineResult};
use crate::media::encode_jpeg;

pub use session::{FrameChunk, StreamSession};

use session::SessionState;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StartStatus {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "already running")]
    AlreadyRunning,
}

impl StartStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::AlreadyRunning => "already running",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StopStatus {
    #[serde(rename = "stopped")]
    Stopped,
}

impl StopStatus {
    pub fn as_str(self) -> &'static str {
        "stopped"
    }
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub jpeg_quality: u8,
    /// How long a started stream waits for its first viewer.
    pub idle_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    session: Arc<StreamSession>,
    camera: Arc<dyn CameraOpener>,
    detector: Arc<Detector>,
    options: StreamOptions,
}

/// Start/stop/subscribe entry point for the live stream.
#[derive(Clone)]
pub struct StreamController {
    shared: Arc<Shared>,
}

impl StreamController {
    pub fn new(
        camera: Arc<dyn CameraOpener>,
        detector: Arc<Detector>,
        options: StreamOptions,
    ) -> Self {
        Self::with_session(Arc::new(StreamSession::new()), camera, detector, options)
    }

    pub fn with_session(
        session: Arc<StreamSession>,
        camera: Arc<dyn CameraOpener>,
        detector: Arc<Detector>,
        options: StreamOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session,
                camera,
                detector,
                options,
            }),
        }
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.shared.session
    }

    /// Open the camera and start the capture worker unless already active.
    pub fn start_stream(&self) -> PipelineResult<StartStatus> {
        let state = self.shared.session.lock();
        let (_state, status) = self.ensure_active(state)?;
        Ok(status)
    }

    /// Ask the worker to stop. A no-op when idle.
    pub fn stop_stream(&self) -> StopStatus {
        let mut state = self.shared.session.lock();
        if state.active {
            state.active = false;
            log::info!("stream: stop requested (generation {})", state.generation);
        }
        StopStatus::Stopped
    }

    /// Attach a viewer, opening the camera first if the stream is idle.
    pub fn stream_frames(&self) -> PipelineResult<FrameStream> {
        let state = self.shared.session.lock();
        let (mut state, _) = self.ensure_active(state)?;
        let (id, rx) = state.subscribe();
        let generation = state.generation;
        log::debug!("stream: viewer {} attached (generation {})", id, generation);
        Ok(FrameStream {
            rx,
            session: self.shared.session.clone(),
            generation,
            id,
        })
    }

    /// Stop the stream and wait for the worker to exit.
    pub fn shutdown(&self) {
        self.stop_stream();
        let worker = self.shared.session.lock().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("stream worker panicked");
            }
        }
    }

    /// Check-then-open under the session lock.
    fn ensure_active<'a>(
        &self,
        mut state: std::sync::MutexGuard<'a, SessionState>,
    ) -> PipelineResult<(std::sync::MutexGuard<'a, SessionState>, StartStatus)> {
        loop {
            if state.active {
                return Ok((state, StartStatus::AlreadyRunning));
            }
            if !state.device_open {
                break;
            }
            state = self.shared.session.wait_released(state);
        }

        if let Some(previous) = state.worker.take() {
            // Its device is released; only the thread exit remains.
            if previous.join().is_err() {
                log::error!("previous stream worker panicked");
            }
        }

        let device = self.shared.camera.open().map_err(|err| {
            log::error!("stream: cannot open {}: {}", self.shared.camera.describe(), err);
            match err {
                PipelineError::Device(_) => err,
                other => PipelineError::Device(other.to_string()),
            }
        })?;

        let generation = state.generation + 1;
        let shared = self.shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("lookout-stream-{}", generation))
            .spawn(move || run_worker(shared, generation, device))
            .map_err(|err| PipelineError::Device(format!("spawn stream worker: {}", err)))?;

        state.generation = generation;
        state.active = true;
        state.device_open = true;
        state.opened_at = Some(Instant::now());
        state.viewer_seen = false;
        state.worker = Some(worker);
        log::info!(
            "stream: camera {} opened (generation {})",
            self.shared.camera.describe(),
            generation
        );
        Ok((state, StartStatus::Starting))
    }
}

/// Blocking iterator over encoded chunks for one viewer.
///
/// Ends when the stream stops, the device fails, or the worker drops this
/// viewer. No chunk is yielded once the session has left the generation the
/// viewer attached to.
pub struct FrameStream {
    rx: Receiver<FrameChunk>,
    session: Arc<StreamSession>,
    generation: u64,
    id: u64,
}

impl FrameStream {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Iterator for FrameStream {
    type Item = FrameChunk;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    return self.session.is_current(self.generation).then_some(chunk);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.session.is_current(self.generation) {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.session.remove_viewers(self.generation, &[self.id]);
    }
}

#[derive(Debug)]
enum LoopEnd {
    Stopped,
    NoData,
    ReadFailed(PipelineError),
    EncodeFailed(PipelineError),
    LastViewerLeft,
    NoViewer,
}

/// Releases the device exactly once, then returns the session to idle.
struct ActiveDevice {
    device: Box<dyn CameraDevice>,
    session: Arc<StreamSession>,
    generation: u64,
}

impl Drop for ActiveDevice {
    fn drop(&mut self) {
        self.device.release();
        self.session.finish(self.generation);
    }
}

fn run_worker(shared: Arc<Shared>, generation: u64, device: Box<dyn CameraDevice>) {
    let mut active = ActiveDevice {
        device,
        session: shared.session.clone(),
        generation,
    };
    let end = capture_loop(&shared, generation, active.device.as_mut());
    match &end {
        LoopEnd::ReadFailed(err) | LoopEnd::EncodeFailed(err) => {
            log::error!("stream: generation {} ended: {}", generation, err)
        }
        other => log::info!("stream: generation {} ended: {:?}", generation, other),
    }
    drop(active);
}

fn capture_loop(shared: &Shared, generation: u64, device: &mut dyn CameraDevice) -> LoopEnd {
    let session = &shared.session;
    loop {
        let Some(viewers) = session.viewers(generation) else {
            return LoopEnd::Stopped;
        };
        if viewers.senders.is_empty() {
            if viewers.viewer_seen {
                return LoopEnd::LastViewerLeft;
            }
            let waited = viewers.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if waited >= shared.options.idle_timeout {
                return LoopEnd::NoViewer;
            }
        }

        let frame = match device.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return LoopEnd::NoData,
            Err(err) => return LoopEnd::ReadFailed(err),
        };
        if viewers.senders.is_empty() {
            continue;
        }

        let outcome = shared.detector.detect_or_passthrough(&frame);
        let jpeg = match encode_jpeg(&outcome.annotated, shared.options.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => return LoopEnd::EncodeFailed(err),
        };
        let chunk: FrameChunk = mjpeg::frame_chunk(&jpeg).into();

        let mut gone = Vec::new();
        for (id, tx) in viewers.senders {
            let mut pending = chunk.clone();
            loop {
                if !session.is_current(generation) {
                    return LoopEnd::Stopped;
                }
                match tx.send_timeout(pending, POLL_INTERVAL) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(back)) => pending = back,
                    Err(SendTimeoutError::Disconnected(_)) => {
                        gone.push(id);
                        break;
                    }
                }
            }
        }
        session.remove_viewers(generation, &gone);
    }
}
