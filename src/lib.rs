//! Lookout: object detection over uploads and a live camera feed.
//!
//! # Architecture
//!
//! - **Detector adapter** (`detect`): wraps a pluggable `DetectorBackend` and
//!   burns boxes into a copy of each frame. A failing frame degrades to an
//!   empty batch and an unannotated pass-through.
//! - **Batch jobs** (`jobs`): one image or every frame of one video, written
//!   to a single `result_<timestamp>_<name>` artifact.
//! - **Live stream** (`stream`): a single capture worker per session, gated
//!   by an owned Idle/Active state lock, fanned out to any number of viewers
//!   as a multipart JPEG stream.
//! - **HTTP boundary** (`api`): upload validation and routing.
//!
//! # Module Structure
//!
//! - `capture`: camera sources (`stub://`, V4L2)
//! - `media`: still image codecs and video reader/writer backends
//! - `storage`: artifact naming, history listing
//! - `config`: file + environment configuration
//! - `error`: `PipelineError` taxonomy

pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod jobs;
pub mod media;
pub mod storage;
pub mod stream;

pub use capture::{CameraConfig, CameraDevice, CameraOpener, ConfiguredCamera};
pub use config::LookoutConfig;
pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectionBatch, Detector, DetectorBackend,
    FrameOutcome,
};
pub use error::{PipelineError, PipelineResult};
pub use jobs::{JobResult, JobRunner};
pub use media::{FrameReader, FrameWriter, MediaKind, VideoBackend, VideoParams};
pub use storage::{ResultEntry, ResultStore, StoredUpload};
pub use stream::{FrameStream, StartStatus, StopStatus, StreamController, StreamOptions};
