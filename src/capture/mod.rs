//! Camera sources for the live stream.
//!
//! A `CameraOpener` is handed to the stream controller at startup. Every
//! stream start calls `open` once; the returned `CameraDevice` is owned by the
//! single capture worker and released exactly once when the loop ends.
//!
//! Sources:
//! - `stub://<name>`: synthetic moving scene, always available
//! - `/dev/videoN`: V4L2 device (feature: camera-v4l2)

#[cfg(feature = "camera-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "camera-v4l2")]
mod v4l2;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

pub use synthetic::SyntheticCamera;
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Camera;

pub const STUB_SCHEME: &str = "stub://";

/// Camera selection and requested capture format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// `stub://...` or a device node such as `/dev/video0`.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Requested frame rate. Devices may ignore it.
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera0".to_string(),
            width: 640,
            height: 480,
            target_fps: 15,
        }
    }
}

/// An open camera.
pub trait CameraDevice: Send {
    /// Next frame, or `Ok(None)` when the device has no more data.
    fn read_frame(&mut self) -> PipelineResult<Option<RgbImage>>;

    /// Close the device. Further reads return `Ok(None)`.
    fn release(&mut self);
}

/// Factory for camera devices; one call per stream start.
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> PipelineResult<Box<dyn CameraDevice>>;

    fn describe(&self) -> String;
}

/// Opens the source named by a `CameraConfig`.
pub struct ConfiguredCamera {
    config: CameraConfig,
}

impl ConfiguredCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl CameraOpener for ConfiguredCamera {
    fn open(&self) -> PipelineResult<Box<dyn CameraDevice>> {
        if self.config.device.starts_with(STUB_SCHEME) {
            return Ok(Box::new(SyntheticCamera::open(self.config.clone())));
        }
        open_device(&self.config)
    }

    fn describe(&self) -> String {
        self.config.device.clone()
    }
}

#[cfg(feature = "camera-v4l2")]
fn open_device(config: &CameraConfig) -> PipelineResult<Box<dyn CameraDevice>> {
    Ok(Box::new(V4l2Camera::open(config.clone())?))
}

#[cfg(not(feature = "camera-v4l2"))]
fn open_device(config: &CameraConfig) -> PipelineResult<Box<dyn CameraDevice>> {
    Err(PipelineError::Device(format!(
        "cannot open {}: camera devices require the camera-v4l2 feature",
        config.device
    )))
}
