//! Media codecs.
//!
//! - Still images are decoded and encoded with the `image` crate.
//! - Video files go through a `VideoBackend`. The FFmpeg backend is available
//!   with the `video-ffmpeg` feature; without it video jobs fail with a clear
//!   error instead of silently producing nothing.

#[cfg(feature = "video-ffmpeg")]
mod ffmpeg;
mod still;

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;

use crate::error::{PipelineError, PipelineResult};

#[cfg(feature = "video-ffmpeg")]
pub use self::ffmpeg::FfmpegVideoBackend;
pub use still::{encode_jpeg, load_image, save_image};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "avi"];

/// Kind of media accepted for batch jobs, derived from the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify by extension (case-insensitive). `None` means not allowed.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Geometry and timing of a video stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Sequential decoder over the frames of one video file.
///
/// Dropping the reader releases the underlying handles.
pub trait FrameReader {
    fn params(&self) -> VideoParams;

    /// `None` at end of stream. `Some(Err(_))` reports one frame that could not
    /// be decoded; the caller may keep reading.
    fn next_frame(&mut self) -> Option<PipelineResult<RgbImage>>;
}

/// Sequential encoder producing one video file.
///
/// Dropping the writer without `finish` releases the handles but leaves the
/// container without a trailer.
pub trait FrameWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()>;

    /// Flush buffered packets and finalize the container.
    fn finish(self: Box<Self>) -> PipelineResult<()>;
}

pub trait VideoBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_reader(&self, path: &Path) -> PipelineResult<Box<dyn FrameReader>>;

    fn open_writer(&self, path: &Path, params: VideoParams) -> PipelineResult<Box<dyn FrameWriter>>;
}

/// Backend used when the crate is built without any video codec.
pub struct UnsupportedVideoBackend;

impl VideoBackend for UnsupportedVideoBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn open_reader(&self, path: &Path) -> PipelineResult<Box<dyn FrameReader>> {
        Err(PipelineError::Io(format!(
            "cannot open {}: video decoding requires the video-ffmpeg feature",
            path.display()
        )))
    }

    fn open_writer(&self, path: &Path, _params: VideoParams) -> PipelineResult<Box<dyn FrameWriter>> {
        Err(PipelineError::Encoding(format!(
            "cannot create {}: video encoding requires the video-ffmpeg feature",
            path.display()
        )))
    }
}

/// The best video backend compiled into this build.
pub fn default_video_backend() -> anyhow::Result<Arc<dyn VideoBackend>> {
    #[cfg(feature = "video-ffmpeg")]
    {
        Ok(Arc::new(FfmpegVideoBackend::new()?))
    }
    #[cfg(not(feature = "video-ffmpeg"))]
    {
        log::warn!("built without video-ffmpeg; video uploads will be rejected at processing time");
        Ok(Arc::new(UnsupportedVideoBackend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_allowed_extensions() {
        assert_eq!(MediaKind::from_path("a.jpg"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path("a.JPEG"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path("dir/b.png"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path("c.Mp4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path("c.avi"), Some(MediaKind::Video));
    }

    #[test]
    fn rejects_other_extensions() {
        assert_eq!(MediaKind::from_path("a.gif"), None);
        assert_eq!(MediaKind::from_path("noext"), None);
        assert_eq!(MediaKind::from_path("archive.mp4.zip"), None);
    }

    #[test]
    fn unsupported_backend_reports_errors() {
        let backend = UnsupportedVideoBackend;
        assert!(matches!(
            backend.open_reader(Path::new("in.mp4")),
            Err(PipelineError::Io(_))
        ));
        let params = VideoParams {
            width: 2,
            height: 2,
            fps: 25.0,
        };
        assert!(matches!(
            backend.open_writer(Path::new("out.mp4"), params),
            Err(PipelineError::Encoding(_))
        ));
    }
}
