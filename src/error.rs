//! Error taxonomy for the media pipeline.
//!
//! Backends and glue code return `anyhow::Result`; the pipeline boundary
//! (jobs, stream controller, HTTP layer) converts into `PipelineError` so that
//! callers can branch on the failure kind.

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing input. Raised by the HTTP boundary before the core runs.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The camera could not be opened or read.
    #[error("camera device error: {0}")]
    Device(String),

    /// The detector could not process a single frame. Recoverable.
    #[error("detection failed: {0}")]
    Detection(String),

    /// An encoder or writer failed. Fatal to the current job or stream.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Reading input media or writing an artifact failed.
    #[error("i/o error: {0}")]
    Io(String),
}

impl PipelineError {
    pub fn device(err: impl std::fmt::Display) -> Self {
        Self::Device(err.to_string())
    }

    pub fn detection(err: impl std::fmt::Display) -> Self {
        Self::Detection(err.to_string())
    }

    pub fn encoding(err: impl std::fmt::Display) -> Self {
        Self::Encoding(err.to_string())
    }

    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }

    /// Short machine-readable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Device(_) => "device_error",
            Self::Detection(_) => "detection_error",
            Self::Encoding(_) => "encoding_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(inner) => Self::Encoding(inner.to_string()),
            image::ImageError::IoError(inner) => Self::Io(inner.to_string()),
            other => Self::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_io_variant() {
        let err: PipelineError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.code(), "io_error");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn device_errors_render_message() {
        let err = PipelineError::device("no such device /dev/video9");
        assert_eq!(
            err.to_string(),
            "camera device error: no such device /dev/video9"
        );
    }
}
