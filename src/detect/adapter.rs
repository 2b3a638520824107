use std::sync::Mutex;

use image::RgbImage;

use crate::detect::annotate::Annotator;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionBatch;
use crate::error::{PipelineError, PipelineResult};

/// Result of running the detector on one frame with failures absorbed.
pub struct FrameOutcome {
    pub detections: DetectionBatch,
    pub annotated: RgbImage,
    /// True when detection failed and `annotated` is an unmodified copy.
    pub passthrough: bool,
}

/// Shared detector: one backend plus the annotator.
///
/// The backend is built once at startup and shared behind `Arc<Detector>`;
/// calls from concurrent jobs and the live stream are serialized here because
/// `DetectorBackend::detect` takes `&mut self`.
pub struct Detector {
    backend: Mutex<Box<dyn DetectorBackend>>,
    annotator: Annotator,
    name: &'static str,
}

impl Detector {
    pub fn new(backend: Box<dyn DetectorBackend>, annotator: Annotator) -> Self {
        let name = backend.name();
        Self {
            backend: Mutex::new(backend),
            annotator,
            name,
        }
    }

    pub fn from_backend<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self::new(Box::new(backend), Annotator::new())
    }

    pub fn backend_name(&self) -> &'static str {
        self.name
    }

    pub fn warm_up(&self) -> anyhow::Result<()> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| anyhow::anyhow!("detector backend lock poisoned"))?;
        guard.warm_up()
    }

    /// Detect objects and return them with an annotated copy of `frame`.
    pub fn detect(&self, frame: &RgbImage) -> PipelineResult<(DetectionBatch, RgbImage)> {
        let detections = {
            let mut guard = self
                .backend
                .lock()
                .map_err(|_| PipelineError::detection("detector backend lock poisoned"))?;
            guard.detect(frame).map_err(|err| {
                PipelineError::Detection(format!("{} backend: {:#}", self.name, err))
            })?
        };
        let annotated = self.annotator.annotate(frame, &detections);
        Ok((detections, annotated))
    }

    /// Like `detect`, but a failed frame yields no detections and passes the
    /// original frame through unannotated.
    pub fn detect_or_passthrough(&self, frame: &RgbImage) -> FrameOutcome {
        match self.detect(frame) {
            Ok((detections, annotated)) => FrameOutcome {
                detections,
                annotated,
                passthrough: false,
            },
            Err(err) => {
                log::warn!("frame passed through unannotated: {}", err);
                FrameOutcome {
                    detections: Vec::new(),
                    annotated: frame.clone(),
                    passthrough: true,
                }
            }
        }
    }
}
