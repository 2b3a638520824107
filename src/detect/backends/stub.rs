use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

/// Stub backend for tests and demos.
///
/// In fixed mode every frame yields one detection with the configured label
/// covering the centre half of the frame. In failing mode every call errors.
pub struct StubBackend {
    mode: StubMode,
    calls: u64,
}

enum StubMode {
    Fixed { label: String, confidence: f32 },
    Failing,
}

impl StubBackend {
    pub fn fixed(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            mode: StubMode::Fixed {
                label: label.into(),
                confidence,
            },
            calls: 0,
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: StubMode::Failing,
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::fixed("object", 0.5)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        self.calls += 1;
        match &self.mode {
            StubMode::Fixed { label, confidence } => {
                let (w, h) = (frame.width() as f32, frame.height() as f32);
                let bbox = BoundingBox::new(w * 0.25, h * 0.25, w * 0.75, h * 0.75);
                Ok(vec![Detection::new(label.clone(), *confidence, bbox)])
            }
            StubMode::Failing => Err(anyhow!("stub backend configured to fail")),
        }
    }
}
