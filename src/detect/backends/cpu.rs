use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

const DEFAULT_PIXEL_THRESHOLD: u16 = 40;
const DEFAULT_MIN_CHANGED_FRACTION: f32 = 0.002;

/// CPU backend for motion detection.
///
/// Compares each frame with the previous one and reports a single `motion`
/// detection bounding the pixels whose summed channel difference exceeds the
/// threshold. The first frame, and any frame after a resolution change, only
/// primes the reference.
pub struct CpuBackend {
    previous: Option<RgbImage>,
    pixel_threshold: u16,
    min_changed_fraction: f32,
}

impl CpuBackend {
    pub fn new(pixel_threshold: u16, min_changed_fraction: f32) -> Self {
        Self {
            previous: None,
            pixel_threshold,
            min_changed_fraction,
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PIXEL_THRESHOLD, DEFAULT_MIN_CHANGED_FRACTION)
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let previous = match self.previous.replace(frame.clone()) {
            Some(prev) if prev.dimensions() == frame.dimensions() => prev,
            _ => return Ok(Vec::new()),
        };

        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut changed = 0u64;
        for (x, y, px) in frame.enumerate_pixels() {
            let old = previous.get_pixel(x, y);
            let diff: u16 = px
                .0
                .iter()
                .zip(old.0.iter())
                .map(|(a, b)| (*a as i16 - *b as i16).unsigned_abs())
                .sum();
            if diff > self.pixel_threshold {
                changed += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        let total = (frame.width() as u64 * frame.height() as u64).max(1);
        if changed == 0 || (changed as f32 / total as f32) < self.min_changed_fraction {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        let confidence = changed as f32 / bbox.area().max(1.0);
        Ok(vec![Detection::new("motion", confidence, bbox)])
    }
}
