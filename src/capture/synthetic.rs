use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use super::{CameraConfig, CameraDevice};
use crate::error::PipelineResult;

const BACKGROUND: Rgb<u8> = Rgb([40, 60, 40]);
const OBJECT: Rgb<u8> = Rgb([220, 220, 200]);

/// Synthetic camera for `stub://` devices.
///
/// Renders a flat background with a bright square sweeping left to right, so
/// motion-based backends have something to find. Frames are paced to
/// `target_fps` when it is non-zero.
pub struct SyntheticCamera {
    config: CameraConfig,
    frame_count: u64,
    next_due: Option<Instant>,
    released: bool,
}

impl SyntheticCamera {
    pub fn open(config: CameraConfig) -> Self {
        log::info!(
            "camera: opened {} ({}x{}, synthetic)",
            config.device,
            config.width,
            config.height
        );
        Self {
            config,
            frame_count: 0,
            next_due: None,
            released: false,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.config.target_fps;
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
    }

    fn render(&self) -> RgbImage {
        let width = self.config.width.max(1);
        let height = self.config.height.max(1);
        let side = (width.min(height) / 4).max(1);
        let travel = u64::from(width.saturating_sub(side).max(1));
        let left = ((self.frame_count * 4) % travel) as u32;
        let top = (height - side.min(height)) / 2;

        RgbImage::from_fn(width, height, |x, y| {
            if x >= left && x < left + side && y >= top && y < top + side {
                OBJECT
            } else {
                BACKGROUND
            }
        })
    }
}

impl CameraDevice for SyntheticCamera {
    fn read_frame(&mut self) -> PipelineResult<Option<RgbImage>> {
        if self.released {
            return Ok(None);
        }
        self.pace();
        let frame = self.render();
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            log::info!(
                "camera: released {} after {} frames",
                self.config.device,
                self.frame_count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CameraConfig {
        CameraConfig {
            device: "stub://test".to_string(),
            width: 64,
            height: 48,
            target_fps: 0,
        }
    }

    #[test]
    fn consecutive_frames_differ() -> PipelineResult<()> {
        let mut camera = SyntheticCamera::open(config());
        let first = camera.read_frame()?.expect("frame");
        let second = camera.read_frame()?.expect("frame");
        assert_ne!(first, second);
        assert_eq!(camera.frames_captured(), 2);
        Ok(())
    }

    #[test]
    fn released_camera_yields_no_data() -> PipelineResult<()> {
        let mut camera = SyntheticCamera::open(config());
        camera.release();
        assert!(camera.read_frame()?.is_none());
        Ok(())
    }
}
