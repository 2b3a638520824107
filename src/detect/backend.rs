use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// A backend wraps one concrete detector (a neural network, a heuristic, a
/// test double). Heavy initialization belongs in the constructor so that it
/// happens once at process startup; `detect` is then called repeatedly from a
/// single logical stream of frames.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the frame as read-only. Boxes are returned in
    /// the pixel coordinates of `frame`.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
