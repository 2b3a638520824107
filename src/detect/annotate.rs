//! Burns detection boxes and labels into a frame.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::result::Detection;

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 16.0;
const LABEL_PADDING: u32 = 2;

const PALETTE: [[u8; 3]; 10] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [52, 69, 147],
    [203, 56, 255],
];

pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Boxes only. Label text needs a font.
    pub fn new() -> Self {
        Self { font: None }
    }

    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font file {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Returns an annotated copy of `frame`; the input is left untouched.
    pub fn annotate(&self, frame: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = frame.clone();
        for detection in detections {
            self.draw_detection(&mut canvas, detection);
        }
        canvas
    }

    fn draw_detection(&self, canvas: &mut RgbImage, detection: &Detection) {
        let (width, height) = canvas.dimensions();
        let bbox = detection.bbox.clamp_to(width, height);
        let x = bbox.x1.floor() as i32;
        let y = bbox.y1.floor() as i32;
        let w = bbox.width().round() as u32;
        let h = bbox.height().round() as u32;
        if w == 0 || h == 0 {
            return;
        }
        let color = Rgb(label_color(&detection.label));

        for inset in 0..BOX_THICKNESS {
            let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
            if iw == 0 || ih == 0 {
                break;
            }
            let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        if let Some(font) = &self.font {
            let text = format!("{} {:.2}", detection.label, detection.confidence);
            let scale = PxScale::from(LABEL_SCALE);
            let (tw, th) = text_size(scale, font, &text);
            let tag_w = tw + 2 * LABEL_PADDING;
            let tag_h = th + 2 * LABEL_PADDING;
            // Tag sits above the box, or inside it when the box touches the top edge.
            let tag_y = if y >= tag_h as i32 { y - tag_h as i32 } else { y };
            draw_filled_rect_mut(canvas, Rect::at(x, tag_y).of_size(tag_w, tag_h), color);
            draw_text_mut(
                canvas,
                Rgb([255, 255, 255]),
                x + LABEL_PADDING as i32,
                tag_y + LABEL_PADDING as i32,
                scale,
                font,
                &text,
            );
        }
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable colour per label.
fn label_color(label: &str) -> [u8; 3] {
    let hash = label
        .bytes()
        .fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
    PALETTE[(hash as usize) % PALETTE.len()]
}
