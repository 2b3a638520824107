#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use super::labels::COCO_LABELS;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

const CXYWH_OFFSET: usize = 4;
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Frames are letterboxed into a square `input_size` tensor (image anchored
/// top-left, grey padding). The model output is expected as `[1, 4 + C, N]`
/// with centre/size boxes followed by per-class scores.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            labels: COCO_LABELS.iter().map(|l| l.to_string()).collect(),
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    /// Replace the class names. Index `i` names class `i`.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Scale factor from original frame to model input.
    fn ratio(&self, frame: &RgbImage) -> f32 {
        let size = self.input_size as f32;
        (size / frame.width() as f32).min(size / frame.height() as f32)
    }

    fn build_input(&self, frame: &RgbImage, ratio: f32) -> Result<Tensor> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(anyhow!("cannot run detection on an empty frame"));
        }
        let new_w = ((frame.width() as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let new_h = ((frame.height() as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            if (x as u32) < new_w && (y as u32) < new_h {
                resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
            } else {
                LETTERBOX_FILL
            }
        });
        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &RgbImage, ratio: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];

        let mut candidates: Vec<(usize, f32, BoundingBox)> = Vec::new();
        for i in 0..anchors {
            let (class_id, confidence) = (CXYWH_OFFSET..rows)
                .map(|row| (row - CXYWH_OFFSET, preds[[0, row, i]]))
                .fold((0usize, f32::NEG_INFINITY), |best, x| {
                    if x.1 > best.1 {
                        x
                    } else {
                        best
                    }
                });
            if !confidence.is_finite() || confidence < self.confidence_threshold {
                continue;
            }
            let cx = preds[[0, 0, i]] / ratio;
            let cy = preds[[0, 1, i]] / ratio;
            let w = preds[[0, 2, i]] / ratio;
            let h = preds[[0, 3, i]] / ratio;
            let bbox = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
                .clamp_to(frame.width(), frame.height());
            candidates.push((class_id, confidence, bbox));
        }

        non_max_suppression(&mut candidates, self.iou_threshold);

        Ok(candidates
            .into_iter()
            .map(|(class_id, confidence, bbox)| {
                Detection::new(self.label_for(class_id), confidence, bbox)
            })
            .collect())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let ratio = self.ratio(frame);
        let input = self.build_input(frame, ratio)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame, ratio)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}

/// Class-wise greedy NMS, highest confidence first.
fn non_max_suppression(xs: &mut Vec<(usize, f32, BoundingBox)>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept = 0;
    for index in 0..xs.len() {
        let suppressed = (0..kept).any(|prev| {
            xs[prev].0 == xs[index].0 && xs[prev].2.iou(&xs[index].2) > iou_threshold
        });
        if !suppressed {
            xs.swap(kept, index);
            kept += 1;
        }
    }
    xs.truncate(kept);
}
