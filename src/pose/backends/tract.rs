#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::pose::backend::PoseBackend;
use crate::pose::result::{PersonDetection, COCO_KEYPOINTS};

/// Rows per anchor in a YOLOv8-pose head: cx, cy, w, h, score, 17 x (x, y, conf).
const POSE_ROWS: usize = 5 + COCO_KEYPOINTS * 3;
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Tract-based YOLOv8-pose backend.
///
/// Loads a local ONNX export (`yolov8n-pose.onnx`) with a square input. Frames
/// are resized keeping aspect ratio into the top-left of the input and padded.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
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
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn ratio(&self, width: u32, height: u32) -> f32 {
        let size = self.input_size as f32;
        (size / width as f32).min(size / height as f32)
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let expected = crate::frame::rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }
        let ratio = self.ratio(width, height);
        let scaled_w = ((width as f32 * ratio) as usize).max(1);
        let scaled_h = ((height as f32 * ratio) as usize).max(1);
        let size = self.input_size as usize;
        let src_w = width as usize;
        let src_h = height as usize;

        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            if x >= scaled_w || y >= scaled_h {
                return PAD_VALUE;
            }
            let sx = ((x as f32 / ratio) as usize).min(src_w - 1);
            let sy = ((y as f32 / ratio) as usize).min(src_h - 1);
            pixels[(sy * src_w + sx) * 3 + c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, output: &Tensor, width: u32, height: u32) -> Result<Vec<PersonDetection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] != POSE_ROWS {
            return Err(anyhow!(
                "unexpected pose head shape {:?}, expected [1, {}, N]",
                shape,
                POSE_ROWS
            ));
        }
        let anchors = shape[2];
        let ratio = self.ratio(width, height);
        let max_x = width as f32;
        let max_y = height as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let score = view[[0, 4, a]];
            if score < self.confidence_threshold {
                continue;
            }
            let cx = view[[0, 0, a]] / ratio;
            let cy = view[[0, 1, a]] / ratio;
            let w = view[[0, 2, a]] / ratio;
            let h = view[[0, 3, a]] / ratio;
            let bbox = [
                (cx - w / 2.0).clamp(0.0, max_x),
                (cy - h / 2.0).clamp(0.0, max_y),
                (cx + w / 2.0).clamp(0.0, max_x),
                (cy + h / 2.0).clamp(0.0, max_y),
            ];
            let mut pose = Vec::with_capacity(COCO_KEYPOINTS);
            let mut keypoint_confidences = Vec::with_capacity(COCO_KEYPOINTS);
            for k in 0..COCO_KEYPOINTS {
                let base = 5 + k * 3;
                pose.push([
                    (view[[0, base, a]] / ratio).clamp(0.0, max_x),
                    (view[[0, base + 1, a]] / ratio).clamp(0.0, max_y),
                ]);
                keypoint_confidences.push(view[[0, base + 2, a]].clamp(0.0, 1.0));
            }
            candidates.push(PersonDetection {
                pose,
                confidence: score.clamp(0.0, 1.0),
                bbox,
                keypoint_confidences,
                frame_width: width,
                frame_height: height,
            });
        }

        non_max_suppression(&mut candidates, self.iou_threshold);
        Ok(candidates)
    }
}

impl PoseBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn estimate(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<PersonDetection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode(output, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.input_size;
        let blank = vec![0u8; crate::frame::rgb_len(size, size)?];
        self.estimate(&blank, size, size).map(|_| ())
    }
}

/// Greedy NMS: keep the highest-scoring box, drop any later box overlapping
/// a kept one by more than `iou_threshold`.
fn non_max_suppression(people: &mut Vec<PersonDetection>, iou_threshold: f32) {
    people.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept = 0;
    for index in 0..people.len() {
        let overlaps = (0..kept).any(|prev| iou(&people[prev].bbox, &people[index].bbox) > iou_threshold);
        if !overlaps {
            people.swap(kept, index);
            kept += 1;
        }
    }
    people.truncate(kept);
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
