use anyhow::Result;

use crate::pose::backend::PoseBackend;
use crate::pose::result::{PersonDetection, COCO_KEYPOINTS};

/// Relative (x, y) positions of a standing figure, COCO keypoint order.
const FIGURE: [[f32; 2]; COCO_KEYPOINTS] = [
    [0.50, 0.10],
    [0.48, 0.08],
    [0.52, 0.08],
    [0.46, 0.09],
    [0.54, 0.09],
    [0.42, 0.22],
    [0.58, 0.22],
    [0.38, 0.38],
    [0.62, 0.38],
    [0.36, 0.52],
    [0.64, 0.52],
    [0.45, 0.55],
    [0.55, 0.55],
    [0.44, 0.74],
    [0.56, 0.74],
    [0.44, 0.92],
    [0.56, 0.92],
];

/// Deterministic backend for tests and dry runs.
///
/// Reports `people` identical figures, spread horizontally, on every
/// `period`-th call and nobody otherwise.
pub struct StubBackend {
    people: usize,
    period: u64,
    calls: u64,
}

impl StubBackend {
    pub fn new(people: usize) -> Self {
        Self {
            people,
            period: 1,
            calls: 0,
        }
    }

    /// Only report people on every `period`-th frame.
    pub fn every(mut self, period: u64) -> Self {
        self.period = period.max(1);
        self
    }

    fn figure(&self, index: usize, width: u32, height: u32) -> PersonDetection {
        let slots = self.people.max(1) as f32;
        let slot_width = 1.0 / slots;
        let offset = slot_width * index as f32;
        let w = width as f32;
        let h = height as f32;
        let pose: Vec<[f32; 2]> = FIGURE
            .iter()
            .map(|[x, y]| [(offset + x * slot_width) * w, y * h])
            .collect();
        PersonDetection {
            bbox: [
                (offset + 0.3 * slot_width) * w,
                0.05 * h,
                (offset + 0.7 * slot_width) * w,
                0.95 * h,
            ],
            keypoint_confidences: vec![0.9; pose.len()],
            pose,
            confidence: 0.9,
            frame_width: width,
            frame_height: height,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PoseBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn estimate(&mut self, _pixels: &[u8], width: u32, height: u32) -> Result<Vec<PersonDetection>> {
        self.calls += 1;
        if self.calls % self.period != 0 {
            return Ok(Vec::new());
        }
        Ok((0..self.people)
            .map(|index| self.figure(index, width, height))
            .collect())
    }
}
