use serde::{Deserialize, Serialize};

/// Keypoints per person in the COCO skeleton.
pub const COCO_KEYPOINTS: usize = 17;

/// One detected person in one frame.
///
/// Coordinates are in source-frame pixels; `frame_width`/`frame_height` are
/// carried so consumers can rescale to a different display size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonDetection {
    /// Ordered (x, y) keypoints, at most [`COCO_KEYPOINTS`].
    pub pose: Vec<[f32; 2]>,
    /// Person confidence in `[0, 1]`.
    pub confidence: f32,
    /// Bounding box as `[x1, y1, x2, y2]`.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    /// Per-keypoint confidence, index-aligned with `pose`.
    pub keypoint_confidences: Vec<f32>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl PersonDetection {
    /// Checks the structural invariants of a detection.
    pub fn validate(&self) -> Result<(), String> {
        if self.pose.len() > COCO_KEYPOINTS {
            return Err(format!(
                "pose has {} keypoints, at most {} allowed",
                self.pose.len(),
                COCO_KEYPOINTS
            ));
        }
        if self.keypoint_confidences.len() != self.pose.len() {
            return Err(format!(
                "keypoint_confidences length {} does not match pose length {}",
                self.keypoint_confidences.len(),
                self.pose.len()
            ));
        }
        if let Some(point) = self.pose.iter().find(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(format!("keypoint {:?} is not finite", point));
        }
        if !self.bbox.iter().all(|v| v.is_finite()) {
            return Err(format!("box {:?} is not finite", self.bbox));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        Ok(())
    }
}

/// Output of one inference pass: the overlay image and the people found.
#[derive(Clone, Debug, Default)]
pub struct PoseOutput {
    /// RGB24 pixels, same dimensions as the input frame.
    pub annotated: Vec<u8>,
    pub people: Vec<PersonDetection>,
}
