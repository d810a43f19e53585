use anyhow::{anyhow, Result};

use super::backend::PoseBackend;
use super::result::PoseOutput;
use super::skeleton::draw_people;
use crate::frame::Frame;

/// Runs a backend on a frame and renders the overlay.
pub struct PoseEstimator {
    backend: Box<dyn PoseBackend>,
    show_original: bool,
}

impl PoseEstimator {
    pub fn new(backend: Box<dyn PoseBackend>) -> Self {
        Self {
            backend,
            show_original: false,
        }
    }

    /// Draw skeletons over the source pixels instead of a black canvas.
    pub fn with_original(mut self, show_original: bool) -> Self {
        self.show_original = show_original;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.backend.warm_up()
    }

    pub fn process(&mut self, frame: &Frame) -> Result<PoseOutput> {
        let people = self
            .backend
            .estimate(frame.pixels(), frame.width, frame.height)?;
        if let Some((index, err)) = people
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.validate().err().map(|e| (i, e)))
        {
            return Err(anyhow!(
                "backend {} returned invalid person {}: {}",
                self.backend.name(),
                index,
                err
            ));
        }

        let mut annotated = if self.show_original {
            frame.pixels().to_vec()
        } else {
            vec![0u8; frame.pixels().len()]
        };
        draw_people(&mut annotated, frame.width, frame.height, &people);

        Ok(PoseOutput { annotated, people })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::StubBackend;
    use chrono::Utc;

    fn gray_frame() -> Frame {
        Frame::new(vec![128; 64 * 48 * 3], 64, 48, 0.0, Utc::now()).unwrap()
    }

    #[test]
    fn black_canvas_by_default() {
        let mut estimator = PoseEstimator::new(Box::new(StubBackend::new(0)));
        let output = estimator.process(&gray_frame()).unwrap();
        assert!(output.people.is_empty());
        assert!(output.annotated.iter().all(|&b| b == 0));
    }

    #[test]
    fn original_pixels_kept_when_requested() {
        let mut estimator =
            PoseEstimator::new(Box::new(StubBackend::new(1))).with_original(true);
        let output = estimator.process(&gray_frame()).unwrap();
        assert_eq!(output.people.len(), 1);
        assert_eq!(output.annotated.len(), 64 * 48 * 3);
        assert!(output.annotated.contains(&128));
        assert!(output.annotated.chunks(3).any(|px| px == [0, 255, 0]));
    }
}
