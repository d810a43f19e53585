mod backend;
mod backends;
mod estimator;
mod result;
pub mod skeleton;

pub use backend::PoseBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use estimator::PoseEstimator;
pub use result::{PersonDetection, PoseOutput, COCO_KEYPOINTS};
