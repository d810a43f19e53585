use anyhow::Result;

use super::result::PersonDetection;

/// Pose-estimation backend.
///
/// Treated as a synchronous, possibly slow function of one RGB24 frame.
/// Each camera worker owns its own backend instance, so implementations do
/// not need interior locking.
pub trait PoseBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect people in a frame.
    ///
    /// Implementations must treat the pixel slice as read-only and must
    /// report coordinates in the frame's own pixel space.
    fn estimate(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<PersonDetection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
