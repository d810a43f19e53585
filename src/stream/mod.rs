//! Per-camera streaming: frame-rate gate, reconnect backoff, detection
//! recording and the state machine tying them together.

mod backoff;
mod gate;
mod recorder;
mod shutdown;
mod streamer;

pub use backoff::Backoff;
pub use gate::FrameGate;
pub use recorder::{DetectionRecorder, RecorderStats, DEFAULT_RECORDER_CAPACITY};
pub use shutdown::ShutdownSignal;
pub use streamer::{PoseStreamer, StreamReport, StreamState, StreamerOptions};
