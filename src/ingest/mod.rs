//! Frame ingestion sources.
//!
//! A [`FrameSource`] hides a reconnect-unaware capture handle behind three
//! operations: read the next frame, reopen using an address, and release.
//! Reconnect policy lives in the streamer, not here.

use anyhow::Result;

use crate::frame::Frame;

pub mod rtsp;

pub use rtsp::{RtspConfig, RtspSource, RtspStats};

pub trait FrameSource: Send {
    /// Read the next frame. An error means the stream is unusable until it
    /// is reopened.
    fn read(&mut self) -> Result<Frame>;

    /// Tear down any current handle and connect again to `address`.
    fn reopen(&mut self, address: &str) -> Result<()>;

    /// Release the capture handle. Safe to call more than once.
    fn release(&mut self);

    /// The address the source was opened with, if it has one.
    fn address(&self) -> Option<&str> {
        None
    }
}
