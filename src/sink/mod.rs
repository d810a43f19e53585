//! Encoded output for annotated frames.
//!
//! A sink accepts raw RGB24 buffers at a fixed resolution and frame rate.
//! Sinks are opened lazily through a [`SinkFactory`] once the first frame's
//! resolution is known, and each sink belongs to exactly one camera.

use anyhow::Result;

mod counting;
mod ffmpeg;

pub use counting::{CountingSink, CountingSinkFactory, SinkTally};
pub use ffmpeg::{FfmpegSink, FfmpegSinkFactory};

/// Resolution and rate a sink is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

pub trait OutputSink: Send {
    /// Write one RGB24 frame matching the sink's spec.
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()>;

    /// Signal end of input. Further writes fail.
    fn close_input(&mut self) -> Result<()>;

    /// Block until buffered output is flushed and the encoder has exited.
    fn wait(&mut self) -> Result<()>;
}

pub trait SinkFactory: Send {
    fn open(&mut self, spec: SinkSpec) -> Result<Box<dyn OutputSink>>;
}
