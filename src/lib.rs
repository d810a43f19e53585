//! Posewatch
//!
//! Multi-camera pose monitoring: each camera's RTSP stream is rate-limited,
//! run through a pose estimator, re-encoded with a skeleton overlay and the
//! detections are appended to a local SQLite database.
//!
//! # Architecture
//!
//! - One [`PoseStreamer`](stream::PoseStreamer) per camera, each on its own
//!   thread under a [`CameraSupervisor`](supervisor::CameraSupervisor).
//! - A streamer is a small state machine (`Running`, `Reconnecting`,
//!   `Stopped`). Lost streams are reopened at their original address with
//!   exponential backoff; the backoff wait wakes on shutdown.
//! - Detections go through a per-camera writer thread into the shared
//!   [`DetectionStore`](storage::DetectionStore), so slow storage never stalls
//!   the frame loop.
//! - The store sits on a bounded [`ConnectionPool`](storage::ConnectionPool)
//!   which is initialised once and closed after every camera has stopped.
//!
//! # Module Structure
//!
//! - `config`: daemon and API settings (file + env)
//! - `storage`: pool, schema, queries
//! - `frame`: RGB24 frame buffer
//! - `ingest`: frame sources (RTSP)
//! - `pose`: pose backends, overlay rendering
//! - `sink`: encoded output
//! - `stream`: per-camera streamer
//! - `supervisor`: camera threads and shutdown
//! - `api`: read-only HTTP queries

pub mod api;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod pose;
pub mod sink;
pub mod storage;
pub mod stream;
pub mod supervisor;

pub use config::{ApiConfig, BackendKind, BackendSettings, CameraSettings, PosewatchdConfig};
pub use frame::Frame;
pub use ingest::{FrameSource, RtspConfig, RtspSource};
pub use pose::{PersonDetection, PoseBackend, PoseEstimator, StubBackend};
pub use sink::{OutputSink, SinkFactory, SinkSpec};
pub use storage::{ConnectionPool, Detection, DetectionStore, NewDetection, StoreError};
pub use stream::{Backoff, PoseStreamer, ShutdownSignal, StreamReport, StreamerOptions};
pub use supervisor::{CameraOutcome, CameraSupervisor};
