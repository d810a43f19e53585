//! Runs one streamer thread per camera and tears them down together.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::storage::DetectionStore;
use crate::stream::{PoseStreamer, ShutdownSignal, StreamReport};

#[derive(Debug)]
pub enum CameraOutcome {
    Finished(StreamReport),
    Panicked { camera: String, message: String },
}

impl CameraOutcome {
    pub fn camera(&self) -> &str {
        match self {
            CameraOutcome::Finished(report) => &report.camera,
            CameraOutcome::Panicked { camera, .. } => camera,
        }
    }
}

struct Worker {
    camera: String,
    join: JoinHandle<StreamReport>,
}

/// Owns the camera threads and the shared store.
///
/// Every streamer gets its own thread, so a stalled or failing camera never
/// holds up the others. All of them watch the same [`ShutdownSignal`].
pub struct CameraSupervisor {
    store: Option<Arc<DetectionStore>>,
    shutdown: ShutdownSignal,
    workers: Vec<Worker>,
}

impl CameraSupervisor {
    pub fn new(store: Option<Arc<DetectionStore>>, shutdown: ShutdownSignal) -> Self {
        Self {
            store,
            shutdown,
            workers: Vec::new(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn store(&self) -> Option<&Arc<DetectionStore>> {
        self.store.as_ref()
    }

    pub fn camera_count(&self) -> usize {
        self.workers.len()
    }

    /// Start `streamer` on its own thread.
    pub fn spawn(&mut self, streamer: PoseStreamer) -> Result<()> {
        let camera = streamer.camera().to_string();
        let join = std::thread::Builder::new()
            .name(format!("camera-{}", camera))
            .spawn(move || streamer.run())
            .with_context(|| format!("spawn streamer thread for {}", camera))?;
        log::info!("supervisor: started camera {}", camera);
        self.workers.push(Worker { camera, join });
        Ok(())
    }

    /// Raise the shared shutdown signal.
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            log::info!("supervisor: shutdown requested");
        }
    }

    /// Wait for every camera to finish, then close the store's connections.
    /// A panicking camera is reported, not propagated.
    pub fn join(self) -> Vec<CameraOutcome> {
        let mut outcomes = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            match worker.join.join() {
                Ok(report) => {
                    log::info!(
                        "supervisor: camera {} finished ({} frames emitted, {} detections saved)",
                        report.camera,
                        report.frames_emitted,
                        report.detections_saved
                    );
                    outcomes.push(CameraOutcome::Finished(report));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!(
                        "supervisor: camera {} panicked: {}",
                        worker.camera,
                        message
                    );
                    outcomes.push(CameraOutcome::Panicked {
                        camera: worker.camera,
                        message,
                    });
                }
            }
        }
        if let Some(store) = &self.store {
            store.close();
            log::info!("supervisor: detection store closed");
        }
        outcomes
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
