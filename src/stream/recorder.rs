use anyhow::{Context, Result};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::storage::{DetectionStore, NewDetection};

/// Records waiting for the writer before new ones are dropped.
pub const DEFAULT_RECORDER_CAPACITY: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub saved: u64,
    pub failed: u64,
}

/// Per-camera background writer.
///
/// The frame loop hands records over with [`submit`](Self::submit), which
/// never blocks. A single writer thread saves them in submission order, so
/// rows for one camera land in frame order. Storage errors are logged and
/// counted, never surfaced to the frame loop.
pub struct DetectionRecorder {
    camera: String,
    tx: Option<SyncSender<NewDetection>>,
    join: Option<JoinHandle<RecorderStats>>,
}

impl DetectionRecorder {
    pub fn spawn(camera: &str, store: Arc<DetectionStore>, capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<NewDetection>(capacity.max(1));
        let label = camera.to_string();
        let join = std::thread::Builder::new()
            .name(format!("recorder-{}", camera))
            .spawn(move || {
                let mut stats = RecorderStats::default();
                for record in rx {
                    match store.save_detection(&record) {
                        Ok(id) => {
                            stats.saved += 1;
                            log::debug!(
                                "recorder[{}]: saved frame {} as row {}",
                                label,
                                record.frame_number,
                                id
                            );
                        }
                        Err(err) => {
                            stats.failed += 1;
                            log::error!(
                                "recorder[{}]: failed to save frame {}: {}",
                                label,
                                record.frame_number,
                                err
                            );
                        }
                    }
                }
                stats
            })
            .with_context(|| format!("spawn detection recorder for {}", camera))?;

        Ok(Self {
            camera: camera.to_string(),
            tx: Some(tx),
            join: Some(join),
        })
    }

    /// Queue a record. Returns `false` if it was dropped.
    pub fn submit(&self, record: NewDetection) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                log::warn!(
                    "recorder[{}]: queue full, dropping detections for frame {}",
                    self.camera,
                    record.frame_number
                );
                false
            }
            Err(TrySendError::Disconnected(record)) => {
                log::error!(
                    "recorder[{}]: writer is gone, dropping detections for frame {}",
                    self.camera,
                    record.frame_number
                );
                false
            }
        }
    }

    /// Stop accepting records, let the writer drain the queue, and join it.
    pub fn finish(mut self) -> RecorderStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> RecorderStats {
        self.tx.take();
        match self.join.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("recorder[{}]: writer thread panicked", self.camera);
                RecorderStats::default()
            }
            None => RecorderStats::default(),
        }
    }
}

impl Drop for DetectionRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
