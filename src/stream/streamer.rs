use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::gate::FrameGate;
use super::recorder::{DetectionRecorder, DEFAULT_RECORDER_CAPACITY};
use super::shutdown::ShutdownSignal;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::pose::{PersonDetection, PoseEstimator};
use crate::sink::{OutputSink, SinkFactory, SinkSpec};
use crate::storage::{DetectionStore, NewDetection};

const DEFAULT_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Running,
    Reconnecting,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct StreamerOptions {
    /// Maximum emitted frames per second.
    pub fps: u32,
    pub backoff: Backoff,
    pub health_log_interval: Duration,
    /// Pending records per camera before new ones are dropped.
    pub recorder_capacity: usize,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            fps: 1,
            backoff: Backoff::default(),
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
            recorder_capacity: DEFAULT_RECORDER_CAPACITY,
        }
    }
}

/// Counters for one camera's run, returned when the streamer stops.
#[derive(Clone, Debug, Default)]
pub struct StreamReport {
    pub camera: String,
    pub frames_read: u64,
    pub frames_gated: u64,
    pub frames_emitted: u64,
    pub frames_skipped: u64,
    pub inference_failures: u64,
    pub detections_queued: u64,
    pub detections_dropped: u64,
    pub detections_saved: u64,
    pub detections_failed: u64,
    pub read_failures: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    pub longest_backoff: Duration,
    pub last_frame_number: u64,
}

/// One camera's frame loop.
///
/// `RUNNING` reads a frame, drops it if the rate gate says so, runs pose
/// estimation, writes the overlay to the sink and hands detections to the
/// recorder. A failed read moves to `RECONNECTING`, which releases the
/// source and reopens it at the original address with exponential backoff
/// until it succeeds or shutdown is raised. Anything that ends the run goes
/// through `STOPPED`, which releases the source, drains the sink and flushes
/// the recorder exactly once.
pub struct PoseStreamer {
    camera: String,
    address: Option<String>,
    source: Box<dyn FrameSource>,
    estimator: PoseEstimator,
    sink_factory: Box<dyn SinkFactory>,
    sink: Option<(SinkSpec, Box<dyn OutputSink>)>,
    store: Option<Arc<DetectionStore>>,
    recorder: Option<DetectionRecorder>,
    shutdown: ShutdownSignal,
    options: StreamerOptions,
    gate: FrameGate,
    frame_number: u64,
    last_health_log: Instant,
    report: StreamReport,
}

impl PoseStreamer {
    pub fn new(
        camera: impl Into<String>,
        source: Box<dyn FrameSource>,
        estimator: PoseEstimator,
        sink_factory: Box<dyn SinkFactory>,
        shutdown: ShutdownSignal,
        options: StreamerOptions,
    ) -> Self {
        let camera = camera.into();
        let address = source.address().map(str::to_string);
        Self {
            report: StreamReport {
                camera: camera.clone(),
                ..StreamReport::default()
            },
            camera,
            address,
            source,
            estimator,
            sink_factory,
            sink: None,
            store: None,
            recorder: None,
            shutdown,
            gate: FrameGate::new(options.fps),
            options,
            frame_number: 0,
            last_health_log: Instant::now(),
        }
    }

    /// Override the address used for reconnects. `None` disables reconnects.
    pub fn with_address(mut self, address: Option<String>) -> Self {
        self.address = address;
        self
    }

    /// Persist detections to `store` from a background writer.
    pub fn with_store(mut self, store: Arc<DetectionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Run until shutdown or an unrecoverable error. Never panics on stream
    /// failures; the returned report says what happened.
    pub fn run(mut self) -> StreamReport {
        log::info!(
            "streamer[{}]: starting ({} backend, {} fps, reconnect to {})",
            self.camera,
            self.estimator.backend_name(),
            self.options.fps,
            self.address.as_deref().unwrap_or("<none>")
        );
        if let Err(err) = self.start_recorder() {
            log::error!(
                "streamer[{}]: detections will not be saved: {:#}",
                self.camera,
                err
            );
        }
        if let Err(err) = self.estimator.warm_up() {
            log::warn!("streamer[{}]: backend warm-up failed: {:#}", self.camera, err);
        }

        let mut state = StreamState::Running;
        while state != StreamState::Stopped {
            state = match state {
                StreamState::Running => self.step(),
                StreamState::Reconnecting => self.reconnect(),
                StreamState::Stopped => StreamState::Stopped,
            };
        }
        self.stop();
        self.report
    }

    fn start_recorder(&mut self) -> Result<()> {
        if let Some(store) = self.store.clone() {
            self.recorder = Some(DetectionRecorder::spawn(
                &self.camera,
                store,
                self.options.recorder_capacity,
            )?);
        }
        Ok(())
    }

    fn step(&mut self) -> StreamState {
        if self.shutdown.is_triggered() {
            return StreamState::Stopped;
        }

        let frame = match self.source.read() {
            Ok(frame) => frame,
            Err(err) => {
                self.report.read_failures += 1;
                log::warn!("streamer[{}]: read failed: {:#}", self.camera, err);
                return StreamState::Reconnecting;
            }
        };
        self.report.frames_read += 1;

        if !self.gate.admit(Instant::now()) {
            self.report.frames_gated += 1;
            return StreamState::Running;
        }
        self.frame_number += 1;
        self.report.last_frame_number = self.frame_number;

        let output = match self.estimator.process(&frame) {
            Ok(output) => output,
            Err(err) => {
                self.report.inference_failures += 1;
                log::warn!(
                    "streamer[{}]: pose estimation failed on frame {}: {:#}",
                    self.camera,
                    self.frame_number,
                    err
                );
                return StreamState::Running;
            }
        };

        match self.write_output(&frame, &output.annotated) {
            Ok(true) => self.report.frames_emitted += 1,
            Ok(false) => self.report.frames_skipped += 1,
            Err(err) => {
                log::error!("streamer[{}]: output failed: {:#}", self.camera, err);
                return StreamState::Stopped;
            }
        }

        if !output.people.is_empty() {
            self.record(&frame, output.people);
        }
        self.maybe_log_health();
        StreamState::Running
    }

    /// Returns `Ok(false)` when the frame does not match the open sink.
    fn write_output(&mut self, frame: &Frame, annotated: &[u8]) -> Result<bool> {
        let (width, height) = frame.dimensions();
        if self.sink.is_none() {
            let spec = SinkSpec {
                width,
                height,
                fps: self.options.fps,
            };
            let sink = self.sink_factory.open(spec)?;
            log::info!(
                "streamer[{}]: output opened at {}x{} @ {} fps",
                self.camera,
                width,
                height,
                spec.fps
            );
            self.sink = Some((spec, sink));
        }
        let Some((spec, sink)) = self.sink.as_mut() else {
            return Ok(false);
        };
        if (spec.width, spec.height) != (width, height) {
            log::warn!(
                "streamer[{}]: dropping {}x{} frame, output is {}x{}",
                self.camera,
                width,
                height,
                spec.width,
                spec.height
            );
            return Ok(false);
        }
        sink.write_frame(annotated)?;
        Ok(true)
    }

    fn record(&mut self, frame: &Frame, people: Vec<PersonDetection>) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let record = NewDetection {
            camera_name: self.camera.clone(),
            timestamp: frame.captured_at,
            frame_number: self.frame_number,
            video_timestamp: frame.video_timestamp,
            detections: people,
        };
        if recorder.submit(record) {
            self.report.detections_queued += 1;
        } else {
            self.report.detections_dropped += 1;
        }
    }

    fn reconnect(&mut self) -> StreamState {
        let Some(address) = self.address.clone() else {
            log::error!(
                "streamer[{}]: stream lost and no address to reconnect to",
                self.camera
            );
            return StreamState::Stopped;
        };

        let mut delay = self.options.backoff.first_delay();
        loop {
            self.source.release();
            self.report.reconnect_attempts += 1;
            self.report.longest_backoff = self.report.longest_backoff.max(delay);
            log::info!(
                "streamer[{}]: reconnecting to {} in {:?} (attempt {})",
                self.camera,
                address,
                delay,
                self.report.reconnect_attempts
            );
            if self.shutdown.wait_timeout(delay) {
                return StreamState::Stopped;
            }
            match self.source.reopen(&address) {
                Ok(()) => {
                    self.report.reconnects += 1;
                    log::info!("streamer[{}]: reconnected to {}", self.camera, address);
                    return StreamState::Running;
                }
                Err(err) => {
                    log::warn!(
                        "streamer[{}]: reconnect to {} failed: {:#}",
                        self.camera,
                        address,
                        err
                    );
                    delay = self.options.backoff.next_delay(delay);
                }
            }
        }
    }

    fn maybe_log_health(&mut self) {
        if self.last_health_log.elapsed() < self.options.health_log_interval {
            return;
        }
        self.last_health_log = Instant::now();
        log::info!(
            "streamer[{}]: {} read, {} emitted, {} gated, {} detections queued, {} reconnects",
            self.camera,
            self.report.frames_read,
            self.report.frames_emitted,
            self.report.frames_gated,
            self.report.detections_queued,
            self.report.reconnects
        );
    }

    fn stop(&mut self) {
        self.source.release();
        if let Some((_, mut sink)) = self.sink.take() {
            if let Err(err) = sink.close_input() {
                log::warn!("streamer[{}]: closing output failed: {:#}", self.camera, err);
            }
            if let Err(err) = sink.wait() {
                log::warn!("streamer[{}]: output did not finish cleanly: {:#}", self.camera, err);
            }
        }
        if let Some(recorder) = self.recorder.take() {
            let stats = recorder.finish();
            self.report.detections_saved = stats.saved;
            self.report.detections_failed = stats.failed;
        }
        log::info!(
            "streamer[{}]: stopped after {} frames ({} emitted, {} reconnects)",
            self.camera,
            self.report.frames_read,
            self.report.frames_emitted,
            self.report.reconnects
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::StubBackend;
    use crate::sink::CountingSinkFactory;
    use anyhow::anyhow;
    use chrono::Utc;
    use std::collections::VecDeque;

    /// Source that replays a script of read outcomes, then fails forever.
    struct ScriptedSource {
        reads: VecDeque<bool>,
        released: usize,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame> {
            match self.reads.pop_front() {
                Some(true) => Frame::new(vec![0; 8 * 6 * 3], 8, 6, 0.0, Utc::now()),
                _ => Err(anyhow!("end of script")),
            }
        }

        fn reopen(&mut self, _address: &str) -> Result<()> {
            Err(anyhow!("cannot reopen a script"))
        }

        fn release(&mut self) {
            self.released += 1;
        }
    }

    #[test]
    fn stops_when_stream_lost_without_address() {
        let source = ScriptedSource {
            reads: VecDeque::from(vec![true, true]),
            released: 0,
        };
        let sinks = CountingSinkFactory::new();
        let streamer = PoseStreamer::new(
            "garage",
            Box::new(source),
            PoseEstimator::new(Box::new(StubBackend::new(0))),
            Box::new(sinks.clone()),
            ShutdownSignal::new(),
            StreamerOptions {
                fps: 1_000,
                ..StreamerOptions::default()
            },
        );

        let report = streamer.run();
        assert_eq!(report.frames_read, 2);
        assert_eq!(report.reconnect_attempts, 0);
        let tally = sinks.tally();
        assert_eq!(tally.opened.len(), 1);
        assert!(tally.closed && tally.drained);
    }

    #[test]
    fn shutdown_before_start_stops_immediately() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let streamer = PoseStreamer::new(
            "garage",
            Box::new(ScriptedSource {
                reads: VecDeque::from(vec![true; 10]),
                released: 0,
            }),
            PoseEstimator::new(Box::new(StubBackend::new(1))),
            Box::new(CountingSinkFactory::new()),
            shutdown,
            StreamerOptions::default(),
        );
        let report = streamer.run();
        assert_eq!(report.frames_read, 0);
        assert_eq!(report.frames_emitted, 0);
    }
}
