use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use posewatch::sink::{CountingSinkFactory, OutputSink, SinkFactory, SinkSpec};
use posewatch::storage::{format_timestamp, DetectionStore};
use posewatch::stream::{Backoff, PoseStreamer, ShutdownSignal, StreamReport, StreamerOptions};
use posewatch::{Frame, FrameSource, PersonDetection, PoseBackend, PoseEstimator, StubBackend};

const ADDRESS: &str = "rtsp://camera.test/stream";

#[derive(Default)]
struct SourceLog {
    reads: u64,
    releases: u64,
    reopens: Vec<(String, Instant)>,
}

/// Scripted camera: serves `frames_left` frames, then drops; reopens fail
/// `reopen_failures` times before succeeding.
struct MockSource {
    log: Arc<Mutex<SourceLog>>,
    open: bool,
    frames_left: Option<u64>,
    frames_after_reopen: Option<u64>,
    reopen_failures: u32,
    size: (u32, u32),
    size_after_reopen: (u32, u32),
    interval: Duration,
    served: u64,
}

impl MockSource {
    fn new(interval: Duration) -> (Self, Arc<Mutex<SourceLog>>) {
        let log = Arc::new(Mutex::new(SourceLog::default()));
        (
            Self {
                log: log.clone(),
                open: true,
                frames_left: None,
                frames_after_reopen: None,
                reopen_failures: 0,
                size: (16, 12),
                size_after_reopen: (16, 12),
                interval,
                served: 0,
            },
            log,
        )
    }
}

impl FrameSource for MockSource {
    fn read(&mut self) -> Result<Frame> {
        self.log.lock().unwrap().reads += 1;
        if !self.open {
            bail!("source released");
        }
        if self.frames_left == Some(0) {
            bail!("stream dropped");
        }
        std::thread::sleep(self.interval);
        if let Some(left) = self.frames_left.as_mut() {
            *left -= 1;
        }
        self.served += 1;
        let (w, h) = self.size;
        Frame::new(
            vec![90; (w * h * 3) as usize],
            w,
            h,
            self.served as f64 / 25.0,
            Utc::now(),
        )
    }

    fn reopen(&mut self, address: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .reopens
            .push((address.to_string(), Instant::now()));
        if self.reopen_failures > 0 {
            self.reopen_failures -= 1;
            bail!("camera unreachable");
        }
        self.open = true;
        self.frames_left = self.frames_after_reopen;
        self.size = self.size_after_reopen;
        Ok(())
    }

    fn release(&mut self) {
        self.open = false;
        self.log.lock().unwrap().releases += 1;
    }

    fn address(&self) -> Option<&str> {
        Some(ADDRESS)
    }
}

fn options(fps: u32, initial: Duration, max: Duration) -> StreamerOptions {
    StreamerOptions {
        fps,
        backoff: Backoff {
            initial_delay: initial,
            max_delay: max,
            multiplier: 2.0,
        },
        ..StreamerOptions::default()
    }
}

fn run_for(streamer: PoseStreamer, shutdown: &ShutdownSignal, window: Duration) -> StreamReport {
    let worker = std::thread::spawn(move || streamer.run());
    std::thread::sleep(window);
    shutdown.trigger();
    worker.join().expect("streamer thread")
}

#[test]
fn emitted_frames_respect_fps() {
    let (source, _log) = MockSource::new(Duration::from_millis(2));
    let shutdown = ShutdownSignal::new();
    let sinks = CountingSinkFactory::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(0))),
        Box::new(sinks.clone()),
        shutdown.clone(),
        options(10, Duration::from_millis(10), Duration::from_millis(50)),
    );

    let started = Instant::now();
    let report = run_for(streamer, &shutdown, Duration::from_millis(550));
    let elapsed = started.elapsed().as_secs_f64();

    let bound = (elapsed * 10.0).ceil() as u64 + 1;
    assert!(
        report.frames_emitted <= bound,
        "{} emitted in {:.3}s",
        report.frames_emitted,
        elapsed
    );
    assert!(report.frames_emitted >= 3);
    assert!(report.frames_gated > 0);
    assert_eq!(
        report.frames_read,
        report.frames_emitted + report.frames_gated
    );

    let tally = sinks.tally();
    assert_eq!(tally.frames, report.frames_emitted);
    assert_eq!(
        tally.opened,
        vec![SinkSpec {
            width: 16,
            height: 12,
            fps: 10
        }]
    );
    assert!(tally.closed && tally.drained);
}

#[test]
fn reconnects_with_growing_backoff_at_original_address() {
    let (mut source, log) = MockSource::new(Duration::from_millis(1));
    source.frames_left = Some(3);
    source.reopen_failures = 2;
    let shutdown = ShutdownSignal::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(0))),
        Box::new(CountingSinkFactory::new()),
        shutdown.clone(),
        options(1_000, Duration::from_millis(20), Duration::from_millis(80)),
    );

    let report = run_for(streamer, &shutdown, Duration::from_millis(400));

    let log = log.lock().unwrap();
    assert_eq!(log.reopens.len(), 3);
    assert!(log.reopens.iter().all(|(addr, _)| addr == ADDRESS));
    // waits before attempts 2 and 3 are 40ms and 80ms
    let first_gap = log.reopens[1].1 - log.reopens[0].1;
    let second_gap = log.reopens[2].1 - log.reopens[1].1;
    assert!(first_gap >= Duration::from_millis(40), "{:?}", first_gap);
    assert!(second_gap >= Duration::from_millis(80), "{:?}", second_gap);
    // released before every attempt and once more when stopping
    assert!(log.releases >= 4);

    assert_eq!(report.reconnect_attempts, 3);
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.longest_backoff, Duration::from_millis(80));
    // streaming resumed and frame numbering carried on past the drop
    assert!(report.frames_read > 3);
    assert!(report.last_frame_number > 3);
}

#[test]
fn backoff_never_exceeds_ceiling() {
    let (mut source, log) = MockSource::new(Duration::from_millis(1));
    source.frames_left = Some(0);
    source.reopen_failures = u32::MAX;
    let shutdown = ShutdownSignal::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(0))),
        Box::new(CountingSinkFactory::new()),
        shutdown.clone(),
        options(5, Duration::from_millis(5), Duration::from_millis(20)),
    );

    let report = run_for(streamer, &shutdown, Duration::from_millis(300));
    assert!(report.reconnect_attempts >= 5);
    assert_eq!(report.reconnects, 0);
    assert_eq!(report.longest_backoff, Duration::from_millis(20));
    assert_eq!(report.frames_emitted, 0);
    assert!(log.lock().unwrap().reopens.len() as u64 <= report.reconnect_attempts);
}

#[test]
fn shutdown_interrupts_backoff_wait() {
    let (mut source, log) = MockSource::new(Duration::from_millis(1));
    source.frames_left = Some(1);
    source.reopen_failures = u32::MAX;
    let shutdown = ShutdownSignal::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(0))),
        Box::new(CountingSinkFactory::new()),
        shutdown.clone(),
        options(5, Duration::from_secs(30), Duration::from_secs(30)),
    );

    let worker = std::thread::spawn(move || streamer.run());
    std::thread::sleep(Duration::from_millis(100));
    let stopped_at = Instant::now();
    shutdown.trigger();
    let report = worker.join().expect("streamer thread");

    assert!(stopped_at.elapsed() < Duration::from_secs(5));
    assert_eq!(report.reconnect_attempts, 1);
    assert!(log.lock().unwrap().reopens.is_empty());
}

#[test]
fn lost_stream_without_address_stops() {
    let (mut source, _log) = MockSource::new(Duration::from_millis(1));
    source.frames_left = Some(2);
    let sinks = CountingSinkFactory::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(0))),
        Box::new(sinks.clone()),
        ShutdownSignal::new(),
        options(1_000, Duration::from_millis(10), Duration::from_millis(10)),
    )
    .with_address(None);

    // returns on its own, no shutdown needed
    let report = streamer.run();
    assert_eq!(report.reconnect_attempts, 0);
    assert_eq!(report.read_failures, 1);
    assert!(sinks.tally().drained);
}

#[test]
fn mismatched_resolution_after_reconnect_is_dropped() {
    let (mut source, _log) = MockSource::new(Duration::from_millis(2));
    source.frames_left = Some(2);
    source.size_after_reopen = (32, 24);
    let shutdown = ShutdownSignal::new();
    let sinks = CountingSinkFactory::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(0))),
        Box::new(sinks.clone()),
        shutdown.clone(),
        options(1_000, Duration::from_millis(5), Duration::from_millis(5)),
    );

    let report = run_for(streamer, &shutdown, Duration::from_millis(150));
    let tally = sinks.tally();
    assert_eq!(tally.opened.len(), 1);
    assert_eq!((tally.opened[0].width, tally.opened[0].height), (16, 12));
    assert_eq!(tally.bytes, tally.frames * 16 * 12 * 3);
    assert!(report.frames_skipped > 0);
}

struct FlakyBackend {
    calls: u64,
}

impl PoseBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn estimate(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<Vec<PersonDetection>> {
        self.calls += 1;
        if self.calls % 2 == 0 {
            return Err(anyhow!("model hiccup"));
        }
        Ok(Vec::new())
    }
}

#[test]
fn inference_failure_skips_frame_and_continues() {
    let (source, _log) = MockSource::new(Duration::from_millis(2));
    let shutdown = ShutdownSignal::new();
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(FlakyBackend { calls: 0 })),
        Box::new(CountingSinkFactory::new()),
        shutdown.clone(),
        options(1_000, Duration::from_millis(5), Duration::from_millis(5)),
    );

    let report = run_for(streamer, &shutdown, Duration::from_millis(150));
    assert!(report.inference_failures >= 2);
    assert!(report.frames_emitted >= 2);
    assert_eq!(report.reconnect_attempts, 0);
}

struct BrokenSinkFactory;

struct BrokenSink;

impl OutputSink for BrokenSink {
    fn write_frame(&mut self, _pixels: &[u8]) -> Result<()> {
        Err(anyhow!("broken pipe"))
    }

    fn close_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SinkFactory for BrokenSinkFactory {
    fn open(&mut self, _spec: SinkSpec) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(BrokenSink))
    }
}

#[test]
fn sink_write_failure_stops_camera() {
    let (source, log) = MockSource::new(Duration::from_millis(1));
    let streamer = PoseStreamer::new(
        "front",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(1))),
        Box::new(BrokenSinkFactory),
        ShutdownSignal::new(),
        options(1_000, Duration::from_millis(5), Duration::from_millis(5)),
    );

    let report = streamer.run();
    assert_eq!(report.frames_read, 1);
    assert_eq!(report.frames_emitted, 0);
    assert_eq!(report.detections_queued, 0);
    assert_eq!(log.lock().unwrap().releases, 1);
}

#[test]
fn detections_are_persisted_in_frame_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stream.db");
    let store = Arc::new(DetectionStore::open(path.to_str().unwrap(), 2)?);

    let (source, _log) = MockSource::new(Duration::from_millis(3));
    let shutdown = ShutdownSignal::new();
    let streamer = PoseStreamer::new(
        "porch",
        Box::new(source),
        PoseEstimator::new(Box::new(StubBackend::new(2))),
        Box::new(CountingSinkFactory::new()),
        shutdown.clone(),
        options(100, Duration::from_millis(5), Duration::from_millis(5)),
    )
    .with_store(store.clone());

    let report = run_for(streamer, &shutdown, Duration::from_millis(200));
    assert!(report.detections_queued > 0);
    assert_eq!(
        report.detections_saved,
        report.detections_queued,
        "recorder not drained on stop"
    );

    let start = format_timestamp(Utc::now() - chrono::Duration::minutes(5));
    let end = format_timestamp(Utc::now() + chrono::Duration::minutes(5));
    let rows = store.get_detections_by_timerange("porch", &start, &end, None)?;
    assert_eq!(rows.len() as u64, report.detections_saved);
    assert!(rows.windows(2).all(|w| w[0].frame_number < w[1].frame_number));
    assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(rows[0].frame_number, 1);
    assert!(rows.iter().all(|row| row.detection_data.len() == 2));
    Ok(())
}
