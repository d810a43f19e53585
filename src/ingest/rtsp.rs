//! RTSP frame source.
//!
//! `RtspSource` reads RGB24 frames from an IP camera. Real streams are decoded
//! with GStreamer (feature `rtsp-gstreamer`); `stub://` URLs produce a
//! synthetic moving pattern paced at the configured frame rate, which is what
//! tests and dry runs use.
//!
//! The source itself never reconnects. A failed `read` is reported to the
//! caller, which decides whether to `release` and `reopen`.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// `rtsp://`, `rtsps://` or `stub://name`.
    pub url: String,
    /// Native frame rate of synthetic streams; also sizes the pull timeout.
    pub target_fps: u32,
    /// Synthetic frame size. Live streams report their own.
    pub width: u32,
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera_1".to_string(),
            target_fps: 25,
            width: 640,
            height: 480,
        }
    }
}

/// Counters kept across reopens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtspStats {
    pub frames_read: u64,
    pub read_errors: u64,
    pub reopens: u64,
}

pub struct RtspSource {
    config: RtspConfig,
    connection: Option<Connection>,
    stats: RtspStats,
    last_read_failed: bool,
}

enum Connection {
    Synthetic(SyntheticStream),
    #[cfg(feature = "rtsp-gstreamer")]
    Live(GstPipeline),
}

impl Connection {
    fn open(config: &RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            log::info!("RtspSource: connected to {} (synthetic)", config.url);
            return Ok(Connection::Synthetic(SyntheticStream::new(config.clone())));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            GstPipeline::start(config).map(Connection::Live)
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(anyhow!(
                "{} needs a build with the rtsp-gstreamer feature",
                config.url
            ))
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match self {
            Connection::Synthetic(stream) => stream.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            Connection::Live(pipeline) => pipeline.next_frame(),
        }
    }

    fn close(&mut self) {
        #[cfg(feature = "rtsp-gstreamer")]
        if let Connection::Live(pipeline) = self {
            pipeline.stop();
        }
    }
}

impl RtspSource {
    /// Connect now; an unreachable camera is an error.
    pub fn open(config: RtspConfig) -> Result<Self> {
        let connection = Connection::open(&config)?;
        Ok(Self::with_connection(config, Some(connection)))
    }

    /// Like [`open`](Self::open), but an unreachable camera yields a released
    /// source. Its first `read` fails, so the streamer starts out reconnecting.
    pub fn open_or_released(config: RtspConfig) -> Self {
        let connection = Connection::open(&config)
            .map_err(|err| {
                log::warn!("RtspSource: initial open of {} failed: {:#}", config.url, err);
            })
            .ok();
        Self::with_connection(config, connection)
    }

    fn with_connection(config: RtspConfig, connection: Option<Connection>) -> Self {
        Self {
            config,
            connection,
            stats: RtspStats::default(),
            last_read_failed: false,
        }
    }

    /// Connected, and the most recent read (if any) produced a frame.
    pub fn is_healthy(&self) -> bool {
        self.connection.is_some() && !self.last_read_failed
    }

    pub fn stats(&self) -> RtspStats {
        self.stats
    }
}

impl FrameSource for RtspSource {
    fn read(&mut self) -> Result<Frame> {
        let result = match self.connection.as_mut() {
            Some(connection) => connection.next_frame(),
            None => Err(anyhow!("RTSP source {} is released", self.config.url)),
        };
        self.last_read_failed = result.is_err();
        match result {
            Ok(_) => self.stats.frames_read += 1,
            Err(_) => self.stats.read_errors += 1,
        }
        result
    }

    fn reopen(&mut self, address: &str) -> Result<()> {
        self.release();
        self.config.url = address.to_string();
        self.connection = Some(Connection::open(&self.config)?);
        self.last_read_failed = false;
        self.stats.reopens += 1;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            log::info!("RtspSource: released {}", self.config.url);
        }
    }

    fn address(&self) -> Option<&str> {
        Some(&self.config.url)
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// stub:// streams
// ----------------------------------------------------------------------------

struct SyntheticStream {
    config: RtspConfig,
    sequence: u64,
    period: Duration,
    due: Option<Instant>,
}

impl SyntheticStream {
    fn new(config: RtspConfig) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(config.target_fps.max(1)));
        Self {
            config,
            sequence: 0,
            period,
            due: None,
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        // Pace like a live camera.
        if let Some(due) = self.due {
            let wait = due.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
        self.due = Some(Instant::now() + self.period);

        let media_time = self.sequence as f64 * self.period.as_secs_f64();
        let pixels = self.render();
        self.sequence += 1;
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            media_time,
            Utc::now(),
        )
    }

    /// Diagonal gradient shifted by the frame sequence.
    fn render(&self) -> Vec<u8> {
        let width = self.config.width.max(1) as usize;
        let height = self.config.height as usize;
        let shift = self.sequence as usize;
        (0..height)
            .flat_map(|y| (0..width).map(move |x| ((x + y + shift) % 256) as u8))
            .flat_map(|value| [value; 3])
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Live streams via GStreamer
// ----------------------------------------------------------------------------

/// Longest wait for a decoded sample before the stream counts as stalled.
#[cfg(feature = "rtsp-gstreamer")]
const MIN_PULL_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(feature = "rtsp-gstreamer")]
struct GstPipeline {
    url: String,
    pull_timeout: Duration,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    started: Instant,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstPipeline {
    /// `rtspsrc ! decodebin ! videoconvert ! appsink` producing RGB, keeping
    /// only the newest sample. TCP transport is forced for `rtsps://`.
    fn start(config: &RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let protocols = if config.url.starts_with("rtsps://") {
            " protocols=tcp"
        } else {
            ""
        };
        let description = format!(
            "rtspsrc location={url} latency=0{protocols} ! decodebin ! videoconvert ! \
             appsink name=frames caps=video/x-raw,format=RGB sync=false max-buffers=1 drop=true",
            url = config.url,
            protocols = protocols,
        );
        let pipeline = gstreamer::parse::launch(&description)
            .with_context(|| format!("build pipeline for {}", config.url))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("parsed element is not a pipeline"))?;
        let appsink = pipeline
            .by_name("frames")
            .context("pipeline has no appsink")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("frames element is not an appsink"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start pipeline for {}", config.url))?;
        log::info!("RtspSource: streaming {}", config.url);

        let frame_budget = Duration::from_secs_f64(4.0 / config.target_fps.max(1) as f64);
        Ok(Self {
            url: config.url.clone(),
            pull_timeout: frame_budget.max(MIN_PULL_TIMEOUT),
            pipeline,
            appsink,
            started: Instant::now(),
        })
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;
        let millis = u64::try_from(self.pull_timeout.as_millis()).unwrap_or(u64::MAX);
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(millis))
            .ok_or_else(|| anyhow!("no frame from {} within {:?}", self.url, self.pull_timeout))?;

        let decoded = decode_sample(&sample)?;
        let video_timestamp = decoded
            .pts
            .unwrap_or_else(|| self.started.elapsed().as_secs_f64());
        Frame::new(
            decoded.pixels,
            decoded.width,
            decoded.height,
            video_timestamp,
            Utc::now(),
        )
    }

    /// Surface errors and end-of-stream posted since the last read.
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            match message.view() {
                gstreamer::MessageView::Error(err) => {
                    return Err(anyhow!("{} failed: {}", self.url, err.error()));
                }
                gstreamer::MessageView::Eos(..) => {
                    return Err(anyhow!("{} ended", self.url));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: could not stop {}: {}", self.url, err);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
struct DecodedSample {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    pts: Option<f64>,
}

/// Copy a sample into tightly packed RGB24, dropping row padding.
#[cfg(feature = "rtsp-gstreamer")]
fn decode_sample(sample: &gstreamer::Sample) -> Result<DecodedSample> {
    let caps = sample.caps().context("sample without caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("sample caps are not video")?;
    let buffer = sample.buffer().context("sample without buffer")?;
    let pts = buffer.pts().map(|pts| pts.nseconds() as f64 / 1e9);
    let map = buffer.map_readable().context("map sample buffer")?;

    let (width, height) = (info.width(), info.height());
    let packed_row = crate::frame::rgb_len(width, 1)?;
    let stride = usize::try_from(info.stride()[0]).context("negative stride")?;
    if stride < packed_row {
        return Err(anyhow!("stride {} shorter than a {}-pixel row", stride, width));
    }

    let pixels: Vec<u8> = map
        .as_slice()
        .chunks(stride)
        .take(height as usize)
        .flat_map(|row| row.iter().take(packed_row).copied())
        .collect();
    Ok(DecodedSample {
        pixels,
        width,
        height,
        pts,
    })
}
