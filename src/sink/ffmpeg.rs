use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{OutputSink, SinkFactory, SinkSpec};
use crate::frame::rgb_len;

/// How long to wait for the stderr reader after ffmpeg exits.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Encodes frames by piping raw video into an `ffmpeg` child process.
///
/// Output is H.264 (`libx264`, `veryfast`, `zerolatency`) written to a file,
/// or pushed to an RTSP server when the target starts with `rtsp://`.
pub struct FfmpegSink {
    target: String,
    frame_len: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_reader: Option<StderrReader>,
}

struct StderrReader {
    join: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

impl FfmpegSink {
    pub fn spawn(target: &str, spec: SinkSpec) -> Result<Self> {
        let frame_len = rgb_len(spec.width, spec.height)?;
        let is_rtsp = target.starts_with("rtsp://");
        if !is_rtsp {
            if let Some(parent) = Path::new(target).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("create output directory {}", parent.display())
                    })?;
                }
            }
        }

        let size = format!("{}x{}", spec.width, spec.height);
        let fps = spec.fps.max(1).to_string();
        let mut command = Command::new("ffmpeg");
        command
            .args(["-hide_banner", "-loglevel", "warning"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s", &size])
            .args(["-framerate", &fps, "-i", "pipe:0"])
            .args(["-pix_fmt", "yuv420p", "-c:v", "libx264", "-r", &fps])
            .args(["-preset", "veryfast", "-tune", "zerolatency"]);
        if is_rtsp {
            command.args(["-f", "rtsp"]);
        } else {
            command.arg("-y");
        }
        command
            .arg(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn ffmpeg for {}", target))?;
        let stdin = child.stdin.take();
        let stderr_reader = child.stderr.take().map(|stderr| {
            let (tx, done) = mpsc::channel();
            let label = target.to_string();
            let join = std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => log::debug!("ffmpeg[{}]: {}", label, line),
                        Err(_) => break,
                    }
                }
                let _ = tx.send(());
            });
            StderrReader { join, done }
        });

        log::info!(
            "FfmpegSink: encoding {} @ {} fps to {}",
            size,
            fps,
            target
        );
        Ok(Self {
            target: target.to_string(),
            frame_len,
            child,
            stdin,
            stderr_reader,
        })
    }
}

impl OutputSink for FfmpegSink {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()> {
        if pixels.len() != self.frame_len {
            return Err(anyhow!(
                "frame is {} bytes, sink {} expects {}",
                pixels.len(),
                self.target,
                self.frame_len
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg input for {} already closed", self.target))?;
        stdin
            .write_all(pixels)
            .with_context(|| format!("write frame to ffmpeg for {}", self.target))
    }

    fn close_input(&mut self) -> Result<()> {
        close_pipe(self.stdin.take(), &self.target)
    }

    fn wait(&mut self) -> Result<()> {
        self.close_input()?;
        let status = self
            .child
            .wait()
            .with_context(|| format!("wait for ffmpeg ({})", self.target))?;

        if let Some(reader) = self.stderr_reader.take() {
            match reader.done.recv_timeout(READER_JOIN_TIMEOUT) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if reader.join.join().is_err() {
                        log::warn!("FfmpegSink: stderr reader for {} panicked", self.target);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "FfmpegSink: stderr reader for {} did not finish within {:?}",
                        self.target,
                        READER_JOIN_TIMEOUT
                    );
                }
            }
        }

        if !status.success() {
            return Err(anyhow!("ffmpeg for {} exited with {}", self.target, status));
        }
        log::info!("FfmpegSink: finished writing {}", self.target);
        Ok(())
    }
}

/// Flush and drop the encoder's input so it sees end of stream.
fn close_pipe<W: Write>(pipe: Option<W>, target: &str) -> Result<()> {
    match pipe {
        Some(mut pipe) => pipe
            .flush()
            .with_context(|| format!("flush ffmpeg input for {}", target)),
        None => Ok(()),
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            // Dropped without an orderly close; don't leave an orphan encoder.
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Opens one [`FfmpegSink`] per call, all writing to the same target.
pub struct FfmpegSinkFactory {
    target: String,
}

impl FfmpegSinkFactory {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn open(&mut self, spec: SinkSpec) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(FfmpegSink::spawn(&self.target, spec)?))
    }
}
