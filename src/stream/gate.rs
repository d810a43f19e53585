use std::time::{Duration, Instant};

/// Frame-rate gate.
///
/// Admits a frame only when at least `1/fps` has passed since the last
/// *admitted* frame. Frames arriving sooner are discarded, not queued.
#[derive(Clone, Debug)]
pub struct FrameGate {
    interval: Duration,
    last_emitted: Option<Instant>,
}

impl FrameGate {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            last_emitted: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_emitted {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_emitted = Some(now);
        true
    }
}
