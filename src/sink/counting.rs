use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

use super::{OutputSink, SinkFactory, SinkSpec};

/// What a [`CountingSink`] has seen. Shared with whoever built the factory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkTally {
    pub opened: Vec<SinkSpec>,
    pub frames: u64,
    pub bytes: u64,
    pub closed: bool,
    pub drained: bool,
}

/// Discards frames, keeping only counts. Used when output is disabled.
pub struct CountingSink {
    tally: Arc<Mutex<SinkTally>>,
    closed: bool,
}

impl OutputSink for CountingSink {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()> {
        if self.closed {
            return Err(anyhow!("sink input already closed"));
        }
        let mut tally = self
            .tally
            .lock()
            .map_err(|_| anyhow!("sink tally lock poisoned"))?;
        tally.frames += 1;
        tally.bytes += pixels.len() as u64;
        Ok(())
    }

    fn close_input(&mut self) -> Result<()> {
        self.closed = true;
        if let Ok(mut tally) = self.tally.lock() {
            tally.closed = true;
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if let Ok(mut tally) = self.tally.lock() {
            tally.drained = true;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct CountingSinkFactory {
    tally: Arc<Mutex<SinkTally>>,
}

impl CountingSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tally(&self) -> SinkTally {
        self.tally
            .lock()
            .map(|tally| tally.clone())
            .unwrap_or_default()
    }
}

impl SinkFactory for CountingSinkFactory {
    fn open(&mut self, spec: SinkSpec) -> Result<Box<dyn OutputSink>> {
        self.tally
            .lock()
            .map_err(|_| anyhow!("sink tally lock poisoned"))?
            .opened
            .push(spec);
        Ok(Box::new(CountingSink {
            tally: self.tally.clone(),
            closed: false,
        }))
    }
}
