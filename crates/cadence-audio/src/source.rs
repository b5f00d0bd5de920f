//! Decode sources feeding stream sessions.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;

use cadence_core::{Error, Result};

/// A positioned reader of interleaved f32 samples.
///
/// A source is exclusively owned by one stream session, which is the only code
/// that closes or reopens it.
pub trait DecodeSource: Send {
    /// Decode up to `dst.len()` interleaved samples into `dst`.
    ///
    /// Returns the number of samples written, always a whole number of frames.
    /// `0` means the end of the stream was reached.
    fn read_samples(&mut self, dst: &mut [f32]) -> Result<usize>;

    /// Move the decode cursor to a frame offset from the start.
    fn seek(&mut self, frame: u64) -> Result<()>;

    /// Current decode cursor, in frames from the start.
    fn position(&self) -> u64;

    fn channels(&self) -> u16;

    fn sample_rate(&self) -> u32;

    /// Release decoder resources. Reads fail until [`DecodeSource::reopen`].
    fn close(&mut self);

    /// Close and open the source again, positioned at the start.
    fn reopen(&mut self) -> Result<()>;
}

/// Source over samples already held in memory.
///
/// Useful for generated audio, short effects, and deterministic tests.
#[derive(Debug, Clone)]
pub struct MemorySource {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
    cursor: usize,
    max_read: Option<usize>,
    fail_after_reads: Option<usize>,
    reads: usize,
    closed: bool,
}

impl MemorySource {
    /// Create a source over interleaved samples.
    pub fn new(samples: impl Into<Arc<[f32]>>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            sample_rate,
            cursor: 0,
            max_read: None,
            fail_after_reads: None,
            reads: 0,
            closed: false,
        }
    }

    /// A mono sine tone.
    pub fn sine(frequency: f32, seconds: f32, sample_rate: u32) -> Self {
        let frames = (seconds * sample_rate as f32) as usize;
        let step = std::f32::consts::TAU * frequency / sample_rate as f32;
        let samples: Vec<f32> = (0..frames).map(|i| (i as f32 * step).sin() * 0.5).collect();
        Self::new(samples, 1, sample_rate)
    }

    /// Cap every read at `max_samples`, regardless of the destination size.
    pub fn with_max_read(mut self, max_samples: usize) -> Self {
        self.max_read = Some(max_samples);
        self
    }

    /// Make every read after the first `reads` fail with a decode error.
    pub const fn with_read_failure_after(mut self, reads: usize) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    /// Total length in frames.
    pub fn frames(&self) -> u64 {
        (self.samples.len() / usize::from(self.channels)) as u64
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl DecodeSource for MemorySource {
    fn read_samples(&mut self, dst: &mut [f32]) -> Result<usize> {
        if self.closed {
            return Err(Error::Decode("read from a closed source".to_string()));
        }
        if self.fail_after_reads.is_some_and(|limit| self.reads >= limit) {
            return Err(Error::Decode("simulated decoder failure".to_string()));
        }
        self.reads += 1;

        let channels = usize::from(self.channels);
        let remaining = self.samples.len() - self.cursor;
        let mut count = dst.len().min(remaining);
        if let Some(max) = self.max_read {
            count = count.min(max);
        }
        count -= count % channels;

        dst[..count].copy_from_slice(&self.samples[self.cursor..self.cursor + count]);
        self.cursor += count;
        Ok(count)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        if self.closed {
            return Err(Error::Decode("seek on a closed source".to_string()));
        }
        let frame = frame.min(self.frames()) as usize;
        self.cursor = frame * usize::from(self.channels);
        Ok(())
    }

    fn position(&self) -> u64 {
        (self.cursor / usize::from(self.channels)) as u64
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn reopen(&mut self) -> Result<()> {
        self.closed = false;
        self.cursor = 0;
        Ok(())
    }
}
