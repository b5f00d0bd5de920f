//! Sample-rate conversion using rubato.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use cadence_core::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

const CHUNK_FRAMES: usize = 1024;

/// Converts interleaved f32 audio from a source rate to the device rate.
///
/// Input is accumulated per channel and converted in blocks of
/// [`Resampler::block_frames`]. The filter delay is trimmed from the start of
/// the output and [`Resampler::flush`] pushes out everything still held, so the
/// total output is exactly the input length scaled by the rate ratio.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: Option<FftFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    block_frames: usize,
    /// Deinterleaved input not yet converted.
    pending: Vec<Vec<f32>>,
    /// Leading output frames that are filter delay rather than signal.
    skip_frames: usize,
    frames_in: u64,
    frames_out: u64,
}

impl Resampler {
    /// Create a resampler with the default block size. Equal rates produce a
    /// pass-through.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        Self::with_block(input_rate, output_rate, channels, CHUNK_FRAMES)
    }

    /// Create a resampler converting `block_frames` input frames at a time.
    ///
    /// Matching the block to the size of each write means every write of that
    /// size converts in full.
    pub fn with_block(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        block_frames: usize,
    ) -> Result<Self> {
        let channels = channels.max(1);
        let block_frames = block_frames.max(1);
        let resampler = if input_rate == output_rate {
            None
        } else {
            let sub_chunks = if block_frames >= 2 { 2 } else { 1 };
            let inner = FftFixedIn::new(
                input_rate as usize,
                output_rate as usize,
                block_frames,
                sub_chunks,
                channels,
            )
            .map_err(|e| Error::Backend(format!("Failed to create resampler: {e}")))?;
            debug!(
                "Resampler created: {input_rate}Hz -> {output_rate}Hz, {channels} channels, \
                 {block_frames} frame blocks"
            );
            Some(inner)
        };
        let skip_frames = resampler.as_ref().map_or(0, |inner| inner.output_delay());

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            block_frames,
            pending: vec![Vec::new(); channels],
            skip_frames,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub const fn needs_resampling(&self) -> bool {
        self.input_rate != self.output_rate
    }

    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    pub const fn block_frames(&self) -> usize {
        self.block_frames
    }

    /// Feed interleaved samples, returning whatever full blocks converted to.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if self.resampler.is_none() {
            return Ok(input.to_vec());
        }

        for frame in input.chunks_exact(self.channels) {
            for (buffer, &sample) in self.pending.iter_mut().zip(frame) {
                buffer.push(sample);
            }
        }
        self.frames_in += (input.len() / self.channels) as u64;

        let block_frames = self.block_frames;
        let mut output = Vec::new();
        while self.pending[0].len() >= block_frames {
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..block_frames).collect())
                .collect();
            let converted = self.convert(&block)?;
            self.emit(&converted, usize::MAX, &mut output);
        }
        Ok(output)
    }

    /// Convert the buffered input and the filter tail, then start over.
    ///
    /// Zero blocks are fed until the output matches the input length at the
    /// output rate; anything past that is padding and is dropped.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut output = Vec::new();
        let Some(delay) = self.resampler.as_ref().map(|inner| inner.output_delay()) else {
            return Ok(output);
        };

        let expected = self.expected_output_frames();
        let block_frames = self.block_frames;
        #[allow(clippy::cast_possible_truncation)]
        let delay_in = (delay as u64 * u64::from(self.input_rate)
            / u64::from(self.output_rate)) as usize;
        let max_blocks = (self.pending[0].len() + delay_in) / block_frames + 3;

        for _ in 0..max_blocks {
            if self.frames_out >= expected {
                break;
            }
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| {
                    let mut data = std::mem::take(ch);
                    data.resize(block_frames, 0.0);
                    data
                })
                .collect();
            let converted = self.convert(&block)?;
            #[allow(clippy::cast_possible_truncation)]
            let remaining = (expected - self.frames_out) as usize;
            self.emit(&converted, remaining, &mut output);
        }
        self.reset();
        Ok(output)
    }

    /// Drop buffered input and filter history, e.g. after a seek.
    pub fn reset(&mut self) {
        if let Some(inner) = self.resampler.as_mut() {
            inner.reset();
        }
        self.pending.iter_mut().for_each(Vec::clear);
        self.skip_frames = self
            .resampler
            .as_ref()
            .map_or(0, |inner| inner.output_delay());
        self.frames_in = 0;
        self.frames_out = 0;
    }

    /// Output frames owed for everything fed since the last reset.
    fn expected_output_frames(&self) -> u64 {
        let input_rate = u64::from(self.input_rate);
        (self.frames_in * u64::from(self.output_rate)).div_ceil(input_rate)
    }

    /// Interleave converted frames into `out`, dropping the filter delay first.
    fn emit(&mut self, planar: &[Vec<f32>], max_frames: usize, out: &mut Vec<f32>) {
        let available = planar.first().map_or(0, Vec::len);
        let skip = self.skip_frames.min(available);
        self.skip_frames -= skip;
        let before = out.len();
        interleave_into(planar, skip, max_frames, out);
        self.frames_out += ((out.len() - before) / self.channels) as u64;
    }

    fn convert(&mut self, block: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let Some(inner) = self.resampler.as_mut() else {
            return Ok(block.to_vec());
        };
        inner
            .process(block, None)
            .map_err(|e| Error::Backend(format!("Resample failed: {e}")))
    }
}

/// Append up to `max_frames` frames of planar audio to `out`, interleaved,
/// starting at frame `skip`.
fn interleave_into(planar: &[Vec<f32>], skip: usize, max_frames: usize, out: &mut Vec<f32>) {
    let Some(first) = planar.first() else {
        return;
    };
    let end = first.len().min(skip.saturating_add(max_frames));
    if skip >= end {
        return;
    }
    out.reserve((end - skip) * planar.len());
    for frame in skip..end {
        out.extend(planar.iter().map(|ch| ch[frame]));
    }
}
