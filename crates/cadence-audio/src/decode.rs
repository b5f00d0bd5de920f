//! Compressed audio decoding using symphonia.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use cadence_core::{Error, Result};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::Duration as FrameCount,
};
use tracing::{debug, trace, warn};

use crate::source::DecodeSource;

/// Container reader and codec for one audio track.
struct TrackReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    total_frames: Option<u64>,
}

impl TrackReader {
    fn probe(data: &Bytes, extension: Option<&str>) -> Result<Self> {
        let cursor = Cursor::new(data.clone());
        let mss = MediaSourceStream::new(Box::new(cursor), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to probe format: {e}")))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio tracks found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::UnsupportedFormat("track has no sample rate".to_string()))?;
        #[allow(clippy::cast_possible_truncation)]
        let channels = track.codec_params.channels.map_or(2, |c| c.count() as u16);
        let total_frames = track.codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {e}")))?;

        debug!("Audio track: id={track_id}, sample_rate={sample_rate}, channels={channels}");

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            total_frames,
        })
    }

    /// Decode the next packet of our track into interleaved f32 samples.
    ///
    /// `Ok(None)` marks the end of the stream.
    fn next_samples(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {e}"))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let mut buffer =
                        SampleBuffer::<f32>::new(decoded.capacity() as FrameCount, *decoded.spec());
                    buffer.copy_interleaved_ref(decoded);
                    return Ok(Some(buffer.samples().to_vec()));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping corrupt packet: {e}");
                }
                Err(e) => return Err(Error::Decode(format!("Decode failed: {e}"))),
            }
        }
    }

    /// Seek to a frame; returns how many decoded frames to drop to land exactly on it.
    fn seek(&mut self, frame: u64) -> Result<u64> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| Error::Decode(format!("Seek failed: {e}")))?;

        self.decoder.reset();
        Ok(seeked.required_ts.saturating_sub(seeked.actual_ts))
    }
}

/// [`DecodeSource`] decoding any container/codec symphonia understands.
///
/// The encoded bytes are retained so the source can be reopened after a stop.
pub struct SymphoniaSource {
    data: Bytes,
    extension: Option<String>,
    reader: Option<TrackReader>,
    sample_rate: u32,
    channels: u16,
    /// Decoded samples not yet handed out.
    pending: Vec<f32>,
    pending_pos: usize,
    /// Frames to drop after an inexact seek.
    skip_frames: u64,
    position: u64,
}

impl SymphoniaSource {
    /// Open a file, using its extension as a probe hint.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let extension = path.extension().and_then(|e| e.to_str());
        debug!("Opened {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(Bytes::from(data), extension)
    }

    /// Decode from an in-memory encoded stream.
    pub fn from_bytes(data: Bytes, extension: Option<&str>) -> Result<Self> {
        let reader = TrackReader::probe(&data, extension)?;
        Ok(Self {
            sample_rate: reader.sample_rate,
            channels: reader.channels,
            data,
            extension: extension.map(String::from),
            reader: Some(reader),
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
            position: 0,
        })
    }

    /// Total length in frames, if the container reports it.
    pub fn total_frames(&self) -> Option<u64> {
        self.reader.as_ref().and_then(|r| r.total_frames)
    }

    /// Total length in seconds, if known.
    pub fn duration_secs(&self) -> Option<f64> {
        self.total_frames()
            .map(|frames| frames as f64 / f64::from(self.sample_rate))
    }

    fn reset_pending(&mut self) {
        self.pending.clear();
        self.pending_pos = 0;
    }
}

impl DecodeSource for SymphoniaSource {
    fn read_samples(&mut self, dst: &mut [f32]) -> Result<usize> {
        let channels = usize::from(self.channels);
        let wanted = dst.len() - dst.len() % channels;
        let mut written = 0;

        while written < wanted {
            if self.pending_pos >= self.pending.len() {
                let reader = self
                    .reader
                    .as_mut()
                    .ok_or_else(|| Error::Decode("read from a closed source".to_string()))?;
                match reader.next_samples()? {
                    Some(samples) => {
                        self.pending = samples;
                        self.pending_pos = 0;
                    }
                    None => break,
                }

                if self.skip_frames > 0 {
                    let available = (self.pending.len() / channels) as u64;
                    let skipped = self.skip_frames.min(available);
                    self.pending_pos = skipped as usize * channels;
                    self.skip_frames -= skipped;
                }
                continue;
            }

            let count = (wanted - written).min(self.pending.len() - self.pending_pos);
            dst[written..written + count]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + count]);
            self.pending_pos += count;
            written += count;
        }

        self.position += (written / channels) as u64;
        trace!("Decoded {written} samples");
        Ok(written)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::Decode("seek on a closed source".to_string()))?;

        self.skip_frames = reader.seek(frame)?;
        self.reset_pending();
        self.position = frame;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        self.reader = None;
        self.reset_pending();
    }

    fn reopen(&mut self) -> Result<()> {
        self.close();
        self.reader = Some(TrackReader::probe(&self.data, self.extension.as_deref())?);
        self.skip_frames = 0;
        self.position = 0;
        Ok(())
    }
}
