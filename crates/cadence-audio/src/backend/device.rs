//! Hardware output through cpal.
//!
//! All voices are mixed into a single output stream. cpal streams are not
//! `Send` on every platform, so the stream lives on its own thread and the
//! callback only touches the shared [`Mixer`].

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cadence_core::{BufferFormat, BufferHandle, Error, Result, VoiceState};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{AudioBackend, Voice};
use crate::resample::Resampler;

/// Uploaded contents of one hardware buffer.
#[derive(Debug, Default)]
struct Slot {
    samples: Vec<f32>,
    channels: usize,
}

impl Slot {
    fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    fn frame(&self, index: usize) -> [f32; 2] {
        if self.channels == 1 {
            let s = self.samples[index];
            [s, s]
        } else {
            let base = index * self.channels;
            [self.samples[base], self.samples[base + 1]]
        }
    }
}

/// Voice state shared between the owning [`DeviceVoice`] and the callback.
#[derive(Debug)]
struct VoiceCore {
    state: VoiceState,
    /// Queued buffers in play order; the first `processed` have finished.
    queue: VecDeque<BufferHandle>,
    processed: usize,
    /// Fractional read position inside the current buffer, in frames.
    cursor: f64,
    slots: HashMap<BufferHandle, Slot>,
    last_filled: Option<BufferHandle>,
    volume: f32,
    pitch: f32,
    low_pass_gain: f32,
    lp_state: [f32; 2],
    released: bool,
}

impl VoiceCore {
    fn new() -> Self {
        Self {
            state: VoiceState::Initial,
            queue: VecDeque::new(),
            processed: 0,
            cursor: 0.0,
            slots: HashMap::new(),
            last_filled: None,
            volume: 1.0,
            pitch: 1.0,
            low_pass_gain: 1.0,
            lp_state: [0.0; 2],
            released: false,
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.released {
            return Err(Error::Backend("voice has been released".to_string()));
        }
        Ok(())
    }

    /// Append samples to the most recent fill unless it has already played.
    fn append_to_last_fill(&mut self, samples: &[f32]) -> bool {
        let Some(handle) = self.last_filled else {
            return false;
        };
        if self.queue.iter().take(self.processed).any(|&h| h == handle) {
            return false;
        }
        match self.slots.get_mut(&handle) {
            Some(slot) => {
                slot.samples.extend_from_slice(samples);
                true
            }
            None => false,
        }
    }

    /// Next stereo frame of the current buffer, advancing by `step` frames.
    fn next_frame(&mut self, step: f64) -> Option<[f32; 2]> {
        loop {
            let handle = *self.queue.get(self.processed)?;
            let (a, b, frac) = {
                let Some(slot) = self.slots.get(&handle) else {
                    self.processed += 1;
                    continue;
                };
                let frames = slot.frames();
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let pos = self.cursor as usize;
                if pos >= frames {
                    #[allow(clippy::cast_precision_loss)]
                    {
                        self.cursor = (self.cursor - frames as f64).max(0.0);
                    }
                    self.processed += 1;
                    continue;
                }
                let a = slot.frame(pos);
                let b = if pos + 1 < frames { slot.frame(pos + 1) } else { a };
                #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
                let frac = (self.cursor - pos as f64) as f32;
                (a, b, frac)
            };
            self.cursor += step;

            let mut out = [0.0; 2];
            for ch in 0..2 {
                let x = a[ch] + (b[ch] - a[ch]) * frac;
                self.lp_state[ch] += self.low_pass_gain * (x - self.lp_state[ch]);
                out[ch] = self.lp_state[ch] * self.volume;
            }
            return Some(out);
        }
    }

    /// Add this voice into an interleaved mix buffer.
    fn render_into(&mut self, mix: &mut [f32], channels: usize) {
        if self.state != VoiceState::Playing || channels == 0 {
            return;
        }
        let step = f64::from(self.pitch);
        for frame in mix.chunks_exact_mut(channels) {
            let Some([left, right]) = self.next_frame(step) else {
                self.state = VoiceState::Stopped;
                break;
            };
            if channels == 1 {
                frame[0] += (left + right) * 0.5;
            } else {
                frame[0] += left;
                frame[1] += right;
            }
        }
    }
}

/// Voices currently attached to the output stream.
#[derive(Default)]
struct Mixer {
    voices: Mutex<Vec<Arc<Mutex<VoiceCore>>>>,
}

impl Mixer {
    fn mix(&self, mix: &mut [f32], channels: usize) {
        mix.fill(0.0);
        for voice in self.voices.lock().iter() {
            voice.lock().render_into(mix, channels);
        }
    }

    fn detach(&self, core: &Arc<Mutex<VoiceCore>>) {
        self.voices.lock().retain(|v| !Arc::ptr_eq(v, core));
    }
}

/// Output device configuration reported by the audio thread.
#[derive(Debug, Clone, Copy)]
struct DeviceFormat {
    sample_rate: u32,
    channels: u16,
}

/// [`AudioBackend`] playing through the default cpal output device.
pub struct DeviceBackend {
    mixer: Arc<Mixer>,
    format: DeviceFormat,
    device_name: String,
    next_handle: AtomicU32,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceBackend {
    /// Open the default output device and start its stream.
    pub fn new() -> Result<Self> {
        let mixer = Arc::new(Mixer::default());
        let (ready_tx, ready_rx) = bounded::<Result<(DeviceFormat, String)>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let thread_mixer = Arc::clone(&mixer);
        let thread = std::thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || match open_stream(thread_mixer) {
                Ok((stream, format, name)) => {
                    let _ = ready_tx.send(Ok((format, name)));
                    // Disconnect or an explicit message both end the stream.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Audio device thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::Backend(format!("Failed to spawn audio thread: {e}")))?;

        let (format, device_name) = ready_rx
            .recv()
            .map_err(|_| Error::Backend("Audio thread exited during startup".to_string()))??;

        info!(
            "Using audio output device: {device_name} ({}Hz, {} channels)",
            format.sample_rate, format.channels
        );

        Ok(Self {
            mixer,
            format,
            device_name,
            next_handle: AtomicU32::new(1),
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub const fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.format.channels
    }
}

impl AudioBackend for DeviceBackend {
    fn create_voice(&self, buffer_count: usize) -> Result<Box<dyn Voice>> {
        let buffers: Arc<[BufferHandle]> = (0..buffer_count)
            .map(|_| BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
            .collect();
        let core = Arc::new(Mutex::new(VoiceCore::new()));
        self.mixer.voices.lock().push(Arc::clone(&core));
        debug!("Created device voice with {buffer_count} buffers");

        Ok(Box::new(DeviceVoice {
            core,
            buffers,
            device_rate: self.format.sample_rate,
            converter: Mutex::new(None),
            mixer: Arc::clone(&self.mixer),
        }))
    }

    fn name(&self) -> &str {
        "device"
    }
}

impl Drop for DeviceBackend {
    fn drop(&mut self) {
        drop(self.shutdown_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio device thread panicked");
            }
        }
    }
}

/// One voice mixed into the device stream.
pub struct DeviceVoice {
    core: Arc<Mutex<VoiceCore>>,
    buffers: Arc<[BufferHandle]>,
    device_rate: u32,
    /// Rate converter for sources not at the device rate, kept across fills
    /// and sized to the fill so each one converts in full.
    converter: Mutex<Option<Resampler>>,
    mixer: Arc<Mixer>,
}

impl DeviceVoice {
    fn convert(&self, samples: &[f32], channels: usize, sample_rate: u32) -> Result<Vec<f32>> {
        if sample_rate == self.device_rate {
            return Ok(samples.to_vec());
        }
        let frames = samples.len() / channels.max(1);
        let mut converter = self.converter.lock();
        let stale = converter.as_ref().map_or(true, |r| {
            r.input_rate() != sample_rate || r.channels() != channels || frames > r.block_frames()
        });
        if stale {
            *converter = Some(Resampler::with_block(
                sample_rate,
                self.device_rate,
                channels,
                frames,
            )?);
        }
        match converter.as_mut() {
            Some(resampler) => resampler.process(samples),
            None => Err(Error::Internal("resampler missing".to_string())),
        }
    }
}

impl Voice for DeviceVoice {
    fn buffers(&self) -> &[BufferHandle] {
        &self.buffers
    }

    fn queue_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let mut core = self.core.lock();
        core.check_live()?;
        if !core.slots.contains_key(&buffer) {
            return Err(Error::Backend(format!("{buffer} has no data")));
        }
        if core.queue.contains(&buffer) {
            return Err(Error::Backend(format!("{buffer} is already queued")));
        }
        core.queue.push_back(buffer);
        Ok(())
    }

    fn unqueue_processed_buffers(&self, count: usize) -> Result<Vec<BufferHandle>> {
        let mut core = self.core.lock();
        core.check_live()?;
        if count > core.processed {
            return Err(Error::Backend(format!(
                "cannot unqueue {count} buffers, only {} processed",
                core.processed
            )));
        }
        core.processed -= count;
        Ok(core.queue.drain(..count).collect())
    }

    fn queued_count(&self) -> Result<usize> {
        let core = self.core.lock();
        core.check_live()?;
        Ok(core.queue.len())
    }

    fn processed_count(&self) -> Result<usize> {
        let core = self.core.lock();
        core.check_live()?;
        Ok(core.processed)
    }

    fn playback_state(&self) -> Result<VoiceState> {
        let core = self.core.lock();
        core.check_live()?;
        Ok(core.state)
    }

    fn play(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.check_live()?;
        core.state = VoiceState::Playing;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.check_live()?;
        if core.state == VoiceState::Playing {
            core.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            core.check_live()?;
            core.state = VoiceState::Stopped;
            core.processed = core.queue.len();
            core.cursor = 0.0;
            core.lp_state = [0.0; 2];
        }
        if let Some(resampler) = self.converter.lock().as_mut() {
            resampler.reset();
        }
        Ok(())
    }

    fn fill_buffer(
        &self,
        buffer: BufferHandle,
        format: BufferFormat,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<()> {
        let channels = usize::from(format.channels());
        if samples.len() % channels != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} samples is not a whole number of {channels}-channel frames",
                samples.len()
            )));
        }
        if !self.buffers.contains(&buffer) {
            return Err(Error::InvalidArgument(format!("{buffer} does not belong to this voice")));
        }
        {
            let core = self.core.lock();
            core.check_live()?;
            if core.queue.contains(&buffer) {
                return Err(Error::Backend(format!("{buffer} is queued")));
            }
        }

        let converted = self.convert(samples, channels, sample_rate)?;

        let mut core = self.core.lock();
        core.check_live()?;
        if core.queue.contains(&buffer) {
            return Err(Error::Backend(format!("{buffer} is queued")));
        }
        core.slots.insert(
            buffer,
            Slot {
                samples: converted,
                channels,
            },
        );
        core.last_filled = Some(buffer);
        Ok(())
    }

    fn end_of_stream(&self) -> Result<()> {
        let tail = match self.converter.lock().as_mut() {
            Some(resampler) => resampler.flush()?,
            None => return Ok(()),
        };
        if tail.is_empty() {
            return Ok(());
        }
        let mut core = self.core.lock();
        core.check_live()?;
        if !core.append_to_last_fill(&tail) {
            debug!("Dropped {} converted samples after the last buffer played", tail.len());
        }
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        let mut core = self.core.lock();
        core.check_live()?;
        core.volume = volume;
        Ok(())
    }

    fn set_pitch(&self, pitch: f32) -> Result<()> {
        let mut core = self.core.lock();
        core.check_live()?;
        core.pitch = pitch;
        Ok(())
    }

    fn set_low_pass_gain(&self, gain: f32) -> Result<()> {
        let mut core = self.core.lock();
        core.check_live()?;
        core.low_pass_gain = gain;
        Ok(())
    }

    fn release(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            core.check_live()?;
            core.released = true;
            core.state = VoiceState::Stopped;
            core.queue.clear();
            core.slots.clear();
            core.last_filled = None;
            core.processed = 0;
        }
        self.mixer.detach(&self.core);
        Ok(())
    }
}

fn open_stream(mixer: Arc<Mixer>) -> Result<(Stream, DeviceFormat, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Backend("No output device found".to_string()))?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Backend(format!("Failed to get output config: {e}")))?;
    debug!("Supported output config: {supported:?}");

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let format = DeviceFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer)?,
        _ => {
            return Err(Error::Backend(format!(
                "Unsupported sample format: {sample_format:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::Backend(format!("Failed to start stream: {e}")))?;

    Ok((stream, format, device_name))
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mixer>,
) -> Result<Stream> {
    let channels = usize::from(config.channels);
    let mut mix = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mix.resize(data.len(), 0.0);
                mixer.mix(&mut mix, channels);
                for (out, &s) in data.iter_mut().zip(&mix) {
                    // Soft clipping using tanh for smooth limiting
                    let limited = if s.abs() > 0.9 { s.tanh() } else { s };
                    *out = T::from_sample(limited);
                }
            },
            |err| error!("Audio stream error: {err}"),
            None,
        )
        .map_err(|e| Error::Backend(format!("Failed to build stream: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with(buffers: &[(u32, Vec<f32>, usize)]) -> VoiceCore {
        let mut core = VoiceCore::new();
        for (id, samples, channels) in buffers {
            let handle = BufferHandle(*id);
            core.slots.insert(
                handle,
                Slot {
                    samples: samples.clone(),
                    channels: *channels,
                },
            );
            core.queue.push_back(handle);
        }
        core.state = VoiceState::Playing;
        core
    }

    #[test]
    fn test_render_marks_buffers_processed() {
        let mut core = core_with(&[(1, vec![0.5; 4], 1), (2, vec![0.25; 4], 1)]);
        let mut mix = vec![0.0f32; 12];
        core.render_into(&mut mix, 2);

        assert_eq!(core.processed, 1);
        assert_eq!(core.state, VoiceState::Playing);
        assert!((mix[0] - 0.5).abs() < 1e-6);
        assert!((mix[1] - 0.5).abs() < 1e-6);
        assert!((mix[8] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_render_stops_when_starved() {
        let mut core = core_with(&[(1, vec![1.0; 4], 1)]);
        let mut mix = vec![0.0f32; 16];
        core.render_into(&mut mix, 2);

        assert_eq!(core.state, VoiceState::Stopped);
        assert_eq!(core.processed, 1);
        assert_eq!(mix[10], 0.0);
    }

    #[test]
    fn test_pitch_doubles_consumption() {
        let mut core = core_with(&[(1, vec![0.0; 8], 1), (2, vec![0.0; 8], 1)]);
        core.pitch = 2.0;
        let mut mix = vec![0.0f32; 4];
        core.render_into(&mut mix, 1);
        assert_eq!(core.processed, 0);
        core.render_into(&mut mix, 1);
        assert_eq!(core.processed, 1);
        assert_eq!(core.state, VoiceState::Playing);
    }

    #[test]
    fn test_volume_and_stereo_layout() {
        let mut core = core_with(&[(1, vec![1.0, -1.0, 1.0, -1.0], 2)]);
        core.volume = 0.5;
        let mut mix = vec![0.0f32; 2];
        core.render_into(&mut mix, 2);
        assert!((mix[0] - 0.5).abs() < 1e-6);
        assert!((mix[1] + 0.5).abs() < 1e-6);
    }

    fn device_voice(device_rate: u32) -> DeviceVoice {
        let mixer = Arc::new(Mixer::default());
        let core = Arc::new(Mutex::new(VoiceCore::new()));
        mixer.voices.lock().push(Arc::clone(&core));
        DeviceVoice {
            core,
            buffers: (1..=3).map(BufferHandle).collect(),
            device_rate,
            converter: Mutex::new(None),
            mixer,
        }
    }

    fn slot_frames(voice: &DeviceVoice, buffer: BufferHandle) -> usize {
        voice.core.lock().slots.get(&buffer).map_or(0, Slot::frames)
    }

    #[test]
    fn test_short_fill_at_other_rate_is_not_empty() {
        let voice = device_voice(48000);
        let mono = BufferFormat::MonoF32;

        voice.fill_buffer(BufferHandle(1), mono, &[0.5; 800], 8000).unwrap();
        assert!(slot_frames(&voice, BufferHandle(1)) > 0);

        voice.end_of_stream().unwrap();
        voice.queue_buffer(BufferHandle(1)).unwrap();
        assert_eq!(slot_frames(&voice, BufferHandle(1)), 4800);
    }

    #[test]
    fn test_stream_tail_lands_in_last_buffer() {
        let voice = device_voice(48000);
        let mono = BufferFormat::MonoF32;

        voice.fill_buffer(BufferHandle(1), mono, &[0.5; 800], 8000).unwrap();
        voice.queue_buffer(BufferHandle(1)).unwrap();
        voice.fill_buffer(BufferHandle(2), mono, &[0.5; 300], 8000).unwrap();
        voice.end_of_stream().unwrap();
        voice.queue_buffer(BufferHandle(2)).unwrap();

        let total = slot_frames(&voice, BufferHandle(1)) + slot_frames(&voice, BufferHandle(2));
        assert_eq!(total, 1100 * 6);
    }

    #[test]
    fn test_tail_is_dropped_once_buffer_played() {
        let voice = device_voice(48000);
        voice
            .fill_buffer(BufferHandle(1), BufferFormat::MonoF32, &[0.5; 800], 8000)
            .unwrap();
        voice.queue_buffer(BufferHandle(1)).unwrap();
        voice.play().unwrap();
        let played = slot_frames(&voice, BufferHandle(1));

        let mut mix = vec![0.0f32; 2 * (played + 1)];
        voice.core.lock().render_into(&mut mix, 2);
        voice.end_of_stream().unwrap();

        assert_eq!(voice.processed_count().unwrap(), 1);
        assert_eq!(slot_frames(&voice, BufferHandle(1)), played);
    }

    #[test]
    fn test_matching_rate_fill_is_copied() {
        let voice = device_voice(8000);
        voice
            .fill_buffer(BufferHandle(1), BufferFormat::StereoF32, &[0.25; 200], 8000)
            .unwrap();
        voice.end_of_stream().unwrap();
        assert_eq!(slot_frames(&voice, BufferHandle(1)), 100);
    }

    #[test]
    fn test_paused_voice_is_silent() {
        let mut core = core_with(&[(1, vec![1.0; 4], 1)]);
        core.state = VoiceState::Paused;
        let mut mix = vec![0.0f32; 4];
        core.render_into(&mut mix, 1);
        assert!(mix.iter().all(|&s| s == 0.0));
        assert_eq!(core.processed, 0);
    }
}
