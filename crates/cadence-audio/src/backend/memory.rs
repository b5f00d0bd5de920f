//! In-memory backend with a manually driven clock.
//!
//! Nothing is played: callers decide when queued buffers finish by calling
//! [`MemoryVoice::consume`]. Every call is recorded and a few driver faults can be
//! injected, which makes this the backend of choice for headless runs and tests.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cadence_core::{BufferFormat, BufferHandle, Error, Result, VoiceState};
use parking_lot::Mutex;
use tracing::trace;

use super::{AudioBackend, Voice};

/// Backend handing out [`MemoryVoice`]s.
#[derive(Default)]
pub struct MemoryBackend {
    next_handle: AtomicU32,
    voices: Mutex<Vec<MemoryVoice>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every voice created so far, in creation order.
    pub fn voices(&self) -> Vec<MemoryVoice> {
        self.voices.lock().clone()
    }

    /// The most recently created voice.
    pub fn last_voice(&self) -> Option<MemoryVoice> {
        self.voices.lock().last().cloned()
    }
}

impl AudioBackend for MemoryBackend {
    fn create_voice(&self, buffer_count: usize) -> Result<Box<dyn Voice>> {
        let first = self
            .next_handle
            .fetch_add(buffer_count as u32, Ordering::Relaxed);
        let buffers = (first..first + buffer_count as u32)
            .map(BufferHandle)
            .collect();

        let voice = MemoryVoice::new(buffers);
        self.voices.lock().push(voice.clone());
        Ok(Box::new(voice))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug)]
struct VoiceInner {
    state: VoiceState,
    queue: VecDeque<BufferHandle>,
    processed: usize,
    contents: HashMap<BufferHandle, Vec<f32>>,
    fill_count: usize,
    play_calls: usize,
    end_of_stream_calls: usize,
    volume: f32,
    pitch: f32,
    low_pass_gain: f32,
    fail_next_unqueue: bool,
    fail_fills: bool,
    released: bool,
}

/// Voice whose buffers finish only when told to.
///
/// Clones share the same voice, so a test can keep one while the session owns
/// the boxed original.
#[derive(Debug, Clone)]
pub struct MemoryVoice {
    buffers: Arc<[BufferHandle]>,
    inner: Arc<Mutex<VoiceInner>>,
}

impl MemoryVoice {
    fn new(buffers: Vec<BufferHandle>) -> Self {
        Self {
            buffers: buffers.into(),
            inner: Arc::new(Mutex::new(VoiceInner {
                state: VoiceState::Initial,
                queue: VecDeque::new(),
                processed: 0,
                contents: HashMap::new(),
                fill_count: 0,
                play_calls: 0,
                end_of_stream_calls: 0,
                volume: 1.0,
                pitch: 1.0,
                low_pass_gain: 1.0,
                fail_next_unqueue: false,
                fail_fills: false,
                released: false,
            })),
        }
    }

    /// Mark the next `count` unprocessed buffers as played.
    ///
    /// A playing voice left without unprocessed buffers underruns to `Stopped`.
    pub fn consume(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.processed = (inner.processed + count).min(inner.queue.len());
        if inner.state == VoiceState::Playing && inner.processed == inner.queue.len() {
            trace!("Memory voice drained, falling to Stopped");
            inner.state = VoiceState::Stopped;
        }
    }

    /// Overwrite the playback state without any other side effect.
    pub fn force_state(&self, state: VoiceState) {
        self.inner.lock().state = state;
    }

    /// Make the next batch unqueue fail once.
    pub fn fail_next_unqueue(&self) {
        self.inner.lock().fail_next_unqueue = true;
    }

    /// Make buffer fills fail until turned off again.
    pub fn fail_fills(&self, fail: bool) {
        self.inner.lock().fail_fills = fail;
    }

    pub fn play_calls(&self) -> usize {
        self.inner.lock().play_calls
    }

    /// Times the session reported that no more audio follows.
    pub fn end_of_stream_calls(&self) -> usize {
        self.inner.lock().end_of_stream_calls
    }

    pub fn fill_count(&self) -> usize {
        self.inner.lock().fill_count
    }

    /// Queued handles in play order, processed ones first.
    pub fn queued_handles(&self) -> Vec<BufferHandle> {
        self.inner.lock().queue.iter().copied().collect()
    }

    /// Queued buffers that have not finished playing.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.queue.len() - inner.processed
    }

    /// The samples last uploaded into `buffer`.
    pub fn filled_samples(&self, buffer: BufferHandle) -> Option<Vec<f32>> {
        self.inner.lock().contents.get(&buffer).cloned()
    }

    pub fn state(&self) -> VoiceState {
        self.inner.lock().state
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    pub fn pitch(&self) -> f32 {
        self.inner.lock().pitch
    }

    pub fn low_pass_gain(&self) -> f32 {
        self.inner.lock().low_pass_gain
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    fn check_owned(&self, buffer: BufferHandle) -> Result<()> {
        if self.buffers.contains(&buffer) {
            Ok(())
        } else {
            Err(Error::Backend(format!("{buffer} does not belong to this voice")))
        }
    }
}

fn live(inner: &VoiceInner) -> Result<()> {
    if inner.released {
        Err(Error::Backend("voice has been released".to_string()))
    } else {
        Ok(())
    }
}

impl Voice for MemoryVoice {
    fn buffers(&self) -> &[BufferHandle] {
        &self.buffers
    }

    fn queue_buffer(&self, buffer: BufferHandle) -> Result<()> {
        self.check_owned(buffer)?;
        let mut inner = self.inner.lock();
        live(&inner)?;
        if inner.queue.contains(&buffer) {
            return Err(Error::Backend(format!("{buffer} is already queued")));
        }
        inner.queue.push_back(buffer);
        Ok(())
    }

    fn unqueue_processed_buffers(&self, count: usize) -> Result<Vec<BufferHandle>> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        if inner.fail_next_unqueue {
            inner.fail_next_unqueue = false;
            return Err(Error::Backend("batch unqueue rejected".to_string()));
        }
        if count > inner.processed {
            return Err(Error::Backend(format!(
                "cannot unqueue {count} buffers, only {} processed",
                inner.processed
            )));
        }
        inner.processed -= count;
        Ok(inner.queue.drain(..count).collect())
    }

    fn queued_count(&self) -> Result<usize> {
        let inner = self.inner.lock();
        live(&inner)?;
        Ok(inner.queue.len())
    }

    fn processed_count(&self) -> Result<usize> {
        let inner = self.inner.lock();
        live(&inner)?;
        Ok(inner.processed)
    }

    fn playback_state(&self) -> Result<VoiceState> {
        let inner = self.inner.lock();
        live(&inner)?;
        Ok(inner.state)
    }

    fn play(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.play_calls += 1;
        inner.state = VoiceState::Playing;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        if inner.state == VoiceState::Playing {
            inner.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.state = VoiceState::Stopped;
        inner.processed = inner.queue.len();
        Ok(())
    }

    fn fill_buffer(
        &self,
        buffer: BufferHandle,
        format: BufferFormat,
        samples: &[f32],
        _sample_rate: u32,
    ) -> Result<()> {
        self.check_owned(buffer)?;
        let mut inner = self.inner.lock();
        live(&inner)?;
        if inner.fail_fills {
            return Err(Error::Backend(format!("fill of {buffer} rejected")));
        }
        if inner.queue.contains(&buffer) {
            return Err(Error::Backend(format!("{buffer} is queued and cannot be filled")));
        }
        if samples.len() % usize::from(format.channels()) != 0 {
            return Err(Error::Backend(format!(
                "{} samples is not a whole number of {format:?} frames",
                samples.len()
            )));
        }
        inner.contents.insert(buffer, samples.to_vec());
        inner.fill_count += 1;
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.volume = volume;
        Ok(())
    }

    fn set_pitch(&self, pitch: f32) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.pitch = pitch;
        Ok(())
    }

    fn set_low_pass_gain(&self, gain: f32) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.low_pass_gain = gain;
        Ok(())
    }

    fn end_of_stream(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.end_of_stream_calls += 1;
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        live(&inner)?;
        inner.released = true;
        inner.state = VoiceState::Stopped;
        inner.queue.clear();
        inner.processed = 0;
        inner.contents.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_voice() -> (MemoryBackend, Box<dyn Voice>, MemoryVoice) {
        let backend = MemoryBackend::new();
        let boxed = backend.create_voice(3).unwrap();
        let handle = backend.last_voice().unwrap();
        (backend, boxed, handle)
    }

    #[test]
    fn test_handles_are_unique_across_voices() {
        let backend = MemoryBackend::new();
        let a = backend.create_voice(3).unwrap();
        let b = backend.create_voice(2).unwrap();
        assert_eq!(a.buffers().len(), 3);
        assert!(b.buffers().iter().all(|h| !a.buffers().contains(h)));
    }

    #[test]
    fn test_queue_consume_unqueue() {
        let (_backend, voice, control) = make_voice();
        let buffers = voice.buffers().to_vec();
        for &b in &buffers {
            voice.fill_buffer(b, BufferFormat::MonoF32, &[0.1; 4], 8000).unwrap();
            voice.queue_buffer(b).unwrap();
        }
        voice.play().unwrap();
        assert_eq!(voice.queued_count().unwrap(), 3);

        control.consume(2);
        assert_eq!(voice.processed_count().unwrap(), 2);
        assert!(voice.unqueue_processed_buffers(3).is_err());

        let done = voice.unqueue_processed_buffers(2).unwrap();
        assert_eq!(done, buffers[..2].to_vec());
        assert_eq!(voice.queued_count().unwrap(), 1);
        assert_eq!(voice.playback_state().unwrap(), VoiceState::Playing);
    }

    #[test]
    fn test_drained_voice_underruns() {
        let (_backend, voice, control) = make_voice();
        let b = voice.buffers()[0];
        voice.fill_buffer(b, BufferFormat::MonoF32, &[0.0; 2], 8000).unwrap();
        voice.queue_buffer(b).unwrap();
        voice.play().unwrap();

        control.consume(1);
        assert_eq!(voice.playback_state().unwrap(), VoiceState::Stopped);
        assert_eq!(voice.queued_count().unwrap(), 1);
    }

    #[test]
    fn test_stop_marks_everything_processed() {
        let (_backend, voice, _control) = make_voice();
        for &b in voice.buffers() {
            voice.fill_buffer(b, BufferFormat::MonoF32, &[0.0; 2], 8000).unwrap();
            voice.queue_buffer(b).unwrap();
        }
        voice.play().unwrap();
        voice.stop().unwrap();
        assert_eq!(voice.processed_count().unwrap(), 3);
    }

    #[test]
    fn test_fill_rejects_queued_and_foreign_buffers() {
        let (_backend, voice, _control) = make_voice();
        let b = voice.buffers()[0];
        voice.fill_buffer(b, BufferFormat::MonoF32, &[0.0; 2], 8000).unwrap();
        voice.queue_buffer(b).unwrap();
        assert!(voice.fill_buffer(b, BufferFormat::MonoF32, &[0.0; 2], 8000).is_err());
        assert!(voice
            .fill_buffer(BufferHandle(999), BufferFormat::MonoF32, &[0.0; 2], 8000)
            .is_err());
        assert!(voice.fill_buffer(voice.buffers()[1], BufferFormat::StereoF32, &[0.0; 3], 8000).is_err());
    }

    #[test]
    fn test_injected_unqueue_failure_fires_once() {
        let (_backend, voice, control) = make_voice();
        let b = voice.buffers()[0];
        voice.fill_buffer(b, BufferFormat::MonoF32, &[0.0; 2], 8000).unwrap();
        voice.queue_buffer(b).unwrap();
        control.consume(1);
        control.fail_next_unqueue();
        assert!(voice.unqueue_processed_buffers(1).is_err());
        assert_eq!(voice.unqueue_processed_buffers(1).unwrap(), vec![b]);
    }

    #[test]
    fn test_released_voice_rejects_calls() {
        let (_backend, voice, control) = make_voice();
        voice.release().unwrap();
        assert!(control.is_released());
        assert!(voice.play().is_err());
        assert!(voice.release().is_err());
    }
}
