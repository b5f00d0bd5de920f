//! Per-source streaming state and its playback state machine.
//!
//! A [`StreamSession`] owns one voice, its fixed ring of hardware buffers and
//! the decode source feeding them. Control calls come from any thread; the
//! refill scheduler touches the same state from its own thread.
//!
//! Lock order: `prepare_lock`, then `playback`, then the shared scratch
//! buffer or the scheduler's active set.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cadence_core::{
    BufferFormat, BufferHandle, Error, Result, SessionState, StreamingConfig, VoiceState,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backend::Voice;
use crate::buffer::{DecodedChunk, DecodedChunkPool};
use crate::refill::{self, RefillOutcome, RefillPlan};
use crate::scheduler::SchedulerHandle;
use crate::source::DecodeSource;

/// Lowest accepted pitch multiplier.
pub const MIN_PITCH: f32 = 0.5;
/// Highest accepted pitch multiplier.
pub const MAX_PITCH: f32 = 2.0;

type FinishedCallback = Arc<dyn Fn() + Send + Sync>;

/// State guarded by the session's stop lock.
struct Playback {
    source: Box<dyn DecodeSource>,
    /// Chunks backing the queued hardware buffers, in queue order.
    in_flight: VecDeque<DecodedChunk>,
    /// Buffers not currently queued on the voice.
    free_buffers: VecDeque<BufferHandle>,
    phase: SessionState,
    /// The source must be reopened before it is read again.
    needs_reopen: bool,
    pending_finish: bool,
    looped: bool,
}

#[derive(Debug, Clone, Copy)]
struct VoiceParams {
    volume: f32,
    pitch: f32,
    low_pass_gain: f32,
}

enum Fill {
    Queued,
    EndOfStream,
}

/// One streamed audio source playing on one voice.
pub struct StreamSession {
    id: u64,
    self_ref: Weak<Self>,
    voice: Box<dyn Voice>,
    format: BufferFormat,
    sample_rate: u32,
    /// Samples (not frames) decoded per hardware buffer.
    chunk_samples: usize,
    scheduler: SchedulerHandle,
    pool: Arc<DecodedChunkPool>,
    playback: Mutex<Playback>,
    prepare_lock: Mutex<()>,
    preparing: AtomicBool,
    params: Mutex<VoiceParams>,
    on_finished: Mutex<Option<FinishedCallback>>,
    last_error: Mutex<Option<String>>,
}

impl StreamSession {
    /// Wrap a voice and a decode source. Nothing is decoded until the first
    /// [`StreamSession::prepare`] or [`StreamSession::play`].
    pub fn new(
        voice: Box<dyn Voice>,
        source: Box<dyn DecodeSource>,
        scheduler: SchedulerHandle,
    ) -> Result<Arc<Self>> {
        let format = BufferFormat::from_channels(source.channels())?;
        let sample_rate = source.sample_rate();
        if sample_rate == 0 {
            return Err(Error::UnsupportedFormat("sample rate of 0".to_string()));
        }
        if voice.buffers().is_empty() {
            return Err(Error::InvalidArgument("voice has no buffers".to_string()));
        }

        let config: &StreamingConfig = scheduler.config();
        let chunk_samples = config.chunk_frames(sample_rate) * usize::from(format.channels());
        let free_buffers: VecDeque<BufferHandle> = voice.buffers().iter().copied().collect();
        let id = scheduler.next_session_id();
        let pool = Arc::clone(scheduler.pool());

        debug!(
            session = id,
            "Opened stream: {sample_rate}Hz {format:?}, {} buffers of {chunk_samples} samples",
            free_buffers.len()
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            self_ref: self_ref.clone(),
            voice,
            format,
            sample_rate,
            chunk_samples,
            scheduler,
            pool,
            playback: Mutex::new(Playback {
                source,
                in_flight: VecDeque::new(),
                free_buffers,
                phase: SessionState::Initial,
                needs_reopen: false,
                pending_finish: false,
                looped: false,
            }),
            prepare_lock: Mutex::new(()),
            preparing: AtomicBool::new(false),
            params: Mutex::new(VoiceParams {
                volume: 1.0,
                pitch: 1.0,
                low_pass_gain: 1.0,
            }),
            on_finished: Mutex::new(None),
            last_error: Mutex::new(None),
        }))
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.playback.lock().phase
    }

    pub fn is_preparing(&self) -> bool {
        self.preparing.load(Ordering::Acquire)
    }

    pub const fn format(&self) -> BufferFormat {
        self.format
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_count(&self) -> usize {
        self.voice.buffers().len()
    }

    /// Decoded chunks currently backing queued buffers.
    pub fn in_flight(&self) -> usize {
        self.playback.lock().in_flight.len()
    }

    /// Decode cursor in frames.
    pub fn position(&self) -> u64 {
        self.playback.lock().source.position()
    }

    /// Message of the decode error that tore this session down, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn is_looped(&self) -> bool {
        self.playback.lock().looped
    }

    pub fn set_looped(&self, looped: bool) {
        self.playback.lock().looped = looped;
    }

    pub fn volume(&self) -> f32 {
        self.params.lock().volume
    }

    /// Set the gain, clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        self.params.lock().volume = volume;
        self.apply(|voice| voice.set_volume(volume))
    }

    pub fn pitch(&self) -> f32 {
        self.params.lock().pitch
    }

    /// Set the playback-rate multiplier, clamped to [`MIN_PITCH`]..=[`MAX_PITCH`].
    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        let pitch = pitch.clamp(MIN_PITCH, MAX_PITCH);
        self.params.lock().pitch = pitch;
        self.apply(|voice| voice.set_pitch(pitch))
    }

    pub fn low_pass_gain(&self) -> f32 {
        self.params.lock().low_pass_gain
    }

    /// Set the low-pass filter gain, clamped to `0.0..=1.0` (1.0 is unfiltered).
    pub fn set_low_pass_gain(&self, gain: f32) -> Result<()> {
        let gain = gain.clamp(0.0, 1.0);
        self.params.lock().low_pass_gain = gain;
        self.apply(|voice| voice.set_low_pass_gain(gain))
    }

    /// Register the callback fired once per natural end of a non-looped stream.
    ///
    /// It runs on the scheduler thread with no session lock held.
    pub fn on_finished(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_finished.lock() = Some(Arc::new(callback));
    }

    /// Position the source and queue the first buffer.
    ///
    /// No-op once primed or while playing. After a stop the source is reopened.
    pub fn prepare(&self) -> Result<()> {
        let _prepare = self.prepare_lock.lock();
        let mut pb = self.playback.lock();
        self.preparing.store(true, Ordering::Release);
        let result = self.prepare_locked(&mut pb);
        self.preparing.store(false, Ordering::Release);
        result
    }

    /// Start or resume playback and hand the stream to the scheduler.
    pub fn play(&self) -> Result<()> {
        let _prepare = self.prepare_lock.lock();
        let mut pb = self.playback.lock();
        match pb.phase {
            SessionState::Disposed => return Ok(()),
            SessionState::Paused => return self.resume_locked(&mut pb),
            SessionState::Playing => {
                drop(pb);
                self.register();
                return Ok(());
            }
            _ => {}
        }

        self.preparing.store(true, Ordering::Release);
        let result = self
            .prepare_locked(&mut pb)
            .and_then(|()| self.voice.play());
        self.preparing.store(false, Ordering::Release);
        result?;

        pb.phase = SessionState::Playing;
        drop(pb);
        self.register();
        debug!(session = self.id, "Playing");
        Ok(())
    }

    /// Pause a playing stream. Anything else is a no-op.
    pub fn pause(&self) -> Result<()> {
        let mut pb = self.playback.lock();
        if pb.phase != SessionState::Playing {
            return Ok(());
        }
        if self.voice.playback_state()? == VoiceState::Playing {
            self.voice.pause()?;
        }
        pb.phase = SessionState::Paused;
        self.scheduler.remove_id(self.id);
        debug!(session = self.id, "Paused");
        Ok(())
    }

    /// Resume a paused stream. Anything else is a no-op.
    pub fn resume(&self) -> Result<()> {
        let mut pb = self.playback.lock();
        self.resume_locked(&mut pb)
    }

    /// Halt playback and unqueue every buffer. The next play starts over.
    pub fn stop(&self) -> Result<()> {
        let _prepare = self.prepare_lock.lock();
        let mut pb = self.playback.lock();
        if matches!(
            pb.phase,
            SessionState::Initial | SessionState::Stopped | SessionState::Disposed
        ) {
            return Ok(());
        }
        if matches!(
            self.voice.playback_state()?,
            VoiceState::Playing | VoiceState::Paused
        ) {
            self.voice.stop()?;
        }
        self.scheduler.remove_id(self.id);
        pb.phase = SessionState::Stopped;
        pb.needs_reopen = true;
        pb.pending_finish = false;
        self.drain_locked(&mut pb)?;
        debug!(session = self.id, "Stopped");
        Ok(())
    }

    /// Move the decode cursor to `frame`.
    ///
    /// Buffered audio is discarded. A playing stream is restarted by the next
    /// scheduler tick; a primed one is re-primed at the new position.
    pub fn seek(&self, frame: u64) -> Result<()> {
        let _prepare = self.prepare_lock.lock();
        let mut pb = self.playback.lock();
        if pb.phase == SessionState::Disposed {
            return Ok(());
        }
        if matches!(
            self.voice.playback_state()?,
            VoiceState::Playing | VoiceState::Paused
        ) {
            self.voice.stop()?;
        }
        self.drain_locked(&mut pb)?;

        if pb.needs_reopen {
            pb.source.reopen()?;
            pb.needs_reopen = false;
        }
        pb.source.seek(frame)?;
        pb.pending_finish = false;

        if pb.phase == SessionState::Ready {
            self.prime_locked(&mut pb)?;
        }
        debug!(session = self.id, "Seeked to frame {frame}");
        Ok(())
    }

    /// Release the voice and the source. Safe to call any number of times.
    pub fn dispose(&self) {
        let _prepare = self.prepare_lock.lock();
        let mut pb = self.playback.lock();
        if pb.phase == SessionState::Disposed {
            return;
        }
        self.scheduler.remove_id(self.id);

        if let Err(e) = self.drain_locked(&mut pb) {
            warn!(session = self.id, "Drain during dispose failed: {e}");
        }
        while let Some(chunk) = pb.in_flight.pop_front() {
            self.recycle(chunk);
        }
        pb.source.close();
        if let Err(e) = self.voice.release() {
            warn!(session = self.id, "Voice release failed: {e}");
        }
        pb.phase = SessionState::Disposed;
        debug!(session = self.id, "Disposed");
    }

    /// Refill this session's free buffers for one scheduler tick.
    pub(crate) fn refill(&self, scratch: &Mutex<Vec<f32>>) -> Result<RefillOutcome> {
        let mut pb = self.playback.lock();
        let preparing = self.is_preparing();
        if preparing || pb.phase != SessionState::Playing {
            return Ok(RefillOutcome::Skipped);
        }

        let queued = self.voice.queued_count()?;
        let processed = self.voice.processed_count()?;
        let mut reclaimed = 0;
        let mut filled = 0;
        let planned = refill::plan(queued, processed, self.buffer_count());

        if let RefillPlan::Refill { reclaim } = planned {
            for handle in refill::reclaim_processed(self.voice.as_ref(), reclaim)? {
                self.release_buffer(&mut pb, handle);
                reclaimed += 1;
            }

            while !pb.pending_finish {
                let Some(handle) = pb.free_buffers.pop_front() else {
                    break;
                };
                match self.fill_one(&mut pb, scratch, handle) {
                    Ok(Fill::Queued) => filled += 1,
                    Ok(Fill::EndOfStream) => {
                        pb.free_buffers.push_front(handle);
                        pb.pending_finish = true;
                        self.signal_end_of_stream();
                        debug!(session = self.id, "End of stream, waiting for drain");
                    }
                    Err(e) => {
                        pb.free_buffers.push_front(handle);
                        return Err(e);
                    }
                }
            }
        }

        let queued = self.voice.queued_count()?;
        if refill::is_complete(pb.pending_finish, queued) {
            pb.phase = SessionState::Stopped;
            pb.pending_finish = false;
            pb.needs_reopen = true;
            // Leave the active set before a concurrent play() can register again.
            self.scheduler.remove_id(self.id);
            return Ok(RefillOutcome::Finished);
        }

        let restarted = refill::should_restart(self.voice.playback_state()?, queued, preparing);
        if restarted {
            warn!(session = self.id, "Buffer underrun, restarting playback");
            self.voice.play()?;
        }

        trace!(session = self.id, "Refill: reclaimed {reclaimed}, filled {filled}");
        if planned == RefillPlan::Skip && !restarted {
            return Ok(RefillOutcome::Skipped);
        }
        Ok(RefillOutcome::Refilled {
            reclaimed,
            filled,
            restarted,
        })
    }

    pub(crate) fn notify_finished(&self) {
        let callback = self.on_finished.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Tear the session down after an unrecoverable decode error.
    pub(crate) fn fault(&self, error: &Error) {
        *self.last_error.lock() = Some(error.to_string());
        self.dispose();
    }

    fn apply(&self, op: impl FnOnce(&dyn Voice) -> Result<()>) -> Result<()> {
        let pb = self.playback.lock();
        if pb.phase == SessionState::Disposed {
            return Ok(());
        }
        op(self.voice.as_ref())
    }

    fn register(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            self.scheduler.add_stream(this);
        }
    }

    fn resume_locked(&self, pb: &mut Playback) -> Result<()> {
        if pb.phase != SessionState::Paused {
            return Ok(());
        }
        self.voice.play()?;
        pb.phase = SessionState::Playing;
        self.register();
        debug!(session = self.id, "Resumed");
        Ok(())
    }

    fn prepare_locked(&self, pb: &mut Playback) -> Result<()> {
        if matches!(
            pb.phase,
            SessionState::Disposed
                | SessionState::Ready
                | SessionState::Playing
                | SessionState::Paused
        ) {
            return Ok(());
        }

        let previous = pb.phase;
        pb.phase = SessionState::Preparing;
        let result = self.prime_from_start(pb);
        pb.phase = if result.is_ok() {
            SessionState::Ready
        } else {
            previous
        };
        result
    }

    fn prime_from_start(&self, pb: &mut Playback) -> Result<()> {
        if pb.needs_reopen {
            self.drain_locked(pb)?;
            pb.source.close();
            pb.source.reopen()?;
            pb.needs_reopen = false;
        }
        pb.pending_finish = false;
        self.prime_locked(pb)
    }

    /// Queue one buffer synchronously. A short source still queues what it
    /// has; an empty one is left for the first tick to finish.
    fn prime_locked(&self, pb: &mut Playback) -> Result<()> {
        if !pb.in_flight.is_empty() {
            return Ok(());
        }
        let Some(handle) = pb.free_buffers.pop_front() else {
            return Ok(());
        };
        match self.fill_one(pb, self.scheduler.scratch(), handle) {
            Ok(Fill::Queued) => Ok(()),
            Ok(Fill::EndOfStream) => {
                pb.free_buffers.push_front(handle);
                pb.pending_finish = true;
                self.signal_end_of_stream();
                Ok(())
            }
            Err(e) => {
                pb.free_buffers.push_front(handle);
                Err(e)
            }
        }
    }

    /// Decode one chunk into `handle` and queue it.
    fn fill_one(
        &self,
        pb: &mut Playback,
        scratch: &Mutex<Vec<f32>>,
        handle: BufferHandle,
    ) -> Result<Fill> {
        let mut scratch = scratch.lock();
        scratch.resize(self.chunk_samples, 0.0);

        // A looped source wraps mid-chunk so the loop point has no gap. Wrapping
        // twice without reading anything means the source is empty.
        let mut filled = 0;
        let mut progressed = true;
        while filled < self.chunk_samples {
            let read = pb.source.read_samples(&mut scratch[filled..])?;
            if read > 0 {
                filled += read;
                progressed = true;
                continue;
            }
            if !pb.looped || !progressed {
                break;
            }
            trace!(session = self.id, "Looping to start");
            pb.source.seek(0)?;
            progressed = false;
        }
        if filled == 0 {
            return Ok(Fill::EndOfStream);
        }

        // A short chunk from a source that does not loop is its last one.
        let last = filled < self.chunk_samples && !pb.looped;
        let mut chunk = self.pool.rent(self.chunk_samples);
        chunk.fill_from(&scratch[..filled]);
        drop(scratch);

        let queued = self
            .voice
            .fill_buffer(handle, self.format, chunk.as_slice(), self.sample_rate)
            .and_then(|()| if last { self.voice.end_of_stream() } else { Ok(()) })
            .and_then(|()| self.voice.queue_buffer(handle));
        if let Err(e) = queued {
            self.recycle(chunk);
            return Err(e);
        }
        pb.in_flight.push_back(chunk);
        if last {
            pb.pending_finish = true;
            debug!(session = self.id, "Last chunk queued, waiting for drain");
        }
        Ok(Fill::Queued)
    }

    fn signal_end_of_stream(&self) {
        if let Err(e) = self.voice.end_of_stream() {
            warn!(session = self.id, "End of stream not delivered: {e}");
        }
    }

    /// Unqueue every buffer and return its chunk to the pool.
    fn drain_locked(&self, pb: &mut Playback) -> Result<()> {
        for handle in refill::drain_all(self.voice.as_ref())? {
            self.release_buffer(pb, handle);
        }
        if self.voice.queued_count()? == 0 {
            while let Some(chunk) = pb.in_flight.pop_front() {
                self.recycle(chunk);
            }
            pb.free_buffers = self.voice.buffers().iter().copied().collect();
        }
        Ok(())
    }

    /// An unqueued buffer: its chunk goes back to the pool, the handle to the free list.
    fn release_buffer(&self, pb: &mut Playback, handle: BufferHandle) {
        if let Some(chunk) = pb.in_flight.pop_front() {
            self.recycle(chunk);
        }
        pb.free_buffers.push_back(handle);
    }

    fn recycle(&self, chunk: DecodedChunk) {
        if let Err(e) = self.pool.recycle(chunk) {
            warn!(session = self.id, "Chunk not recycled: {e}");
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
