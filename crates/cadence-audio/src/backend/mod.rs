//! Playback backend contract consumed by the streaming pipeline.
//!
//! A backend owns hardware voices and their buffers. The pipeline only needs the
//! small queue/unqueue/fill surface below; everything else (devices, mixing,
//! format conversion) stays behind it.

pub mod device;
pub mod memory;

use cadence_core::{BufferFormat, BufferHandle, Result, VoiceState};

pub use device::{DeviceBackend, DeviceVoice};
pub use memory::{MemoryBackend, MemoryVoice};

/// One playback voice with a fixed ring of hardware buffers.
///
/// Queued buffers play in FIFO order. A buffer that finished playing stays
/// queued and counts as processed until it is unqueued. A playing voice that
/// runs out of unprocessed buffers falls to [`VoiceState::Stopped`].
pub trait Voice: Send + Sync {
    /// The hardware buffers created with this voice.
    fn buffers(&self) -> &[BufferHandle];

    /// Append a filled buffer to the play queue.
    fn queue_buffer(&self, buffer: BufferHandle) -> Result<()>;

    /// Remove up to `count` processed buffers from the front of the queue.
    ///
    /// Some drivers reject a batch even when the same buffers could be unqueued
    /// after re-querying [`Voice::processed_count`]; callers recover from that.
    fn unqueue_processed_buffers(&self, count: usize) -> Result<Vec<BufferHandle>>;

    /// Buffers currently queued, processed ones included.
    fn queued_count(&self) -> Result<usize>;

    /// Queued buffers that have finished playing.
    fn processed_count(&self) -> Result<usize>;

    fn playback_state(&self) -> Result<VoiceState>;

    fn play(&self) -> Result<()>;

    fn pause(&self) -> Result<()>;

    /// Halt playback and mark every queued buffer processed.
    fn stop(&self) -> Result<()>;

    /// Upload samples into a buffer that is not currently queued.
    fn fill_buffer(
        &self,
        buffer: BufferHandle,
        format: BufferFormat,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<()>;

    /// No more fills follow until the voice is stopped.
    ///
    /// Backends that hold converted audio back append it to the most recently
    /// filled buffer.
    fn end_of_stream(&self) -> Result<()> {
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<()>;

    fn set_pitch(&self, pitch: f32) -> Result<()>;

    fn set_low_pass_gain(&self, gain: f32) -> Result<()>;

    /// Free the voice and its buffers. Further calls fail.
    fn release(&self) -> Result<()>;
}

/// Factory for voices.
pub trait AudioBackend: Send + Sync {
    /// Create a voice owning `buffer_count` hardware buffers.
    fn create_voice(&self, buffer_count: usize) -> Result<Box<dyn Voice>>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;
}
