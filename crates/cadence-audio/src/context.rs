//! Top-level owner of the streaming pipeline.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadence_core::{Error, Result, StreamingConfig};
use tracing::info;

use crate::backend::AudioBackend;
use crate::buffer::DecodedChunkPool;
use crate::scheduler::RefillScheduler;
use crate::session::StreamSession;
use crate::source::DecodeSource;

/// Owns the backend, the chunk pool and the one refill scheduler that serves
/// every stream opened through it.
pub struct AudioContext {
    config: StreamingConfig,
    backend: Arc<dyn AudioBackend>,
    pool: Arc<DecodedChunkPool>,
    scheduler: RefillScheduler,
    shut_down: AtomicBool,
}

impl AudioContext {
    /// Build the pipeline and start the scheduler thread.
    pub fn new(config: StreamingConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        let context = Self::headless(config, backend)?;
        context.scheduler.start()?;
        Ok(context)
    }

    /// Build the pipeline without starting the scheduler thread.
    ///
    /// Buffers are only refilled when [`RefillScheduler::tick`] is called.
    pub fn headless(config: StreamingConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(DecodedChunkPool::new(config.pool_max_chunks));
        let scheduler = RefillScheduler::new(config.clone(), Arc::clone(&pool))?;
        info!(
            "Audio context on {} backend: {} buffers x {}ms",
            backend.name(),
            config.buffer_count,
            config.buffer_duration_ms
        );
        Ok(Self {
            config,
            backend,
            pool,
            scheduler,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Create a voice for `source` and wrap both in a new session.
    pub fn open_stream(&self, source: Box<dyn DecodeSource>) -> Result<Arc<StreamSession>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        let voice = self.backend.create_voice(self.config.buffer_count)?;
        StreamSession::new(voice, source, self.scheduler.handle())
    }

    pub const fn scheduler(&self) -> &RefillScheduler {
        &self.scheduler
    }

    pub const fn pool(&self) -> &Arc<DecodedChunkPool> {
        &self.pool
    }

    pub const fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn AudioBackend {
        self.backend.as_ref()
    }

    /// Stop the scheduler. Open sessions stay usable for stop and dispose.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.dispose();
        let stats = self.pool.stats();
        info!(
            "Audio context shut down: {} chunks allocated, {} reused",
            stats.allocated, stats.reused
        );
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::source::MemorySource;
    use cadence_core::SessionState;

    fn context() -> (AudioContext, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let context = AudioContext::headless(StreamingConfig::default(), backend.clone()).unwrap();
        (context, backend)
    }

    #[test]
    fn test_open_stream_uses_configured_ring() {
        let (context, backend) = context();
        let session = context
            .open_stream(Box::new(MemorySource::sine(440.0, 1.0, 48000)))
            .unwrap();
        assert_eq!(session.buffer_count(), 3);
        assert_eq!(backend.voices().len(), 1);
        assert_eq!(session.state(), SessionState::Initial);
    }

    #[test]
    fn test_chunks_are_reused_across_streams() {
        let (context, backend) = context();
        for _ in 0..3 {
            let session = context
                .open_stream(Box::new(MemorySource::sine(440.0, 1.0, 48000)))
                .unwrap();
            session.play().unwrap();
            context.scheduler().tick();
            backend.last_voice().unwrap().consume(3);
            session.stop().unwrap();
        }
        let stats = context.pool().stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.reused, 6);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let context = AudioContext::new(StreamingConfig::default(), backend).unwrap();
        assert!(context.scheduler().is_running());

        context.shutdown();
        context.shutdown();
        assert!(!context.scheduler().is_running());
        assert!(matches!(
            context.open_stream(Box::new(MemorySource::sine(440.0, 0.1, 8000))),
            Err(Error::Disposed)
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StreamingConfig {
            buffer_count: 0,
            ..StreamingConfig::default()
        };
        let backend = Arc::new(MemoryBackend::new());
        assert!(matches!(
            AudioContext::headless(config, backend),
            Err(Error::Config(_))
        ));
    }
}
