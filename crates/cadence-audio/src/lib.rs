//! # cadence-audio
//!
//! Streaming audio delivery for Cadence.
//!
//! Features:
//! - One background scheduler keeping every stream's hardware buffers filled
//! - Pooled decode chunks so steady-state streaming does not allocate
//! - Gapless looping, underrun recovery and single-shot completion callbacks
//! - symphonia decoding and cpal output, plus an in-memory backend for headless use

pub mod backend;
pub mod buffer;
pub mod context;
pub mod decode;
pub mod refill;
pub mod resample;
pub mod scheduler;
pub mod session;
pub mod source;

pub use backend::{AudioBackend, DeviceBackend, MemoryBackend, MemoryVoice, Voice};
pub use buffer::{DecodedChunk, DecodedChunkPool, LoadHistory, PoolStats};
pub use context::AudioContext;
pub use decode::SymphoniaSource;
pub use refill::RefillOutcome;
pub use scheduler::{RefillScheduler, SchedulerHandle, SchedulerLoad, TickReport};
pub use session::StreamSession;
pub use source::{DecodeSource, MemorySource};
