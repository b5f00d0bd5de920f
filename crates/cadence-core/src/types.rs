//! Shared domain types for Cadence.

pub mod session;
pub mod voice;

pub use session::SessionState;
pub use voice::{BufferFormat, BufferHandle, VoiceState};
