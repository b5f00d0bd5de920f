//! Stream session lifecycle states.

use serde::{Deserialize, Serialize};

/// Observable lifecycle state of a stream session.
///
/// `Disposed` is terminal and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Opened, never primed.
    #[default]
    Initial,
    /// Priming the decoder and first buffer.
    Preparing,
    /// Primed and positioned, not playing.
    Ready,
    Playing,
    Paused,
    /// Halted by the caller or drained after natural completion.
    Stopped,
    Disposed,
}

impl SessionState {
    /// Whether the session is driving audio to its voice.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}
