//! Voice and hardware buffer types shared by backends and the refill pipeline.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque handle to one backend-owned hardware buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle(pub u32);

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Backend playback state of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoiceState {
    #[default]
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Sample layout of data handed to a hardware buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferFormat {
    /// One channel of 32-bit float samples.
    MonoF32,
    /// Two interleaved channels of 32-bit float samples.
    StereoF32,
}

impl BufferFormat {
    /// Pick the buffer format for a source channel count.
    pub fn from_channels(channels: u16) -> Result<Self> {
        match channels {
            1 => Ok(Self::MonoF32),
            2 => Ok(Self::StereoF32),
            n => Err(Error::UnsupportedFormat(format!(
                "{n} channels (only mono and stereo streams are supported)"
            ))),
        }
    }

    /// Number of interleaved channels.
    pub const fn channels(self) -> u16 {
        match self {
            Self::MonoF32 => 1,
            Self::StereoF32 => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_channels() {
        assert_eq!(BufferFormat::from_channels(1).unwrap(), BufferFormat::MonoF32);
        assert_eq!(BufferFormat::from_channels(2).unwrap(), BufferFormat::StereoF32);
        assert!(matches!(
            BufferFormat::from_channels(6),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!(BufferFormat::StereoF32.channels(), 2);
    }

    #[test]
    fn test_voice_state_default() {
        assert_eq!(VoiceState::default(), VoiceState::Initial);
    }
}
