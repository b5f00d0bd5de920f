//! Error types for Cadence.

use thiserror::Error;

/// Result type alias using Cadence's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cadence.
#[derive(Error, Debug)]
pub enum Error {
    // Backend errors
    #[error("Audio backend error: {0}")]
    Backend(String),

    // Decode errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource has been disposed")]
    Disposed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error came from the playback backend.
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Returns true if this error came from reading or positioning a decode source.
    ///
    /// The refill scheduler treats these as fatal for the stream that raised them.
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::UnsupportedFormat(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Backend("unqueue".into()).is_backend());
        assert!(!Error::Backend("unqueue".into()).is_decode());
        assert!(Error::Decode("eof".into()).is_decode());
        assert!(Error::UnsupportedFormat("5.1".into()).is_decode());
        assert!(!Error::InvalidArgument("chunk".into()).is_backend());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Backend("queue failed".into());
        assert_eq!(err.to_string(), "Audio backend error: queue failed");
        assert_eq!(Error::Disposed.to_string(), "Resource has been disposed");
    }
}
