//! Streaming pipeline configuration.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Smallest hardware buffer ring a voice may use.
pub const MIN_BUFFER_COUNT: usize = 2;

/// Largest hardware buffer ring a voice may use.
pub const MAX_BUFFER_COUNT: usize = 8;

/// Longest audio a single hardware buffer may hold.
pub const MAX_BUFFER_DURATION_MS: u32 = 1000;

/// Tunables for the refill scheduler and the streams it drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// How many times per second the scheduler wakes to refill buffers.
    pub update_rate_hz: u32,
    /// Hardware buffers per voice.
    pub buffer_count: usize,
    /// Audio held by one hardware buffer, in milliseconds.
    pub buffer_duration_ms: u32,
    /// Maximum number of idle chunks kept by the chunk pool.
    pub pool_max_chunks: usize,
    /// How long shutdown waits for the scheduler thread to exit.
    pub shutdown_timeout_ms: u64,
    /// Number of tick durations kept for load diagnostics.
    pub load_history_len: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            update_rate_hz: 15,
            buffer_count: 3,
            buffer_duration_ms: 100,
            pool_max_chunks: 64,
            shutdown_timeout_ms: 1000,
            load_history_len: 64,
        }
    }
}

impl StreamingConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        debug!("Loaded streaming config from {}", path.display());
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.update_rate_hz == 0 {
            return Err(Error::Config("update_rate_hz must be > 0".to_string()));
        }

        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(Error::Config(format!(
                "buffer_count must be between {MIN_BUFFER_COUNT} and {MAX_BUFFER_COUNT}, got {}",
                self.buffer_count
            )));
        }

        if !(1..=MAX_BUFFER_DURATION_MS).contains(&self.buffer_duration_ms) {
            return Err(Error::Config(format!(
                "buffer_duration_ms must be between 1 and {MAX_BUFFER_DURATION_MS}, got {}",
                self.buffer_duration_ms
            )));
        }

        // The queued ring has to outlast one sleep of the scheduler.
        let queued_ms = self.buffer_count as u64 * u64::from(self.buffer_duration_ms);
        if queued_ms * u64::from(self.update_rate_hz) < 1000 {
            return Err(Error::Config(format!(
                "{} buffers of {} ms drain before the next refill at {} Hz",
                self.buffer_count, self.buffer_duration_ms, self.update_rate_hz
            )));
        }

        if self.pool_max_chunks == 0 {
            return Err(Error::Config("pool_max_chunks must be > 0".to_string()));
        }

        if self.load_history_len == 0 {
            return Err(Error::Config("load_history_len must be > 0".to_string()));
        }

        Ok(())
    }

    /// Time between two scheduler wakeups.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.update_rate_hz.max(1)))
    }

    /// Upper bound on how long shutdown waits for the scheduler thread.
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Frames held by one hardware buffer at the given sample rate (never zero).
    pub fn chunk_frames(&self, sample_rate: u32) -> usize {
        let frames = u64::from(sample_rate) * u64::from(self.buffer_duration_ms) / 1000;
        (frames as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.update_rate_hz, 15);
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.pool_max_chunks, 64);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = StreamingConfig {
            update_rate_hz: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = StreamingConfig {
            buffer_count: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamingConfig {
            buffer_count: MAX_BUFFER_COUNT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ring_shorter_than_tick() {
        // 300 ms of queued audio against a one second sleep.
        let config = StreamingConfig {
            update_rate_hz: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = StreamingConfig {
            update_rate_hz: 4,
            buffer_count: 2,
            buffer_duration_ms: 125,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_buffer_duration() {
        let config = StreamingConfig {
            buffer_duration_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamingConfig {
            buffer_duration_ms: MAX_BUFFER_DURATION_MS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamingConfig {
            buffer_duration_ms: MAX_BUFFER_DURATION_MS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_durations() {
        let config = StreamingConfig {
            update_rate_hz: 20,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(1));
        assert_eq!(config.chunk_frames(48000), 4800);
        assert_eq!(config.chunk_frames(0), 1);
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "update_rate_hz": 30, "buffer_count": 4 }}"#).unwrap();

        let config = StreamingConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.update_rate_hz, 30);
        assert_eq!(config.buffer_count, 4);
        assert_eq!(config.buffer_duration_ms, 100);
    }

    #[test]
    fn test_from_json_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "buffer_count": 0 }}"#).unwrap();

        assert!(matches!(
            StreamingConfig::from_json_file(file.path()),
            Err(Error::Config(_))
        ));
    }
}
