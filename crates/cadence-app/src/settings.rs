//! Locating and loading the streaming configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_core::StreamingConfig;
use directories::ProjectDirs;
use tracing::debug;

use crate::cli::PlayArgs;

const CONFIG_FILE: &str = "cadence.json";

/// `cadence.json` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "cadence", "Cadence").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load an explicit config file, or the default one if it exists, or defaults.
pub fn load(explicit: Option<&Path>) -> Result<StreamingConfig> {
    if let Some(path) = explicit {
        return StreamingConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    match default_config_path() {
        Some(path) if path.exists() => StreamingConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        _ => {
            debug!("No config file found, using defaults");
            Ok(StreamingConfig::default())
        }
    }
}

/// Apply command-line overrides and re-validate.
pub fn with_overrides(mut config: StreamingConfig, args: &PlayArgs) -> Result<StreamingConfig> {
    if let Some(rate) = args.update_rate {
        config.update_rate_hz = rate;
    }
    if let Some(buffers) = args.buffers {
        config.buffer_count = buffers;
    }
    config.validate().context("Invalid command-line override")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use clap::Parser;
    use std::io::Write;

    use crate::cli::{Cli, Command};

    fn play_args(extra: &[&str]) -> PlayArgs {
        let mut argv = vec!["cadence", "play", "a.wav"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Play(args) => args,
            Command::Probe { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"update_rate_hz": 30}}"#).unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.update_rate_hz, 30);
        assert_eq!(config.buffer_count, StreamingConfig::default().buffer_count);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("nope.json"))).is_err());
    }

    #[test]
    fn test_overrides_are_validated() {
        let args = play_args(&["--update-rate", "60", "--buffers", "4"]);
        let config = with_overrides(StreamingConfig::default(), &args).unwrap();
        assert_eq!(config.update_rate_hz, 60);
        assert_eq!(config.buffer_count, 4);

        let args = play_args(&["--buffers", "1"]);
        assert!(with_overrides(StreamingConfig::default(), &args).is_err());

        let args = play_args(&["--update-rate", "1"]);
        assert!(with_overrides(StreamingConfig::default(), &args).is_err());
    }
}
