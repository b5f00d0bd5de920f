//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Stream audio files through the Cadence refill pipeline")]
#[command(version)]
pub struct Cli {
    /// Streaming configuration file (JSON)
    #[arg(short, long, global = true, env = "CADENCE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one or more files
    Play(PlayArgs),
    /// Print stream information for a file
    Probe {
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PlayArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Loop each file until interrupted
    #[arg(short, long = "loop")]
    pub looped: bool,

    /// Gain between 0.0 and 1.0
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,

    /// Playback-rate multiplier between 0.5 and 2.0
    #[arg(long, default_value_t = 1.0)]
    pub pitch: f32,

    /// Low-pass filter gain between 0.0 and 1.0 (1.0 is unfiltered)
    #[arg(long, default_value_t = 1.0)]
    pub low_pass: f32,

    /// Play all files at once instead of one after another
    #[arg(long)]
    pub together: bool,

    /// Override the scheduler wake rate
    #[arg(long)]
    pub update_rate: Option<u32>,

    /// Override the number of hardware buffers per stream
    #[arg(long)]
    pub buffers: Option<usize>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_parse_play() {
        let cli = Cli::try_parse_from([
            "cadence", "play", "a.flac", "b.ogg", "--loop", "--volume", "0.5", "--together",
        ])
        .unwrap();
        let Command::Play(args) = cli.command else {
            panic!("expected play");
        };
        assert_eq!(args.files.len(), 2);
        assert!(args.looped);
        assert!(args.together);
        assert!((args.volume - 0.5).abs() < f32::EPSILON);
        assert!(args.update_rate.is_none());
    }

    #[test]
    fn test_play_requires_files() {
        assert!(Cli::try_parse_from(["cadence", "play"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["cadence", "probe", "x.wav", "--config", "c.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
        assert!(matches!(cli.command, Command::Probe { .. }));
    }
}
