//! # Cadence
//!
//! Command-line player for the Cadence streaming audio pipeline.

mod cli;
mod player;
mod settings;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cadence_audio::{AudioContext, DecodeSource, DeviceBackend, SymphoniaSource};
use clap::Parser;
use cli::{Cli, Command};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_app=info,cadence_audio=info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Play(args) => {
            let config = settings::load(cli.config.as_deref())?;
            let config = settings::with_overrides(config, &args)?;

            let backend = DeviceBackend::new().context("Failed to open audio device")?;
            let context = AudioContext::new(config, Arc::new(backend))
                .context("Failed to start audio pipeline")?;

            let failed = player::run(&context, &args)?;

            let load = context.scheduler().load();
            info!(
                "Scheduler load: avg {:?}, peak {:?} over {} ticks ({:.1}% of interval)",
                load.average,
                load.peak,
                load.total_ticks,
                load.utilization() * 100.0
            );
            context.shutdown();

            if failed > 0 {
                bail!("{failed} stream(s) failed");
            }
        }
        Command::Probe { file } => {
            let source = SymphoniaSource::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            println!("file:        {}", file.display());
            println!("channels:    {}", source.channels());
            println!("sample rate: {} Hz", source.sample_rate());
            match source.duration_secs() {
                Some(secs) => println!("duration:    {secs:.2} s"),
                None => println!("duration:    unknown"),
            }
        }
    }

    Ok(())
}
