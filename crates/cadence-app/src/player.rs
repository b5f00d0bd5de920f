//! Runs streams on an audio context until they finish.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_audio::{AudioContext, DecodeSource, StreamSession, SymphoniaSource};
use cadence_core::SessionState;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info};

use crate::cli::PlayArgs;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-stream playback parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub looped: bool,
    pub volume: f32,
    pub pitch: f32,
    pub low_pass: f32,
}

impl From<&PlayArgs> for StreamOptions {
    fn from(args: &PlayArgs) -> Self {
        Self {
            looped: args.looped,
            volume: args.volume,
            pitch: args.pitch,
            low_pass: args.low_pass,
        }
    }
}

/// Starts streams and waits for their completion callbacks.
pub struct Player<'a> {
    context: &'a AudioContext,
    done_tx: Sender<u64>,
    done_rx: Receiver<u64>,
}

impl<'a> Player<'a> {
    pub fn new(context: &'a AudioContext) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            context,
            done_tx,
            done_rx,
        }
    }

    /// Open a file and start playing it.
    pub fn start_file(&self, path: &Path, options: StreamOptions) -> Result<Arc<StreamSession>> {
        let source = SymphoniaSource::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if let Some(secs) = source.duration_secs() {
            info!("{}: {secs:.1}s", path.display());
        }
        self.start(Box::new(source), options)
    }

    /// Start playing a source.
    pub fn start(
        &self,
        source: Box<dyn DecodeSource>,
        options: StreamOptions,
    ) -> Result<Arc<StreamSession>> {
        let session = self
            .context
            .open_stream(source)
            .context("Failed to open stream")?;
        session.set_looped(options.looped);
        session.set_volume(options.volume)?;
        session.set_pitch(options.pitch)?;
        session.set_low_pass_gain(options.low_pass)?;

        let done_tx = self.done_tx.clone();
        let id = session.id();
        session.on_finished(move || {
            let _ = done_tx.send(id);
        });

        session.play().context("Failed to start playback")?;
        Ok(session)
    }

    /// Block until every session has finished or failed.
    ///
    /// Returns how many sessions failed.
    pub fn wait(&self, sessions: &[Arc<StreamSession>]) -> usize {
        let mut pending: HashMap<u64, &Arc<StreamSession>> =
            sessions.iter().map(|s| (s.id(), s)).collect();
        let mut failed = 0;

        while !pending.is_empty() {
            match self.done_rx.recv_timeout(POLL_INTERVAL) {
                Ok(id) => {
                    pending.remove(&id);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            // Decode failures dispose the session instead of finishing it.
            pending.retain(|_, session| {
                if session.state() != SessionState::Disposed {
                    return true;
                }
                failed += 1;
                error!(
                    "Stream {} failed: {}",
                    session.id(),
                    session.last_error().unwrap_or_else(|| "disposed".to_string())
                );
                false
            });
        }
        failed
    }
}

/// Play every file, one after another or all at once.
pub fn run(context: &AudioContext, args: &PlayArgs) -> Result<usize> {
    let player = Player::new(context);
    let options = StreamOptions::from(args);
    let mut failed = 0;

    if args.together {
        let sessions = args
            .files
            .iter()
            .map(|path| player.start_file(path, options))
            .collect::<Result<Vec<_>>>()?;
        failed += player.wait(&sessions);
    } else {
        for path in &args.files {
            info!("Playing {}", path.display());
            let session = player.start_file(path, options)?;
            failed += player.wait(std::slice::from_ref(&session));
        }
    }
    Ok(failed)
}
