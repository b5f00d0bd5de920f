//! Per-tick buffer refill decisions and backend unqueue recovery.
//!
//! The decision helpers are pure so the scheduler's behavior can be tested
//! without a voice. The reclaim helpers talk to a [`Voice`] and own the one
//! backend quirk the pipeline recovers from: a batch unqueue that fails even
//! though the processed buffers can be unqueued after re-querying.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use cadence_core::{BufferHandle, Result, VoiceState};
use tracing::{trace, warn};

use crate::backend::Voice;

/// What a tick should do for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillPlan {
    /// Ring full and nothing consumed yet.
    Skip,
    /// Reclaim `reclaim` processed buffers, then fill every free buffer.
    Refill { reclaim: usize },
}

/// Result of refilling one session for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Nothing to do, or the session is not eligible this tick.
    Skipped,
    Refilled {
        reclaimed: usize,
        filled: usize,
        restarted: bool,
    },
    /// End of stream reached and every queued buffer has played.
    Finished,
}

pub const fn plan(queued: usize, processed: usize, buffer_count: usize) -> RefillPlan {
    if processed == 0 && queued >= buffer_count {
        RefillPlan::Skip
    } else {
        RefillPlan::Refill { reclaim: processed }
    }
}

/// Whether the backend underran and playback should be restarted.
pub fn should_restart(state: VoiceState, queued: usize, preparing: bool) -> bool {
    state == VoiceState::Stopped && queued > 0 && !preparing
}

/// Whether a session waiting for its tail to play out is done.
pub const fn is_complete(pending_finish: bool, queued: usize) -> bool {
    pending_finish && queued == 0
}

/// Unqueue `count` processed buffers, falling back to the backend's own
/// processed count when the batch call is rejected.
pub fn reclaim_processed(voice: &dyn Voice, count: usize) -> Result<Vec<BufferHandle>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    match voice.unqueue_processed_buffers(count) {
        Ok(handles) => {
            trace!("Unqueued {} buffers", handles.len());
            Ok(handles)
        }
        Err(e) => {
            warn!("Batch unqueue of {count} buffers failed, retrying with reported count: {e}");
            let mut handles = Vec::with_capacity(count);
            let processed = voice.processed_count()?;
            if processed > 0 {
                handles.extend(voice.unqueue_processed_buffers(processed)?);
            }
            let remaining = voice.processed_count()?;
            if remaining > 0 {
                handles.extend(voice.unqueue_processed_buffers(remaining)?);
            }
            Ok(handles)
        }
    }
}

/// Stop the voice if anything is still pending and unqueue every buffer.
///
/// Returns the unqueued handles in queue order.
pub fn drain_all(voice: &dyn Voice) -> Result<Vec<BufferHandle>> {
    let queued = voice.queued_count()?;
    if queued == 0 {
        return Ok(Vec::new());
    }
    if voice.processed_count()? < queued {
        voice.stop()?;
    }

    let mut handles = Vec::with_capacity(queued);
    loop {
        let processed = voice.processed_count()?;
        if processed == 0 {
            break;
        }
        let reclaimed = reclaim_processed(voice, processed)?;
        if reclaimed.is_empty() {
            break;
        }
        handles.extend(reclaimed);
    }

    let left = voice.queued_count()?;
    if left > 0 {
        warn!("{left} buffers still queued after drain");
    }
    Ok(handles)
}
