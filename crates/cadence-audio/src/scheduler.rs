//! Background refill scheduler.
//!
//! One worker thread wakes at the configured rate, snapshots the set of
//! active stream sessions and refills each of them in turn. All decoding for
//! every session goes through one shared scratch buffer, so decode calls are
//! serialized across sessions.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cadence_core::{Error, Result, StreamingConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{DecodedChunkPool, LoadHistory};
use crate::refill::RefillOutcome;
use crate::session::StreamSession;

/// Summary of a single refill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions in the snapshot.
    pub visited: usize,
    pub refilled: usize,
    pub skipped: usize,
    /// Sessions that completed and were removed.
    pub finished: usize,
    /// Sessions whose refill returned an error.
    pub failed: usize,
}

/// Recent scheduler load, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerLoad {
    pub average: Duration,
    pub peak: Duration,
    /// Retained samples.
    pub samples: usize,
    pub total_ticks: u64,
    pub active_streams: usize,
    pub interval: Duration,
}

impl SchedulerLoad {
    /// Average tick time as a fraction of the tick interval.
    pub fn utilization(&self) -> f64 {
        if self.interval.is_zero() {
            return 0.0;
        }
        self.average.as_secs_f64() / self.interval.as_secs_f64()
    }
}

struct Shared {
    config: StreamingConfig,
    active: Mutex<Vec<Arc<StreamSession>>>,
    scratch: Mutex<Vec<f32>>,
    pool: Arc<DecodedChunkPool>,
    cancelled: AtomicBool,
    load: Mutex<LoadHistory>,
    next_id: AtomicU64,
}

impl Shared {
    fn add(&self, session: Arc<StreamSession>) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        let mut active = self.active.lock();
        if active.iter().any(|s| s.id() == session.id()) {
            return false;
        }
        debug!(session = session.id(), "Stream registered");
        active.push(session);
        true
    }

    fn remove(&self, id: u64) -> bool {
        // Dropped after the lock is released; the last reference may run dispose.
        let removed = {
            let mut active = self.active.lock();
            active
                .iter()
                .position(|s| s.id() == id)
                .map(|index| active.remove(index))
        };
        if removed.is_some() {
            debug!(session = id, "Stream deregistered");
        }
        removed.is_some()
    }

    fn tick(&self) -> TickReport {
        let started = Instant::now();
        let snapshot: Vec<Arc<StreamSession>> = self.active.lock().clone();
        let mut report = TickReport {
            visited: snapshot.len(),
            ..TickReport::default()
        };

        for session in snapshot {
            if self.cancelled.load(Ordering::Acquire) {
                break;
            }
            match session.refill(&self.scratch) {
                Ok(RefillOutcome::Skipped) => report.skipped += 1,
                Ok(RefillOutcome::Refilled { .. }) => report.refilled += 1,
                Ok(RefillOutcome::Finished) => {
                    // The session already left the active set.
                    report.finished += 1;
                    info!(session = session.id(), "Stream finished");
                    session.notify_finished();
                }
                Err(e) if e.is_decode() => {
                    report.failed += 1;
                    error!(session = session.id(), "Decode failed, disposing stream: {e}");
                    self.remove(session.id());
                    session.fault(&e);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(session = session.id(), "Refill failed: {e}");
                }
            }
        }

        let elapsed = started.elapsed();
        self.load.lock().record(elapsed);
        trace!("Tick over {} streams took {elapsed:?}", report.visited);
        report
    }
}

/// Cloneable access to the scheduler for stream sessions.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Add a session to the active set. Returns whether the set changed.
    pub fn add_stream(&self, session: Arc<StreamSession>) -> bool {
        self.shared.add(session)
    }

    /// Remove a session from the active set. Returns whether the set changed.
    pub fn remove_stream(&self, session: &StreamSession) -> bool {
        self.shared.remove(session.id())
    }

    pub fn contains(&self, session: &StreamSession) -> bool {
        self.shared
            .active
            .lock()
            .iter()
            .any(|s| s.id() == session.id())
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    pub fn pool(&self) -> &Arc<DecodedChunkPool> {
        &self.shared.pool
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    /// The decode scratch buffer shared by every session.
    pub(crate) fn scratch(&self) -> &Mutex<Vec<f32>> {
        &self.shared.scratch
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn remove_id(&self, id: u64) -> bool {
        self.shared.remove(id)
    }
}

struct Worker {
    thread: JoinHandle<()>,
    wake_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// The service that keeps every active stream's hardware buffers filled.
pub struct RefillScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl RefillScheduler {
    /// Create a scheduler. Call [`RefillScheduler::start`] to spawn its thread.
    pub fn new(config: StreamingConfig, pool: Arc<DecodedChunkPool>) -> Result<Self> {
        config.validate()?;
        let history = LoadHistory::new(config.load_history_len);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                active: Mutex::new(Vec::new()),
                scratch: Mutex::new(Vec::new()),
                pool,
                cancelled: AtomicBool::new(false),
                load: Mutex::new(history),
                next_id: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the refill thread. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);

        let thread = std::thread::Builder::new()
            .name("cadence-refill".to_string())
            .spawn(move || {
                run(&shared, &wake_rx);
                drop(done_tx);
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn refill thread: {e}")))?;

        info!(
            "Refill scheduler started at {}Hz",
            self.shared.config.update_rate_hz
        );
        *worker = Some(Worker {
            thread,
            wake_tx,
            done_rx,
        });
        Ok(())
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run one refill pass on the calling thread.
    ///
    /// Lets headless callers and tests drive the scheduler deterministically
    /// without starting the background thread.
    pub fn tick(&self) -> TickReport {
        self.shared.tick()
    }

    pub fn load(&self) -> SchedulerLoad {
        let history = self.shared.load.lock();
        SchedulerLoad {
            average: history.average(),
            peak: history.peak(),
            samples: history.len(),
            total_ticks: history.total_ticks(),
            active_streams: self.active_count(),
            interval: self.shared.config.tick_interval(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    pub fn pool(&self) -> &Arc<DecodedChunkPool> {
        &self.shared.pool
    }

    /// Cancel the thread, clear the active set and wait a bounded time for exit.
    ///
    /// A thread still busy after the timeout is detached.
    pub fn dispose(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let cleared = std::mem::take(&mut *self.shared.active.lock());
        debug!("Scheduler disposing, dropping {} active streams", cleared.len());
        drop(cleared);

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.wake_tx.try_send(());

        match worker.done_rx.recv_timeout(self.shared.config.shutdown_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    warn!("Refill thread panicked");
                }
                info!("Refill scheduler stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Refill thread did not exit within {:?}, detaching",
                    self.shared.config.shutdown_timeout()
                );
            }
        }
    }
}

impl Drop for RefillScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run(shared: &Shared, wake_rx: &Receiver<()>) {
    let interval = shared.config.tick_interval();
    let mut next_wait = interval;

    loop {
        match wake_rx.recv_timeout(next_wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if shared.cancelled.load(Ordering::Acquire) {
            break;
        }

        let started = Instant::now();
        shared.tick();
        next_wait = interval.saturating_sub(started.elapsed());
    }
    debug!("Refill thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AudioBackend, MemoryBackend};
    use crate::source::MemorySource;

    fn config() -> StreamingConfig {
        StreamingConfig {
            update_rate_hz: 200,
            buffer_count: 3,
            buffer_duration_ms: 100,
            shutdown_timeout_ms: 1000,
            ..StreamingConfig::default()
        }
    }

    fn scheduler() -> RefillScheduler {
        RefillScheduler::new(config(), Arc::new(DecodedChunkPool::new(16))).unwrap()
    }

    fn session(scheduler: &RefillScheduler, backend: &MemoryBackend) -> Arc<StreamSession> {
        let voice = backend.create_voice(3).unwrap();
        let source = MemorySource::new(vec![0.1f32; 500], 1, 1000);
        StreamSession::new(voice, Box::new(source), scheduler.handle()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let bad = StreamingConfig {
            update_rate_hz: 0,
            ..StreamingConfig::default()
        };
        assert!(RefillScheduler::new(bad, Arc::new(DecodedChunkPool::default())).is_err());
    }

    #[test]
    fn test_add_and_remove_are_idempotent() {
        let scheduler = scheduler();
        let backend = MemoryBackend::new();
        let stream = session(&scheduler, &backend);
        let handle = scheduler.handle();

        assert!(handle.add_stream(Arc::clone(&stream)));
        assert!(!handle.add_stream(Arc::clone(&stream)));
        assert_eq!(handle.active_count(), 1);
        assert!(handle.contains(&stream));

        assert!(handle.remove_stream(&stream));
        assert!(!handle.remove_stream(&stream));
        assert_eq!(handle.active_count(), 0);
    }

    #[test]
    fn test_tick_records_load() {
        let scheduler = scheduler();
        let backend = MemoryBackend::new();
        let stream = session(&scheduler, &backend);
        stream.play().unwrap();

        let report = scheduler.tick();
        assert_eq!(report.visited, 1);
        assert_eq!(report.refilled, 1);

        let load = scheduler.load();
        assert_eq!(load.total_ticks, 1);
        assert_eq!(load.samples, 1);
        assert_eq!(load.active_streams, 1);
        assert_eq!(load.interval, config().tick_interval());
    }

    #[test]
    fn test_thread_refills_and_shuts_down() {
        let scheduler = scheduler();
        let backend = MemoryBackend::new();
        let stream = session(&scheduler, &backend);
        stream.play().unwrap();

        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        let voice = backend.last_voice().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while voice.queued_handles().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(voice.queued_handles().len(), 3);

        let started = Instant::now();
        scheduler.dispose();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.active_count(), 0);
        assert!(matches!(scheduler.start(), Err(Error::Disposed)));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let scheduler = scheduler();
        scheduler.start().unwrap();
        scheduler.dispose();
        scheduler.dispose();
        assert!(scheduler.is_disposed());
    }

    #[test]
    fn test_cancelled_scheduler_rejects_streams() {
        let scheduler = scheduler();
        let backend = MemoryBackend::new();
        let stream = session(&scheduler, &backend);
        scheduler.dispose();
        assert!(!scheduler.handle().add_stream(stream));
    }

    #[test]
    fn test_utilization() {
        let load = SchedulerLoad {
            average: Duration::from_millis(5),
            interval: Duration::from_millis(50),
            ..SchedulerLoad::default()
        };
        assert!((load.utilization() - 0.1).abs() < 1e-9);
    }
}
