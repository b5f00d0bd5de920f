//! Fixed-size history of scheduler tick durations.

use std::collections::VecDeque;
use std::time::Duration;

/// Ring of the most recent tick durations, oldest evicted first.
#[derive(Debug, Clone)]
pub struct LoadHistory {
    samples: VecDeque<Duration>,
    capacity: usize,
    total_ticks: u64,
}

impl LoadHistory {
    /// Create a history holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total_ticks: 0,
        }
    }

    /// Record the duration of one tick.
    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
        self.total_ticks += 1;
    }

    /// Mean of the retained durations.
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().sum();
        sum / self.samples.len() as u32
    }

    /// Longest retained duration.
    pub fn peak(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or_default()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ticks recorded since creation, including evicted ones.
    pub const fn total_ticks(&self) -> u64 {
        self.total_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history() {
        let history = LoadHistory::new(4);
        assert!(history.is_empty());
        assert_eq!(history.average(), Duration::ZERO);
        assert_eq!(history.peak(), Duration::ZERO);
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let mut history = LoadHistory::new(3);
        for ms in [10, 20, 30, 40] {
            history.record(Duration::from_millis(ms));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.total_ticks(), 4);
        assert_eq!(history.average(), Duration::from_millis(30));
        assert_eq!(history.peak(), Duration::from_millis(40));
    }
}
