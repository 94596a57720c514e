//! Adaptive batching of directory listing entries.

use std::time::{Duration, Instant};

use crate::protocol::Entry;

/// Tuning for [`ListBatcher`].
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Threshold at the start of every operation.
    pub initial: usize,
    /// A flush slower than this shrinks the threshold to 3/4.
    pub slow: Duration,
    /// Reaching the threshold faster than this grows it to 5/4.
    pub fast: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial: 100,
            slow: Duration::from_millis(300),
            fast: Duration::from_millis(100),
        }
    }
}

/// Buffers listing entries and decides when to flush them.
#[derive(Debug)]
pub struct ListBatcher {
    config: BatchConfig,
    threshold: usize,
    pending: Vec<Entry>,
    last_flush: Instant,
}

impl ListBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            threshold: config.initial.max(1),
            pending: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffer an entry. Returns a batch when it should be sent now.
    pub fn push(&mut self, entry: Entry) -> Option<Vec<Entry>> {
        self.push_at(entry, Instant::now())
    }

    pub fn push_at(&mut self, entry: Entry, now: Instant) -> Option<Vec<Entry>> {
        self.pending.push(entry);
        let elapsed = now.saturating_duration_since(self.last_flush);

        if self.pending.len() > self.threshold {
            if elapsed > self.config.slow {
                self.threshold = (self.threshold * 3 / 4).max(1);
            } else if elapsed < self.config.fast {
                self.threshold = (self.threshold * 5 / 4).max(self.threshold + 1);
                return None;
            }
            return Some(self.flush_at(now));
        }

        if elapsed >= self.config.slow {
            return Some(self.flush_at(now));
        }
        None
    }

    /// Take everything buffered, restarting the flush clock.
    pub fn flush(&mut self) -> Vec<Entry> {
        self.flush_at(Instant::now())
    }

    fn flush_at(&mut self, now: Instant) -> Vec<Entry> {
        self.last_flush = now;
        std::mem::take(&mut self.pending)
    }

    /// Back to the initial threshold, for the next operation.
    pub fn reset(&mut self) {
        self.threshold = self.config.initial.max(1);
        self.pending.clear();
        self.last_flush = Instant::now();
    }
}
