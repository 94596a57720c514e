//! Per-protocol bookkeeping: job queue, active and idle workers, cap.

use std::collections::VecDeque;

use super::handle::{WorkerId, WorkerKey};
use super::job::JobId;

/// Times the head of a queue may be passed over by look-ahead before it is
/// scheduled regardless.
const MAX_SKIPS: u32 = 2;

/// One protocol's queue and workers. A worker id is in at most one of the
/// active and idle lists.
#[derive(Debug)]
pub struct ProtocolPool {
    protocol: String,
    cap: usize,
    queue: VecDeque<JobId>,
    active: Vec<WorkerId>,
    idle: Vec<WorkerId>,
    skipped: u32,
}

impl ProtocolPool {
    pub fn new(protocol: impl Into<String>, cap: usize) -> Self {
        Self {
            protocol: protocol.into(),
            cap: cap.max(1),
            queue: VecDeque::new(),
            active: Vec::new(),
            idle: Vec::new(),
            skipped: 0,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    pub fn enqueue(&mut self, job: JobId) {
        self.queue.push_back(job);
    }

    /// Remove a queued job. `false` if it was not queued here.
    pub fn dequeue(&mut self, job: JobId) -> bool {
        match self.queue.iter().position(|&j| j == job) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn queued(&self) -> impl Iterator<Item = JobId> + '_ {
        self.queue.iter().copied()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Position of the next job to try: the first of the next `lookahead`
    /// jobs that has an exact idle match, else the head. After the head has
    /// been passed over too often it is always chosen.
    pub fn next_candidate(&self, lookahead: usize, mut has_exact: impl FnMut(JobId) -> bool) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        if self.skipped > MAX_SKIPS {
            return Some(0);
        }
        let found = self
            .queue
            .iter()
            .take(lookahead.max(1))
            .position(|&job| has_exact(job));
        Some(found.unwrap_or(0))
    }

    /// Take the job at `index` off the queue for placement.
    pub fn take_queued(&mut self, index: usize) -> Option<JobId> {
        let job = self.queue.remove(index)?;
        if index == 0 {
            self.skipped = 0;
        } else {
            self.skipped += 1;
        }
        Some(job)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub fn active(&self) -> &[WorkerId] {
        &self.active
    }

    pub fn idle(&self) -> &[WorkerId] {
        &self.idle
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.cap
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.active.contains(&worker) || self.idle.contains(&worker)
    }

    pub fn add_idle(&mut self, worker: WorkerId) {
        self.remove_worker(worker);
        self.idle.push(worker);
    }

    pub fn add_active(&mut self, worker: WorkerId) {
        self.remove_worker(worker);
        self.active.push(worker);
    }

    /// Drop a worker from both lists. `true` if it was present.
    pub fn remove_worker(&mut self, worker: WorkerId) -> bool {
        let before = self.active.len() + self.idle.len();
        self.active.retain(|&w| w != worker);
        self.idle.retain(|&w| w != worker);
        before != self.active.len() + self.idle.len()
    }

    /// Idle worker for `key`: an exact match wherever it sits in the list,
    /// else the first idle worker of the protocol. The flag is `true` for an
    /// exact match.
    pub fn find_idle(
        &self,
        key: &WorkerKey,
        key_of: impl Fn(WorkerId) -> Option<WorkerKey>,
    ) -> Option<(WorkerId, bool)> {
        if let Some(&worker) = self
            .idle
            .iter()
            .find(|&&w| key_of(w).as_ref() == Some(key))
        {
            return Some((worker, true));
        }
        self.idle.first().map(|&worker| (worker, false))
    }

    pub fn has_exact_idle(&self, key: &WorkerKey, key_of: impl Fn(WorkerId) -> Option<WorkerKey>) -> bool {
        self.idle.iter().any(|&w| key_of(w).as_ref() == Some(key))
    }
}
