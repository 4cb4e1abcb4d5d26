//! # Backlog Queue
//!
//! Purpose: Hold messages for one connection while it cannot take writes and
//! give them back in enqueue order.
//!
//! ## Design Principles
//! 1. **FIFO**: Append at the tail, drain from the head; a write that fails is
//!    put back at the head so nothing is reordered.
//! 2. **Single Drainer**: Only the holder of the connection's write lock pops
//!    entries; producers only append. The inner lock guards the container for
//!    O(1) operations and is never held across a write.
//! 3. **Accumulator Counters**: Pending and cumulative counts are atomics so the
//!    status surface reads them without touching the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::ReplySender;

/// A queued message plus its completion target.
pub(crate) struct BacklogEntry {
    pub(crate) payload: Bytes,
    pub(crate) completion: ReplySender,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
}

impl BacklogEntry {
    pub(crate) fn new(payload: Bytes, completion: ReplySender, timeout: Duration) -> Self {
        let enqueued_at = Instant::now();
        BacklogEntry {
            payload,
            completion,
            enqueued_at,
            deadline: enqueued_at + timeout,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Time spent in the backlog so far.
    pub(crate) fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

pub(crate) struct Backlog {
    entries: Mutex<VecDeque<BacklogEntry>>,
    pending: AtomicUsize,
    total_queued: AtomicU64,
}

impl Backlog {
    pub(crate) fn new() -> Self {
        Backlog {
            entries: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            total_queued: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, entry: BacklogEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        self.pending.store(entries.len(), Ordering::Release);
        self.total_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Puts a popped entry back at the head, e.g. after a failed write.
    pub(crate) fn requeue(&self, entry: BacklogEntry) {
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        self.pending.store(entries.len(), Ordering::Release);
    }

    pub(crate) fn pop_front(&self) -> Option<BacklogEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.pop_front();
        self.pending.store(entries.len(), Ordering::Release);
        entry
    }

    /// Removes every entry whose deadline has passed, preserving the order of
    /// the rest.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<BacklogEntry> {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|entry| entry.is_expired(now)) {
            return Vec::new();
        }
        let (expired, live): (VecDeque<_>, VecDeque<_>) =
            entries.drain(..).partition(|entry| entry.is_expired(now));
        *entries = live;
        self.pending.store(entries.len(), Ordering::Release);
        expired.into()
    }

    pub(crate) fn take_all(&self) -> Vec<BacklogEntry> {
        let mut entries = self.entries.lock();
        self.pending.store(0, Ordering::Release);
        entries.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages ever queued, including ones since drained or expired.
    pub(crate) fn total_queued(&self) -> u64 {
        self.total_queued.load(Ordering::Relaxed)
    }
}
