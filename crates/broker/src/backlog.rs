//! Flow control for push-based partition consumers.
//!
//! A client that receives records for many partitions on one stream cannot
//! block when a single partition consumer falls behind: every other
//! partition would stall behind it. Instead the router queues without
//! bound and pauses fetching for the slow partition once its backlog
//! reaches a high watermark, resuming when it drains to half of that.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Level {
    depth: usize,
    paused: bool,
}

/// Queued-record count for one partition with pause and resume hooks.
#[derive(Debug)]
pub struct PartitionBacklog {
    level: Mutex<Level>,
    high: usize,
    low: usize,
}

impl PartitionBacklog {
    /// Creates a backlog that pauses at `high` queued records.
    pub fn new(high: usize) -> Self {
        let high = high.max(1);
        Self {
            level: Mutex::default(),
            high,
            low: high / 2,
        }
    }

    /// Counts one queued record. Calls `pause` when the backlog crosses the
    /// high watermark.
    ///
    /// The hook runs under the backlog's lock so a concurrent
    /// [`popped`](Self::popped) cannot resume before the pause lands.
    pub fn pushed(&self, pause: impl FnOnce()) {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        level.depth += 1;
        if level.depth >= self.high && !level.paused {
            level.paused = true;
            pause();
        }
    }

    /// Counts one dequeued record. Calls `resume` when a paused backlog drains
    /// to the low watermark.
    pub fn popped(&self, resume: impl FnOnce()) {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        level.depth = level.depth.saturating_sub(1);
        if level.depth <= self.low && level.paused {
            level.paused = false;
            resume();
        }
    }

    /// Records currently queued.
    pub fn depth(&self) -> usize {
        self.level.lock().unwrap_or_else(PoisonError::into_inner).depth
    }

    pub fn is_paused(&self) -> bool {
        self.level.lock().unwrap_or_else(PoisonError::into_inner).paused
    }
}
