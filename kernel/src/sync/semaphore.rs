use alloc::collections::VecDeque;

use super::{AcquireOutcome, SyncError, ThreadId};

/// Counting semaphore. A negative count is the number of queued waiters.
#[derive(Debug)]
pub struct Semaphore {
    count: i64,
    waiters: VecDeque<ThreadId>,
}

impl Semaphore {
    pub fn new(initial: i64) -> Self {
        Self {
            count: initial,
            waiters: VecDeque::new(),
        }
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn acquire(&mut self, thread: ThreadId) -> AcquireOutcome {
        self.count -= 1;
        if self.count < 0 {
            self.waiters.push_back(thread);
            AcquireOutcome::MustWait
        } else {
            AcquireOutcome::Acquired
        }
    }

    /// Returns one unit. If a thread is queued, the unit goes to the oldest
    /// one, which the caller must resume.
    pub fn release(&mut self) -> Result<Option<ThreadId>, SyncError> {
        self.count = self
            .count
            .checked_add(1)
            .ok_or(SyncError::InvalidArgument)?;
        Ok(self.waiters.pop_front())
    }
}
