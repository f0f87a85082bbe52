use alloc::collections::VecDeque;

use super::{AcquireOutcome, SyncError, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    Unlocked,
    Locked { owner: ThreadId },
}

/// Single-owner lock. Waiters are only ever queued while the mutex is locked.
#[derive(Debug)]
pub struct KernelMutex {
    state: MutexState,
    waiters: VecDeque<ThreadId>,
}

impl Default for KernelMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelMutex {
    pub const fn new() -> Self {
        Self {
            state: MutexState::Unlocked,
            waiters: VecDeque::new(),
        }
    }

    pub fn state(&self) -> MutexState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, MutexState::Locked { .. })
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Locks for `thread`, or queues it behind the current owner.
    pub fn acquire(&mut self, thread: ThreadId) -> Result<AcquireOutcome, SyncError> {
        match self.state {
            MutexState::Unlocked => {
                self.state = MutexState::Locked { owner: thread };
                Ok(AcquireOutcome::Acquired)
            }
            // would suspend the owner forever
            MutexState::Locked { owner } if owner == thread => Err(SyncError::InvalidArgument),
            MutexState::Locked { .. } => {
                self.waiters.push_back(thread);
                Ok(AcquireOutcome::MustWait)
            }
        }
    }

    /// Unlocks on behalf of `thread`. If someone is waiting, ownership moves
    /// straight to the oldest waiter, which the caller must then resume.
    pub fn release(&mut self, thread: ThreadId) -> Result<Option<ThreadId>, SyncError> {
        match self.state {
            MutexState::Unlocked => Err(SyncError::NotLocked),
            MutexState::Locked { owner } if owner != thread => Err(SyncError::NotOwner),
            MutexState::Locked { .. } => match self.waiters.pop_front() {
                Some(next) => {
                    self.state = MutexState::Locked { owner: next };
                    Ok(Some(next))
                }
                None => {
                    self.state = MutexState::Unlocked;
                    Ok(None)
                }
            },
        }
    }
}
