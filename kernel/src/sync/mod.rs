//! Kernel mutexes and semaphores handed out to callers by integer id.
//!
//! The registry itself never blocks. Operations that would block report
//! [`AcquireOutcome::MustWait`] after queueing the caller, and the kernel then
//! suspends the caller through its [`Scheduler`] once the registry lock has
//! been dropped. A release picks the oldest waiter and hands it the resource
//! before resuming it, so a woken thread never has to race for it again.

use alloc::collections::BTreeMap;
use core::fmt;

use log::debug;

pub mod critical;
pub mod mutex;
pub mod scheduler;
pub mod semaphore;

use mutex::KernelMutex;
use semaphore::Semaphore;

/// A thread of control known to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Suspension and resumption of threads, provided by the scheduler.
pub trait Scheduler: Sync {
    fn current(&self) -> ThreadId;

    /// Takes the calling thread off the CPU until [`Scheduler::resume`] is
    /// called for it. A resume that arrives first must not be lost: the next
    /// suspend then returns immediately.
    fn suspend_current(&self);

    fn resume(&self, thread: ThreadId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// The caller was queued and must suspend.
    MustWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    InvalidArgument,
    InvalidId,
    NotOwner,
    NotLocked,
    ResourceBusy,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidArgument => write!(f, "invalid argument"),
            SyncError::InvalidId => write!(f, "no such mutex or semaphore"),
            SyncError::NotOwner => write!(f, "caller does not own the mutex"),
            SyncError::NotLocked => write!(f, "mutex is not locked"),
            SyncError::ResourceBusy => write!(f, "resource is busy"),
        }
    }
}

/// Every live mutex and semaphore, keyed by id. Ids start at 1 and are never
/// handed out twice.
pub struct SyncRegistry {
    mutexes: BTreeMap<u64, KernelMutex>,
    semaphores: BTreeMap<u64, Semaphore>,
    next_mutex_id: u64,
    next_semaphore_id: u64,
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRegistry {
    pub const fn new() -> Self {
        Self {
            mutexes: BTreeMap::new(),
            semaphores: BTreeMap::new(),
            next_mutex_id: 1,
            next_semaphore_id: 1,
        }
    }

    pub fn create_mutex(&mut self) -> u64 {
        let id = self.next_mutex_id;
        self.next_mutex_id += 1;
        self.mutexes.insert(id, KernelMutex::new());
        debug!("mutex {} created", id);
        id
    }

    pub fn mutex(&self, id: u64) -> Result<&KernelMutex, SyncError> {
        self.mutexes.get(&id).ok_or(SyncError::InvalidId)
    }

    pub fn mutex_mut(&mut self, id: u64) -> Result<&mut KernelMutex, SyncError> {
        self.mutexes.get_mut(&id).ok_or(SyncError::InvalidId)
    }

    pub fn destroy_mutex(&mut self, id: u64) -> Result<(), SyncError> {
        if self.mutex(id)?.is_locked() {
            return Err(SyncError::ResourceBusy);
        }
        self.mutexes.remove(&id);
        debug!("mutex {} destroyed", id);
        Ok(())
    }

    pub fn create_semaphore(&mut self, initial: u64) -> Result<u64, SyncError> {
        let initial = i64::try_from(initial).map_err(|_| SyncError::InvalidArgument)?;
        let id = self.next_semaphore_id;
        self.next_semaphore_id += 1;
        self.semaphores.insert(id, Semaphore::new(initial));
        debug!("semaphore {} created with count {}", id, initial);
        Ok(id)
    }

    pub fn semaphore(&self, id: u64) -> Result<&Semaphore, SyncError> {
        self.semaphores.get(&id).ok_or(SyncError::InvalidId)
    }

    pub fn semaphore_mut(&mut self, id: u64) -> Result<&mut Semaphore, SyncError> {
        self.semaphores.get_mut(&id).ok_or(SyncError::InvalidId)
    }

    pub fn destroy_semaphore(&mut self, id: u64) -> Result<(), SyncError> {
        if self.semaphore(id)?.waiters() > 0 {
            return Err(SyncError::ResourceBusy);
        }
        self.semaphores.remove(&id);
        debug!("semaphore {} destroyed", id);
        Ok(())
    }
}
