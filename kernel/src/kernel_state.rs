//! The kernel-wide state shared by every core and interrupt context.
//!
//! One [`Kernel`] is built at boot and lives until shutdown. Its two pieces of
//! mutable state, the memory manager and the sync registry, each sit behind
//! a single spinlock that is only ever taken inside a critical section. The
//! locks are never nested and never held while a thread is suspended.

use alloc::collections::BTreeMap;
use core::ops::Range;

use log::debug;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::{
    memory::{bitmap_frame_allocator::BitmapFrameAllocator, paging::PageTableManager},
    sync::{critical::with_locked, AcquireOutcome, Scheduler, SyncError, SyncRegistry, ThreadId},
    syscalls::{
        abi::{SyscallError, ESUCCESS},
        mmap::{MemoryManager, ProtFlags},
    },
};

pub struct Kernel<P, S> {
    memory: Mutex<MemoryManager<P>>,
    sync: Mutex<SyncRegistry>,
    errors: Mutex<BTreeMap<ThreadId, u64>>,
    scheduler: S,
}

impl<P: PageTableManager, S: Scheduler> Kernel<P, S> {
    pub fn new(frames: BitmapFrameAllocator, page_tables: P, scheduler: S) -> Self {
        Self {
            memory: Mutex::new(MemoryManager::new(frames, page_tables)),
            sync: Mutex::new(SyncRegistry::new()),
            errors: Mutex::new(BTreeMap::new()),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub(crate) fn with_memory<R>(&self, f: impl FnOnce(&mut MemoryManager<P>) -> R) -> R {
        with_locked(&self.memory, f)
    }

    pub(crate) fn with_sync<R>(&self, f: impl FnOnce(&mut SyncRegistry) -> R) -> R {
        with_locked(&self.sync, f)
    }

    pub fn free_frames(&self) -> usize {
        self.with_memory(|mm| mm.frames().free_frames())
    }

    /// Indices of the frames behind the mapping containing `addr`.
    pub fn backing_frames(&self, addr: VirtAddr) -> Option<Range<usize>> {
        self.with_memory(|mm| {
            mm.mapping_at(addr)
                .map(|mapping| mapping.base_frame..mapping.base_frame + mapping.pages())
        })
    }

    /// How many of `frames` the bitmap still marks allocated. Page-table
    /// frames are not counted unless they fall inside the range.
    pub fn frames_still_used(&self, frames: Range<usize>) -> usize {
        self.with_memory(|mm| {
            frames
                .filter(|&index| mm.frames().is_used(index).unwrap_or(true))
                .count()
        })
    }

    pub fn mmap(
        &self,
        size: u64,
        prot: ProtFlags,
        hint: Option<VirtAddr>,
    ) -> Result<VirtAddr, SyscallError> {
        self.with_memory(|mm| mm.mmap(size, prot, hint))
    }

    pub fn munmap(&self, addr: VirtAddr, size: u64) -> Result<(), SyscallError> {
        self.with_memory(|mm| mm.munmap(addr, size))
    }

    pub fn mprotect(&self, addr: VirtAddr, size: u64, prot: ProtFlags) -> Result<(), SyscallError> {
        self.with_memory(|mm| mm.mprotect(addr, size, prot))
    }

    pub fn mutex_create(&self) -> u64 {
        self.with_sync(|sync| sync.create_mutex())
    }

    /// Returns once the caller owns the mutex, suspending it meanwhile.
    pub fn mutex_acquire(&self, id: u64) -> Result<(), SyncError> {
        let thread = self.scheduler.current();
        let outcome = self.with_sync(|sync| sync.mutex_mut(id)?.acquire(thread))?;

        if outcome == AcquireOutcome::MustWait {
            debug!("thread {} waits for mutex {}", thread.0, id);
            // ownership is handed over by the releasing thread
            self.scheduler.suspend_current();
        }
        Ok(())
    }

    pub fn mutex_release(&self, id: u64) -> Result<(), SyncError> {
        let thread = self.scheduler.current();
        let next = self.with_sync(|sync| sync.mutex_mut(id)?.release(thread))?;

        if let Some(next) = next {
            debug!("mutex {} handed to thread {}", id, next.0);
            self.scheduler.resume(next);
        }
        Ok(())
    }

    pub fn mutex_destroy(&self, id: u64) -> Result<(), SyncError> {
        self.with_sync(|sync| sync.destroy_mutex(id))
    }

    pub fn semaphore_create(&self, initial: u64) -> Result<u64, SyncError> {
        self.with_sync(|sync| sync.create_semaphore(initial))
    }

    /// Takes one unit, suspending the caller until one is released to it.
    pub fn semaphore_acquire(&self, id: u64) -> Result<(), SyncError> {
        let thread = self.scheduler.current();
        let outcome = self.with_sync(|sync| Ok(sync.semaphore_mut(id)?.acquire(thread)))?;

        if outcome == AcquireOutcome::MustWait {
            debug!("thread {} waits on semaphore {}", thread.0, id);
            self.scheduler.suspend_current();
        }
        Ok(())
    }

    pub fn semaphore_release(&self, id: u64) -> Result<(), SyncError> {
        let next = self.with_sync(|sync| sync.semaphore_mut(id)?.release())?;

        if let Some(next) = next {
            self.scheduler.resume(next);
        }
        Ok(())
    }

    pub fn semaphore_destroy(&self, id: u64) -> Result<(), SyncError> {
        self.with_sync(|sync| sync.destroy_semaphore(id))
    }

    /// The error cell of `thread`: the code of its last failed syscall, or
    /// `ESUCCESS` if none has failed yet.
    pub fn last_error(&self, thread: ThreadId) -> u64 {
        with_locked(&self.errors, |errors| {
            errors.get(&thread).copied().unwrap_or(ESUCCESS)
        })
    }

    pub(crate) fn record_error(&self, thread: ThreadId, err: SyscallError) {
        with_locked(&self.errors, |errors| {
            errors.insert(thread, err.code());
        });
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::{
        constants::memory::PAGE_SIZE,
        memory::frame_index,
        sync::mutex::MutexState,
        testing::{kernel, wait_until, SoftPageTables, ThreadScheduler},
    };

    #[test]
    fn test_mmap_munmap_flips_backing_bit() {
        let kernel = kernel(8);
        let prot = ProtFlags::new().with_flags(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);

        let addr = kernel.mmap(PAGE_SIZE, prot, None).unwrap();
        assert!(addr.is_aligned(PAGE_SIZE));
        let frame = kernel.with_memory(|mm| mm.mapping_at(addr).unwrap().base_frame);
        assert!(kernel.with_memory(|mm| mm.frames().is_used(frame).unwrap()));

        kernel.munmap(addr, PAGE_SIZE).unwrap();
        assert!(!kernel.with_memory(|mm| mm.frames().is_used(frame).unwrap()));
        assert_eq!(kernel.free_frames(), 8);
    }

    #[test]
    fn test_munmap_frees_backing_frames_but_not_page_tables() {
        let kernel = Kernel::new(
            BitmapFrameAllocator::new(8),
            SoftPageTables::with_table_frames(),
            ThreadScheduler::default(),
        );
        let prot = ProtFlags::new().with_flags(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);

        let addr = kernel.mmap(2 * PAGE_SIZE, prot, None).unwrap();
        let backing = kernel.backing_frames(addr).unwrap();
        assert_eq!(backing.len(), 2);
        assert_eq!(kernel.frames_still_used(backing.clone()), 2);
        assert_eq!(kernel.free_frames(), 5);

        kernel.munmap(addr, 2 * PAGE_SIZE).unwrap();
        assert_eq!(kernel.backing_frames(addr), None);
        assert_eq!(kernel.frames_still_used(backing), 0);
        // the table frame stays with the page tables
        assert_eq!(kernel.free_frames(), 7);
    }

    #[test]
    fn test_mprotect_never_mapped() {
        let kernel = kernel(8);
        let read = ProtFlags::new().with_flags(ProtFlags::PROT_READ);

        assert_eq!(
            kernel.mprotect(VirtAddr::new(0x4000_0000), PAGE_SIZE, read),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let kernel = &kernel(512);
        let claimed: Vec<(usize, usize)> = std::thread::scope(|s| {
            let handles: Vec<_> = (1..=8)
                .map(|pages| {
                    s.spawn(move || {
                        (0..6)
                            .map(|_| {
                                let base = kernel
                                    .with_memory(|mm| mm.frames_mut().allocate_contiguous(pages))
                                    .unwrap();
                                (base, pages)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let mut owner = alloc::vec![false; 512];
        for (base, count) in claimed {
            for frame in base..base + count {
                assert!(!owner[frame], "frame {} handed out twice", frame);
                owner[frame] = true;
            }
        }
        assert_eq!(kernel.free_frames(), 512 - 6 * (1..=8).sum::<usize>());
    }

    #[test]
    fn test_concurrent_mmaps_use_distinct_frames() {
        let kernel = kernel(256);
        let prot = ProtFlags::new().with_flags(ProtFlags::PROT_READ);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..8 {
                        kernel.mmap(2 * PAGE_SIZE, prot, None).unwrap();
                    }
                });
            }
        });

        kernel.with_memory(|mm| {
            let mut frames: Vec<usize> = mm
                .mappings()
                .flat_map(|m| m.base_frame..m.base_frame + m.pages())
                .collect();
            frames.sort_unstable();
            frames.dedup();
            assert_eq!(frames.len(), 64);

            for mapping in mm.mappings() {
                let page = x86_64::structures::paging::Page::containing_address(mapping.start);
                let (frame, _) = mm.page_tables().translate(page).unwrap();
                assert_eq!(frame_index(frame), mapping.base_frame);
            }
        });
    }

    #[test]
    fn test_mutex_release_twice() {
        let kernel = kernel(8);
        let id = kernel.mutex_create();

        kernel.mutex_acquire(id).unwrap();
        kernel.mutex_release(id).unwrap();
        assert_eq!(kernel.mutex_release(id), Err(SyncError::NotLocked));
    }

    #[test]
    fn test_mutex_invalid_id() {
        let kernel = kernel(8);
        assert_eq!(kernel.mutex_acquire(42), Err(SyncError::InvalidId));
        assert_eq!(kernel.mutex_release(42), Err(SyncError::InvalidId));
        assert_eq!(kernel.mutex_destroy(42), Err(SyncError::InvalidId));
    }

    #[test]
    fn test_mutex_release_by_other_thread() {
        let kernel = kernel(8);
        let id = kernel.mutex_create();
        kernel.mutex_acquire(id).unwrap();

        let result = std::thread::scope(|s| s.spawn(|| kernel.mutex_release(id)).join().unwrap());
        assert_eq!(result, Err(SyncError::NotOwner));
        assert_eq!(kernel.mutex_destroy(id), Err(SyncError::ResourceBusy));
    }

    #[test]
    fn test_mutex_waiter_is_suspended_then_handed_ownership() {
        let kernel = kernel(8);
        let id = kernel.mutex_create();
        kernel.mutex_acquire(id).unwrap();
        let me = kernel.scheduler().current();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                kernel.mutex_acquire(id).unwrap();
                let owner = kernel.with_sync(|sync| sync.mutex(id).unwrap().state());
                kernel.mutex_release(id).unwrap();
                owner
            });

            wait_until(|| kernel.scheduler().suspensions() == 1);
            assert_eq!(kernel.with_sync(|sync| sync.mutex(id).unwrap().waiters()), 1);
            kernel.mutex_release(id).unwrap();

            let owner = waiter.join().unwrap();
            assert_ne!(owner, MutexState::Locked { owner: me });
            assert!(matches!(owner, MutexState::Locked { .. }));
        });

        assert_eq!(kernel.mutex_destroy(id), Ok(()));
    }

    #[test]
    fn test_mutex_admits_one_holder_at_a_time() {
        let kernel = kernel(8);
        let id = kernel.mutex_create();
        let inside = AtomicBool::new(false);
        let entries = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..50 {
                        kernel.mutex_acquire(id).unwrap();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        entries.fetch_add(1, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.store(false, Ordering::SeqCst);
                        kernel.mutex_release(id).unwrap();
                    }
                });
            }
        });

        assert_eq!(entries.load(Ordering::SeqCst), 200);
        assert_eq!(
            kernel.with_sync(|sync| sync.mutex(id).unwrap().state()),
            MutexState::Unlocked
        );
    }

    #[test]
    fn test_semaphore_releases_admit_exactly_k() {
        let kernel = kernel(8);
        let id = kernel.semaphore_create(0).unwrap();
        for _ in 0..3 {
            kernel.semaphore_release(id).unwrap();
        }

        for _ in 0..3 {
            kernel.semaphore_acquire(id).unwrap();
        }
        assert_eq!(kernel.scheduler().suspensions(), 0);

        std::thread::scope(|s| {
            let blocked = s.spawn(|| kernel.semaphore_acquire(id));
            wait_until(|| kernel.scheduler().suspensions() == 1);
            assert_eq!(kernel.with_sync(|sync| sync.semaphore(id).unwrap().waiters()), 1);

            kernel.semaphore_release(id).unwrap();
            assert_eq!(blocked.join().unwrap(), Ok(()));
        });
        assert_eq!(kernel.with_sync(|sync| sync.semaphore(id).unwrap().count()), 0);
    }

    #[test]
    fn test_semaphore_wakes_waiters_in_fifo_order() {
        let kernel = kernel(8);
        let id = kernel.semaphore_create(0).unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            for n in 0..3 {
                let order = Arc::clone(&order);
                let kernel = &kernel;
                s.spawn(move || {
                    kernel.semaphore_acquire(id).unwrap();
                    order.lock().unwrap().push(n);
                });
                // queue the waiters one at a time so their order is known
                wait_until(|| {
                    kernel.with_sync(|sync| sync.semaphore(id).unwrap().waiters() == n + 1)
                });
            }

            assert_eq!(kernel.semaphore_destroy(id), Err(SyncError::ResourceBusy));
            for n in 0..3 {
                kernel.semaphore_release(id).unwrap();
                wait_until(|| order.lock().unwrap().len() == n + 1);
            }
        });

        assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
        assert_eq!(kernel.semaphore_destroy(id), Ok(()));
    }
}
