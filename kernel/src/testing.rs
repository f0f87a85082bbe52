//! Hosted stand-ins for the page tables and the scheduler.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::Thread,
    time::{Duration, Instant},
};

use x86_64::structures::paging::{FrameAllocator, Page, PageTableFlags, PhysFrame};

use crate::{
    memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        paging::{PageTableManager, PagingError},
    },
    sync::{Scheduler, ThreadId},
    Kernel,
};

pub type TestKernel = Kernel<SoftPageTables, ThreadScheduler>;

/// A kernel over `frames` free frames.
pub fn kernel(frames: usize) -> TestKernel {
    Kernel::new(
        BitmapFrameAllocator::new(frames),
        SoftPageTables::default(),
        ThreadScheduler::default(),
    )
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Page tables kept in a map.
#[derive(Default)]
pub struct SoftPageTables {
    entries: BTreeMap<Page, (PhysFrame, PageTableFlags)>,
    maps_left: Option<usize>,
    /// 2 MiB windows that already own a last-level table frame.
    tables: Option<BTreeSet<u64>>,
}

impl SoftPageTables {
    /// Tables that run out of intermediate frames after `maps` successful maps.
    pub fn failing_after(maps: usize) -> Self {
        Self {
            maps_left: Some(maps),
            ..Self::default()
        }
    }

    /// Tables that, like real ones, take a frame from the bitmap for the
    /// first page mapped in each 2 MiB window and never give it back.
    pub fn with_table_frames() -> Self {
        Self {
            tables: Some(BTreeSet::new()),
            ..Self::default()
        }
    }

    pub fn translate(&self, page: Page) -> Option<(PhysFrame, PageTableFlags)> {
        self.entries.get(&page).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageTableManager for SoftPageTables {
    fn map(
        &mut self,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<(), PagingError> {
        if let Some(left) = self.maps_left.as_mut() {
            if *left == 0 {
                return Err(PagingError::FrameAllocationFailed);
            }
            *left -= 1;
        }
        if self.entries.contains_key(&page) {
            return Err(PagingError::PageAlreadyMapped);
        }
        if let Some(tables) = self.tables.as_mut() {
            let window = page.start_address().as_u64() >> 21;
            if !tables.contains(&window) {
                frames
                    .allocate_frame()
                    .ok_or(PagingError::FrameAllocationFailed)?;
                tables.insert(window);
            }
        }
        self.entries.insert(page, (frame, flags));
        Ok(())
    }

    fn unmap(&mut self, page: Page) -> Result<PhysFrame, PagingError> {
        self.entries
            .remove(&page)
            .map(|(frame, _)| frame)
            .ok_or(PagingError::PageNotMapped)
    }

    fn set_permissions(&mut self, page: Page, flags: PageTableFlags) -> Result<(), PagingError> {
        let entry = self.entries.get_mut(&page).ok_or(PagingError::PageNotMapped)?;
        entry.1 = flags;
        Ok(())
    }
}

struct Parker {
    id: ThreadId,
    thread: Thread,
    permit: AtomicBool,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static PARKER: Arc<Parker> = Arc::new(Parker {
        id: ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)),
        thread: std::thread::current(),
        permit: AtomicBool::new(false),
    });
}

/// Maps kernel threads onto OS threads, suspending with `park`.
#[derive(Default)]
pub struct ThreadScheduler {
    threads: Mutex<HashMap<ThreadId, Arc<Parker>>>,
    suspensions: AtomicUsize,
}

impl ThreadScheduler {
    /// How many times any thread has suspended.
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::SeqCst)
    }
}

impl Scheduler for ThreadScheduler {
    fn current(&self) -> ThreadId {
        PARKER.with(|parker| {
            self.threads
                .lock()
                .unwrap()
                .entry(parker.id)
                .or_insert_with(|| Arc::clone(parker));
            parker.id
        })
    }

    fn suspend_current(&self) {
        self.suspensions.fetch_add(1, Ordering::SeqCst);
        PARKER.with(|parker| {
            while !parker.permit.swap(false, Ordering::AcqRel) {
                std::thread::park();
            }
        });
    }

    fn resume(&self, thread: ThreadId) {
        let parker = self
            .threads
            .lock()
            .unwrap()
            .get(&thread)
            .cloned()
            .expect("resumed a thread the scheduler never saw");
        parker.permit.store(true, Ordering::Release);
        parker.thread.unpark();
    }
}
