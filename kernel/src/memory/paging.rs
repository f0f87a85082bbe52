use core::fmt;

use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        mapper::{FlagUpdateError, MapToError, UnmapError},
        Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    },
    VirtAddr,
};

use super::bitmap_frame_allocator::BitmapFrameAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    FrameAllocationFailed,
    PageAlreadyMapped,
    PageNotMapped,
    HugePage,
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingError::FrameAllocationFailed => write!(f, "no frame for a page table"),
            PagingError::PageAlreadyMapped => write!(f, "page already mapped"),
            PagingError::PageNotMapped => write!(f, "page not mapped"),
            PagingError::HugePage => write!(f, "parent entry maps a huge page"),
        }
    }
}

impl From<MapToError<Size4KiB>> for PagingError {
    fn from(err: MapToError<Size4KiB>) -> Self {
        match err {
            MapToError::FrameAllocationFailed => PagingError::FrameAllocationFailed,
            MapToError::PageAlreadyMapped(_) => PagingError::PageAlreadyMapped,
            MapToError::ParentEntryHugePage => PagingError::HugePage,
        }
    }
}

impl From<UnmapError> for PagingError {
    fn from(err: UnmapError) -> Self {
        match err {
            UnmapError::ParentEntryHugePage => PagingError::HugePage,
            UnmapError::PageNotMapped | UnmapError::InvalidFrameAddress(_) => {
                PagingError::PageNotMapped
            }
        }
    }
}

impl From<FlagUpdateError> for PagingError {
    fn from(err: FlagUpdateError) -> Self {
        match err {
            FlagUpdateError::PageNotMapped => PagingError::PageNotMapped,
            FlagUpdateError::ParentEntryHugePage => PagingError::HugePage,
        }
    }
}

/// Owner of the virtual to physical translation.
///
/// The mmap layer decides which frames back which pages; implementations
/// only edit the tables. `frames` supplies frames for new intermediate
/// tables and is the same bitmap the caller is already holding locked.
pub trait PageTableManager: Send {
    fn map(
        &mut self,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<(), PagingError>;

    /// Removes the translation for `page` and returns the frame it pointed to.
    fn unmap(&mut self, page: Page) -> Result<PhysFrame, PagingError>;

    fn set_permissions(&mut self, page: Page, flags: PageTableFlags) -> Result<(), PagingError>;
}

/// The active level 4 table, reached through the higher half direct map.
pub struct KernelPageTables {
    mapper: OffsetPageTable<'static>,
}

impl KernelPageTables {
    pub fn new(mapper: OffsetPageTable<'static>) -> Self {
        Self { mapper }
    }
}

impl PageTableManager for KernelPageTables {
    fn map(
        &mut self,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<(), PagingError> {
        // frames go out to user space; never leak a previous owner's data
        let frame_virt = self.mapper.phys_offset() + frame.start_address().as_u64();
        unsafe {
            core::ptr::write_bytes(frame_virt.as_mut_ptr::<u8>(), 0, frame.size() as usize);
            self.mapper.map_to(page, frame, flags, frames)?.flush();
        }
        Ok(())
    }

    fn unmap(&mut self, page: Page) -> Result<PhysFrame, PagingError> {
        let (frame, flush) = self.mapper.unmap(page)?;
        flush.flush();
        Ok(frame)
    }

    fn set_permissions(&mut self, page: Page, flags: PageTableFlags) -> Result<(), PagingError> {
        unsafe {
            self.mapper.update_flags(page, flags)?.flush();
        }
        // TODO: shoot down stale TLB entries on the other cores
        Ok(())
    }
}

/// Wraps the level 4 table currently loaded in CR3.
///
/// # Safety
///
/// All physical memory must be mapped at `physical_memory_offset`, and this
/// must be called only once to avoid aliasing `&mut` references.
pub unsafe fn init(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    OffsetPageTable::new(
        active_level_4_table(physical_memory_offset),
        physical_memory_offset,
    )
}

/// # Safety
///
/// Same contract as [`init`].
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    &mut *page_table_ptr
}
