use alloc::{collections::BTreeMap, vec, vec::Vec};

use log::{debug, warn};
use x86_64::{
    structures::paging::{Page, PageTableFlags, Size4KiB},
    VirtAddr,
};

use super::abi::SyscallError;
use crate::{
    constants::{
        memory::PAGE_SIZE,
        syscalls::{END_MMAP_ADDRESS, START_MMAP_ADDRESS},
    },
    memory::{
        bitmap_frame_allocator::{BitmapFrameAllocator, FrameAllocError},
        frame_at,
        paging::{PageTableManager, PagingError},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtFlags(u64);

impl Default for ProtFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtFlags {
    pub const PROT_EXEC: u64 = 1 << 0;
    pub const PROT_READ: u64 = 1 << 1;
    pub const PROT_WRITE: u64 = 1 << 2;

    const ALL: u64 = Self::PROT_EXEC | Self::PROT_READ | Self::PROT_WRITE;

    pub const fn new() -> Self {
        ProtFlags(0)
    }

    /// Rejects bits outside read, write and execute.
    pub const fn from_bits(bits: u64) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            None
        } else {
            Some(ProtFlags(bits))
        }
    }

    // creates ProtFlags with inputted flags
    pub const fn with_flags(self, flag: u64) -> Self {
        ProtFlags(self.0 | flag)
    }

    // Checks if ProtFlags contains input flags
    pub const fn contains(self, flag: u64) -> bool {
        (self.0 & flag) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    // returns the ProtFlags
    pub const fn bits(self) -> u64 {
        self.0
    }
}

pub fn protection_to_pagetable_flags(prot: ProtFlags) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;

    if prot.contains(ProtFlags::PROT_WRITE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if !prot.contains(ProtFlags::PROT_EXEC) {
        flags |= PageTableFlags::NO_EXECUTE;
    }

    flags
}

/// A live mmap region backed by a contiguous run of frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: VirtAddr,
    pub length: u64,
    pub base_frame: usize,
    /// Permissions of each page, in address order.
    pub protections: Vec<ProtFlags>,
}

impl Mapping {
    pub fn end(&self) -> u64 {
        self.start.as_u64() + self.length
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start.as_u64() && addr < self.end()
    }

    pub fn pages(&self) -> usize {
        (self.length / PAGE_SIZE) as usize
    }

    fn page(&self, index: usize) -> Page<Size4KiB> {
        Page::containing_address(self.start + index as u64 * PAGE_SIZE)
    }
}

/// Physical frames, page tables and the mmap regions built from them.
/// Always accessed under the kernel memory lock.
pub struct MemoryManager<P> {
    frames: BitmapFrameAllocator,
    page_tables: P,
    mappings: BTreeMap<u64, Mapping>,
    next_mmap_address: u64,
}

impl<P: PageTableManager> MemoryManager<P> {
    pub fn new(frames: BitmapFrameAllocator, page_tables: P) -> Self {
        Self {
            frames,
            page_tables,
            mappings: BTreeMap::new(),
            next_mmap_address: START_MMAP_ADDRESS,
        }
    }

    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut BitmapFrameAllocator {
        &mut self.frames
    }

    pub fn page_tables(&self) -> &P {
        &self.page_tables
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    pub fn mapping_at(&self, addr: VirtAddr) -> Option<&Mapping> {
        self.mappings
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, mapping)| mapping)
            .filter(|mapping| mapping.contains(addr.as_u64()))
    }

    /// Backs `size` bytes with fresh frames and maps them. `hint` is only
    /// advisory; the returned address is where the region actually lives.
    pub fn mmap(
        &mut self,
        size: u64,
        prot: ProtFlags,
        hint: Option<VirtAddr>,
    ) -> Result<VirtAddr, SyscallError> {
        if size == 0 || size % PAGE_SIZE != 0 || prot.is_empty() {
            return Err(SyscallError::InvalidArgument);
        }
        let page_count = (size / PAGE_SIZE) as usize;

        let base_frame = self.frames.allocate_contiguous(page_count).map_err(|err| {
            debug!("mmap of {} pages failed: {}", page_count, err);
            SyscallError::from(err)
        })?;

        let Some((start, hinted)) = self.place(hint, size) else {
            warn!("mmap window exhausted, returning {} frames", page_count);
            self.release_frames(base_frame, page_count);
            return Err(SyscallError::OutOfMemory);
        };

        let mapping = Mapping {
            start,
            length: size,
            base_frame,
            protections: vec![prot; page_count],
        };

        let flags = protection_to_pagetable_flags(prot);
        for index in 0..page_count {
            let page = mapping.page(index);
            let frame = frame_at(base_frame + index);
            if let Err(err) = self.page_tables.map(page, frame, flags, &mut self.frames) {
                warn!("mapping {:?} failed ({}), rolling back", page, err);
                for mapped in 0..index {
                    self.unmap_page(mapping.page(mapped));
                }
                self.release_frames(base_frame, page_count);
                return Err(match err {
                    PagingError::FrameAllocationFailed => SyscallError::OutOfMemory,
                    _ => SyscallError::InvalidArgument,
                });
            }
        }

        if !hinted {
            self.next_mmap_address = mapping.end();
        }
        debug!(
            "mapped {:#X}..{:#X} onto frames {}..{}",
            start.as_u64(),
            mapping.end(),
            base_frame,
            base_frame + page_count
        );
        self.mappings.insert(start.as_u64(), mapping);

        Ok(start)
    }

    /// Removes a region previously returned by [`MemoryManager::mmap`]. Only
    /// whole regions can be unmapped.
    pub fn munmap(&mut self, addr: VirtAddr, size: u64) -> Result<(), SyscallError> {
        if self.mappings.get(&addr.as_u64()).map(|m| m.length) != Some(size) {
            return Err(SyscallError::InvalidArgument);
        }
        let mapping = self
            .mappings
            .remove(&addr.as_u64())
            .ok_or(SyscallError::InvalidArgument)?;

        for index in 0..mapping.pages() {
            self.unmap_page(mapping.page(index));
        }
        self.release_frames(mapping.base_frame, mapping.pages());

        debug!("unmapped {:#X}..{:#X}", addr.as_u64(), mapping.end());
        Ok(())
    }

    /// Changes the permissions of `[addr, addr + size)`, which must be page
    /// aligned and lie inside a single region.
    pub fn mprotect(
        &mut self,
        addr: VirtAddr,
        size: u64,
        prot: ProtFlags,
    ) -> Result<(), SyscallError> {
        if size == 0 || size % PAGE_SIZE != 0 || prot.is_empty() {
            return Err(SyscallError::InvalidArgument);
        }
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(SyscallError::InvalidArgument);
        }

        let start = addr.as_u64();
        let mapping = self
            .mappings
            .range_mut(..=start)
            .next_back()
            .map(|(_, mapping)| mapping)
            .filter(|mapping| mapping.contains(start))
            .ok_or(SyscallError::InvalidArgument)?;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= mapping.end())
            .ok_or(SyscallError::InvalidArgument)?;

        let first = ((start - mapping.start.as_u64()) / PAGE_SIZE) as usize;
        let last = ((end - mapping.start.as_u64()) / PAGE_SIZE) as usize;
        let flags = protection_to_pagetable_flags(prot);
        for index in first..last {
            let page = mapping.page(index);
            if let Err(err) = self.page_tables.set_permissions(page, flags) {
                panic!("tracked page {:?} missing from page tables: {}", page, err);
            }
            mapping.protections[index] = prot;
        }

        Ok(())
    }

    /// Picks the virtual start of a new region: the hint if it is usable,
    /// otherwise the first gap at or above the bump pointer. The flag tells
    /// whether the hint was taken.
    fn place(&self, hint: Option<VirtAddr>, length: u64) -> Option<(VirtAddr, bool)> {
        if let Some(hint) = hint {
            if self.is_free_range(hint.as_u64(), length) {
                return Some((hint, true));
            }
            debug!("ignoring mmap hint {:#X}", hint.as_u64());
        }

        let mut candidate = self.next_mmap_address;
        for mapping in self.mappings.values() {
            if mapping.end() <= candidate {
                continue;
            }
            if mapping.start.as_u64() >= candidate.checked_add(length)? {
                break;
            }
            candidate = mapping.end();
        }

        let end = candidate.checked_add(length)?;
        (end <= END_MMAP_ADDRESS).then(|| (VirtAddr::new(candidate), false))
    }

    fn is_free_range(&self, start: u64, length: u64) -> bool {
        let Some(end) = start.checked_add(length) else {
            return false;
        };
        if start % PAGE_SIZE != 0 || start < START_MMAP_ADDRESS || end > END_MMAP_ADDRESS {
            return false;
        }

        match self.mappings.range(..end).next_back() {
            Some((_, mapping)) => mapping.end() <= start,
            None => true,
        }
    }

    fn unmap_page(&mut self, page: Page<Size4KiB>) {
        if let Err(err) = self.page_tables.unmap(page) {
            panic!("tracked page {:?} missing from page tables: {}", page, err);
        }
    }

    fn release_frames(&mut self, base: usize, count: usize) {
        match self.frames.free(base, count) {
            Ok(()) => {}
            Err(err @ FrameAllocError::DoubleFree { .. }) => {
                panic!("frame bitmap corrupted: {}", err)
            }
            Err(err) => panic!("mapping references unmanaged frames: {}", err),
        }
    }
}
