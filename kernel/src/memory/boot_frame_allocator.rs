use arrayvec::ArrayVec;
use limine::memory_map::EntryType;
use limine::response::MemoryMapResponse;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::constants::memory::{FRAME_SIZE, MAX_MEMORY_REGIONS, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// One entry of the bootloader-supplied physical memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }

    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Reserved,
        }
    }

    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Indices of the frames lying entirely inside this region.
    pub fn whole_frames(&self) -> core::ops::Range<usize> {
        let first = self.base.div_ceil(PAGE_SIZE) as usize;
        let last = (self.end() / PAGE_SIZE) as usize;
        first..last.max(first)
    }
}

pub type MemoryMap = ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>;

/// Copies the Limine memory map into a fixed-size list. Only `USABLE`
/// entries may ever be handed out; everything else is reserved.
pub fn boot_memory_map(response: &MemoryMapResponse) -> MemoryMap {
    let mut regions = MemoryMap::new();
    for entry in response.entries().iter() {
        let region = if entry.entry_type == EntryType::USABLE {
            MemoryRegion::usable(entry.base, entry.length)
        } else {
            MemoryRegion::reserved(entry.base, entry.length)
        };
        if regions.try_push(region).is_err() {
            log::warn!("memory map truncated at {} entries", MAX_MEMORY_REGIONS);
            break;
        }
    }
    regions
}

/// Bump allocator used until the heap exists and the bitmap can be built.
pub struct BootIntoFrameAllocator<'a> {
    regions: &'a [MemoryRegion],
    next: usize,
}

impl<'a> BootIntoFrameAllocator<'a> {
    pub fn new(regions: &'a [MemoryRegion]) -> Self {
        BootIntoFrameAllocator { regions, next: 0 }
    }

    pub fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + 'a {
        let regions: &'a [MemoryRegion] = self.regions;
        let usable_regions = regions.iter().filter(|r| r.kind == RegionKind::Usable);
        let frame_indices = usable_regions.flat_map(|r| r.whole_frames());
        frame_indices
            .map(|index| PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64)))
    }

    /// Every frame handed out so far, in allocation order.
    pub fn allocated_frames(&self) -> impl Iterator<Item = PhysFrame> + 'a {
        self.usable_frames().take(self.next)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootIntoFrameAllocator<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next)?;
        self.next += 1;
        Some(frame)
    }
}
