use core::fmt;

use log::debug;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};

use super::{
    bitmap::{BitmapError, PhysicalFrameBitmap},
    boot_frame_allocator::{MemoryRegion, RegionKind},
    frame_at, frame_index,
};
use crate::constants::memory::FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocError {
    /// No run of free frames is long enough.
    NotFound,
    /// The frame was already free.
    DoubleFree { frame: usize },
    OutOfRange { index: usize, frame_count: usize },
}

impl From<BitmapError> for FrameAllocError {
    fn from(err: BitmapError) -> Self {
        match err {
            BitmapError::OutOfRange { index, frame_count } => {
                FrameAllocError::OutOfRange { index, frame_count }
            }
        }
    }
}

impl fmt::Display for FrameAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameAllocError::NotFound => write!(f, "no contiguous run of free frames"),
            FrameAllocError::DoubleFree { frame } => write!(f, "frame {} is already free", frame),
            FrameAllocError::OutOfRange { index, frame_count } => {
                write!(f, "frame {} outside {} managed frames", index, frame_count)
            }
        }
    }
}

/// First-fit allocator of contiguous physical frames.
///
/// Callers must serialize access: the scan and the marking that follows it
/// are only atomic when done under the kernel memory lock.
pub struct BitmapFrameAllocator {
    bitmap: PhysicalFrameBitmap,
    free_frames: usize,
}

impl BitmapFrameAllocator {
    /// An allocator over `frame_count` frames, all free.
    pub fn new(frame_count: usize) -> Self {
        Self {
            bitmap: PhysicalFrameBitmap::new(frame_count, false),
            free_frames: frame_count,
        }
    }

    /// Builds the bitmap from the boot memory map.
    ///
    /// Every frame starts out allocated. Whole frames inside usable regions
    /// are then released, and `reserved_frames` (frames handed out before the
    /// bitmap existed) are marked allocated again.
    pub fn init(
        memory_map: &[MemoryRegion],
        reserved_frames: impl Iterator<Item = PhysFrame>,
    ) -> Self {
        // get the total number of frames (top of usable memory)
        let top = memory_map
            .iter()
            .filter(|r| r.kind == RegionKind::Usable)
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0);
        let total_frames = (top as usize).div_ceil(FRAME_SIZE);

        debug!(
            "top of physmem is {:#X}, tracking {} frames",
            top, total_frames
        );

        let mut allocator = Self {
            bitmap: PhysicalFrameBitmap::new(total_frames, true),
            free_frames: 0,
        };

        for region in memory_map.iter().filter(|r| r.kind == RegionKind::Usable) {
            debug!(
                "usable region {:#X}, size is {:#X}",
                region.base, region.length
            );
            for index in region.whole_frames() {
                allocator.mark(index, false);
            }
        }

        for frame in reserved_frames {
            allocator.mark(frame_index(frame), true);
        }

        debug!("{} frames free after boot", allocator.free_frames);
        allocator
    }

    fn mark(&mut self, index: usize, allocated: bool) {
        match self.bitmap.get(index) {
            Ok(current) if current == allocated => {}
            Ok(_) => {
                if let Err(err) = self.bitmap.set(index, allocated) {
                    panic!("bitmap corrupted during init: {}", err);
                }
                if allocated {
                    self.free_frames -= 1;
                } else {
                    self.free_frames += 1;
                }
            }
            Err(err) => panic!("boot memory map outside managed memory: {}", err),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.frame_count()
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn bitmap(&self) -> &PhysicalFrameBitmap {
        &self.bitmap
    }

    pub fn is_used(&self, index: usize) -> Result<bool, FrameAllocError> {
        Ok(self.bitmap.get(index)?)
    }

    pub fn is_frame_used(&self, frame: PhysFrame) -> Result<bool, FrameAllocError> {
        self.is_used(frame_index(frame))
    }

    /// Finds the lowest run of `count` free frames, marks it allocated and
    /// returns the index of its first frame.
    pub fn allocate_contiguous(&mut self, count: usize) -> Result<usize, FrameAllocError> {
        if count == 0 || count > self.free_frames {
            return Err(FrameAllocError::NotFound);
        }

        let mut run = 0;
        for index in 0..self.bitmap.frame_count() {
            if self.bitmap.get(index)? {
                run = 0;
                continue;
            }

            run += 1;
            if run == count {
                let base = index + 1 - count;
                for frame in base..=index {
                    self.bitmap.set(frame, true)?;
                }
                self.free_frames -= count;
                return Ok(base);
            }
        }

        Err(FrameAllocError::NotFound)
    }

    /// Releases `[base, base + count)`. The whole range is checked before any
    /// bit changes, so a failed call leaves the bitmap untouched.
    pub fn free(&mut self, base: usize, count: usize) -> Result<(), FrameAllocError> {
        let frame_count = self.bitmap.frame_count();
        let end = base
            .checked_add(count)
            .filter(|&end| end <= frame_count)
            .ok_or(FrameAllocError::OutOfRange {
                index: base.saturating_add(count).saturating_sub(1),
                frame_count,
            })?;

        for frame in base..end {
            if !self.bitmap.get(frame)? {
                return Err(FrameAllocError::DoubleFree { frame });
            }
        }

        for frame in base..end {
            self.bitmap.set(frame, false)?;
        }
        self.free_frames += count;
        Ok(())
    }
}

/// Single frames for page-table pages, taken first-fit from the same bitmap.
unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate_contiguous(1).ok().map(frame_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn bits(allocator: &BitmapFrameAllocator) -> Vec<bool> {
        (0..allocator.total_frames())
            .map(|i| allocator.is_used(i).unwrap())
            .collect()
    }

    #[test]
    fn test_first_fit_from_frame_zero() {
        let mut allocator = BitmapFrameAllocator::new(8);

        assert_eq!(allocator.allocate_contiguous(3), Ok(0));
        assert_eq!(
            bits(&allocator),
            [true, true, true, false, false, false, false, false]
        );
        assert_eq!(allocator.free_frames(), 5);
    }

    #[test]
    fn test_backing_bytes_follow_allocations() {
        let mut allocator = BitmapFrameAllocator::new(12);
        allocator.allocate_contiguous(3).unwrap();
        allocator.allocate_contiguous(7).unwrap();
        allocator.free(1, 1).unwrap();

        let bitmap = allocator.bitmap();
        assert_eq!(bitmap.frame_count(), 12);
        assert_eq!(bitmap.as_bytes(), &[0b1111_1101, 0b0000_0011]);
    }

    #[test]
    fn test_oversized_request_leaves_bitmap_unchanged() {
        let mut allocator = BitmapFrameAllocator::new(8);
        allocator.allocate_contiguous(3).unwrap();
        let before = bits(&allocator);

        assert_eq!(
            allocator.allocate_contiguous(6),
            Err(FrameAllocError::NotFound)
        );
        assert_eq!(bits(&allocator), before);
        assert_eq!(allocator.free_frames(), 5);
    }

    #[test]
    fn test_run_counter_resets_on_allocated_frame() {
        let mut allocator = BitmapFrameAllocator::new(10);
        allocator.allocate_contiguous(10).unwrap();
        // holes: [1, 2] and [4, 5, 6]
        allocator.free(1, 2).unwrap();
        allocator.free(4, 3).unwrap();

        assert_eq!(allocator.allocate_contiguous(3), Ok(4));
        assert_eq!(allocator.allocate_contiguous(2), Ok(1));
        assert_eq!(
            allocator.allocate_contiguous(1),
            Err(FrameAllocError::NotFound)
        );
    }

    #[test]
    fn test_zero_length_request() {
        let mut allocator = BitmapFrameAllocator::new(4);
        assert_eq!(
            allocator.allocate_contiguous(0),
            Err(FrameAllocError::NotFound)
        );
    }

    #[test]
    fn test_free_restores_previous_pattern() {
        let mut allocator = BitmapFrameAllocator::new(32);
        allocator.allocate_contiguous(5).unwrap();
        allocator.free(2, 1).unwrap();
        let before = bits(&allocator);

        let base = allocator.allocate_contiguous(7).unwrap();
        assert!(bits(&allocator)[base..base + 7].iter().all(|&b| b));

        allocator.free(base, 7).unwrap();
        assert_eq!(bits(&allocator), before);
        assert_eq!(allocator.free_frames(), 28);
    }

    #[test]
    fn test_double_free_leaves_bitmap_unchanged() {
        let mut allocator = BitmapFrameAllocator::new(8);
        allocator.allocate_contiguous(4).unwrap();
        allocator.free(2, 1).unwrap();
        let before = bits(&allocator);

        assert_eq!(
            allocator.free(0, 4),
            Err(FrameAllocError::DoubleFree { frame: 2 })
        );
        assert_eq!(bits(&allocator), before);
        assert_eq!(allocator.free_frames(), 5);
    }

    #[test]
    fn test_free_past_end_is_out_of_range() {
        let mut allocator = BitmapFrameAllocator::new(8);
        allocator.allocate_contiguous(8).unwrap();

        assert!(matches!(
            allocator.free(6, 3),
            Err(FrameAllocError::OutOfRange { frame_count: 8, .. })
        ));
        assert!(matches!(
            allocator.free(usize::MAX, 2),
            Err(FrameAllocError::OutOfRange { .. })
        ));
        assert!(bits(&allocator).iter().all(|&b| b));
    }

    #[test]
    fn test_init_from_memory_map() {
        let regions = [
            MemoryRegion::reserved(0x0, 0x1000),
            MemoryRegion::usable(0x1000, 0x4000),
            MemoryRegion::reserved(0x5000, 0x1000),
            // partial frames on both ends stay allocated
            MemoryRegion::usable(0x6800, 0x2000),
        ];
        let boot_frame = frame_at(2);
        let allocator = BitmapFrameAllocator::init(&regions, core::iter::once(boot_frame));

        assert_eq!(allocator.total_frames(), 9);
        assert_eq!(
            bits(&allocator),
            [true, false, true, false, false, true, true, false, true]
        );
        assert_eq!(allocator.free_frames(), 4);
        assert_eq!(allocator.is_frame_used(boot_frame), Ok(true));
    }

    #[test]
    fn test_page_table_frames_come_from_bitmap() {
        let mut allocator = BitmapFrameAllocator::new(2);

        assert_eq!(allocator.allocate_frame(), Some(frame_at(0)));
        assert_eq!(allocator.allocate_frame(), Some(frame_at(1)));
        assert_eq!(allocator.allocate_frame(), None);
    }
}
