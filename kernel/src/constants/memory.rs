pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

pub const HEAP_START: *mut u8 = 0xFFFF_FFFF_0000_0000 as *mut u8;
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MB

/// Frames tracked per bitmap byte.
pub const BITMAP_ENTRY_SIZE: usize = 8;
pub const FULL_BITMAP_ENTRY: u8 = 0xFF;

/// Upper bound on boot memory map entries we keep before the heap exists.
pub const MAX_MEMORY_REGIONS: usize = 128;
