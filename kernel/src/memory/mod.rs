pub mod bitmap;
pub mod bitmap_frame_allocator;
pub mod boot_frame_allocator;
#[cfg(target_os = "none")]
pub mod heap;
pub mod paging;

use x86_64::{
    registers::model_specific::{Efer, EferFlags},
    structures::paging::PhysFrame,
    PhysAddr,
};

use crate::constants::memory::FRAME_SIZE;

/// Index of `frame` in the physical frame bitmap.
pub fn frame_index(frame: PhysFrame) -> usize {
    frame.start_address().as_u64() as usize / FRAME_SIZE
}

/// The frame at bitmap position `index`.
pub fn frame_at(index: usize) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64))
}

/// Lets page mappings carry `NO_EXECUTE`.
///
/// # Safety
///
/// Must be done after enabling long mode + paging, in ring 0.
pub unsafe fn enable_no_execute() {
    Efer::update(|flags| {
        flags.insert(EferFlags::NO_EXECUTE_ENABLE);
    });
}
