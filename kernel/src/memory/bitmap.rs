//! Packed allocation bitmap over physical page frames.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (LSB first). A set bit
//! means the frame is allocated, a clear bit means it is free.

use alloc::{boxed::Box, vec};
use core::fmt;

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FULL_BITMAP_ENTRY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    OutOfRange { index: usize, frame_count: usize },
}

impl fmt::Display for BitmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapError::OutOfRange { index, frame_count } => {
                write!(f, "frame {} outside bitmap of {} frames", index, frame_count)
            }
        }
    }
}

pub struct PhysicalFrameBitmap {
    frame_count: usize,
    bytes: Box<[u8]>,
}

impl PhysicalFrameBitmap {
    /// Creates a bitmap covering `frame_count` frames, every frame starting
    /// out allocated (`true`) or free (`false`).
    pub fn new(frame_count: usize, allocated: bool) -> Self {
        let fill = if allocated { FULL_BITMAP_ENTRY } else { 0 };
        let bytes = vec![fill; frame_count.div_ceil(BITMAP_ENTRY_SIZE)].into_boxed_slice();

        Self { frame_count, bytes }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Raw backing bytes. Bits past `frame_count` in the last byte carry no meaning.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reads the bit for `index`. Returns true if the frame is allocated.
    pub fn get(&self, index: usize) -> Result<bool, BitmapError> {
        self.check(index)?;

        let byte_index = index / BITMAP_ENTRY_SIZE;
        let bit_index = index % BITMAP_ENTRY_SIZE;

        Ok((self.bytes[byte_index] >> bit_index) & 1 == 1)
    }

    /// Writes the bit for `index`.
    pub fn set(&mut self, index: usize, value: bool) -> Result<(), BitmapError> {
        self.check(index)?;

        let byte_index = index / BITMAP_ENTRY_SIZE;
        let bit_index = index % BITMAP_ENTRY_SIZE;

        let mask = 1 << bit_index;
        if value {
            self.bytes[byte_index] |= mask;
        } else {
            self.bytes[byte_index] &= !mask;
        }
        Ok(())
    }

    fn check(&self, index: usize) -> Result<(), BitmapError> {
        if index >= self.frame_count {
            return Err(BitmapError::OutOfRange {
                index,
                frame_count: self.frame_count,
            });
        }
        Ok(())
    }
}
