//! Return-value convention at the syscall boundary.
//!
//! A syscall returns one machine word. Read as a signed value, anything in
//! `(-ERRNO_BAND, 0)` is a negated error code; every other value, including
//! addresses that look negative, is a successful result. Inside the kernel
//! results stay `Result<u64, SyscallError>` and are only squeezed into this
//! form by [`encode`].

use core::fmt;

use crate::{
    constants::syscalls::ERRNO_BAND,
    memory::bitmap_frame_allocator::FrameAllocError,
    sync::SyncError,
};

/// Success sentinel for syscalls that produce no value.
pub const ESUCCESS: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Bad size, alignment, address, permission or argument.
    InvalidArgument,
    /// No sufficient contiguous run of frames or virtual space.
    OutOfMemory,
    OutOfRange,
    DoubleFree,
    /// Unknown mutex or semaphore handle.
    InvalidId,
    NotOwner,
    NotLocked,
    /// Destroy while locked or while waiters are queued.
    ResourceBusy,
}

impl SyscallError {
    pub const fn code(self) -> u64 {
        match self {
            SyscallError::NotOwner => 1,
            SyscallError::InvalidId => 2,
            SyscallError::OutOfMemory => 12,
            SyscallError::DoubleFree => 14,
            SyscallError::ResourceBusy => 16,
            SyscallError::InvalidArgument => 22,
            SyscallError::OutOfRange => 34,
            SyscallError::NotLocked => 37,
        }
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(SyscallError::NotOwner),
            2 => Some(SyscallError::InvalidId),
            12 => Some(SyscallError::OutOfMemory),
            14 => Some(SyscallError::DoubleFree),
            16 => Some(SyscallError::ResourceBusy),
            22 => Some(SyscallError::InvalidArgument),
            34 => Some(SyscallError::OutOfRange),
            37 => Some(SyscallError::NotLocked),
            _ => None,
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::InvalidArgument => write!(f, "invalid argument"),
            SyscallError::OutOfMemory => write!(f, "out of memory"),
            SyscallError::OutOfRange => write!(f, "frame index out of range"),
            SyscallError::DoubleFree => write!(f, "frame already free"),
            SyscallError::InvalidId => write!(f, "invalid id"),
            SyscallError::NotOwner => write!(f, "not the owner"),
            SyscallError::NotLocked => write!(f, "not locked"),
            SyscallError::ResourceBusy => write!(f, "resource busy"),
        }
    }
}

impl From<FrameAllocError> for SyscallError {
    fn from(err: FrameAllocError) -> Self {
        match err {
            FrameAllocError::NotFound => SyscallError::OutOfMemory,
            FrameAllocError::DoubleFree { .. } => SyscallError::DoubleFree,
            FrameAllocError::OutOfRange { .. } => SyscallError::OutOfRange,
        }
    }
}

impl From<SyncError> for SyscallError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidArgument => SyscallError::InvalidArgument,
            SyncError::InvalidId => SyscallError::InvalidId,
            SyncError::NotOwner => SyscallError::NotOwner,
            SyncError::NotLocked => SyscallError::NotLocked,
            SyncError::ResourceBusy => SyscallError::ResourceBusy,
        }
    }
}

/// Flattens a syscall result into the raw return word.
pub fn encode(result: Result<u64, SyscallError>) -> u64 {
    match result {
        Ok(value) => value,
        Err(err) => (err.code() as i64).wrapping_neg() as u64,
    }
}

/// Splits a raw return word into a value or a positive error code.
pub fn decode(raw: u64) -> Result<u64, u64> {
    let signed = raw as i64;
    if signed > -ERRNO_BAND && signed < 0 {
        Err(signed.unsigned_abs())
    } else {
        Ok(raw)
    }
}
