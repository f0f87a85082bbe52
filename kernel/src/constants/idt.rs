//! Interrupt vectors.

/// Wakes a core halted in a blocking syscall.
pub const WAKE_VECTOR: u8 = 0x40;
pub const APIC_ERROR_VECTOR: u8 = 0xFE;
pub const SPURIOUS_VECTOR: u8 = 0xFF;
