//! System-wide constants and hardware-specific values.

/// Maximum number of CPU cores supported by the kernel. Cores past this are
/// left parked by the bootloader.
pub const MAX_CORES: usize = 16;

pub mod idt;
pub mod memory;
pub mod ports;
pub mod syscalls;
