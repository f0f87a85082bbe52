// Syscall numbers
pub const SYSCALL_MMAP: u64 = 4;
pub const SYSCALL_MUNMAP: u64 = 6;
pub const SYSCALL_MPROTECT: u64 = 7;
pub const SYSCALL_MUTEX_CREATE: u64 = 8;
pub const SYSCALL_MUTEX_ACQUIRE: u64 = 9;
pub const SYSCALL_MUTEX_RELEASE: u64 = 10;
pub const SYSCALL_MUTEX_DESTROY: u64 = 11;
pub const SYSCALL_SEM_CREATE: u64 = 12;
pub const SYSCALL_SEM_ACQUIRE: u64 = 13;
pub const SYSCALL_SEM_RELEASE: u64 = 14;
pub const SYSCALL_SEM_DESTROY: u64 = 15;

// Mmap
pub const START_MMAP_ADDRESS: u64 = 0x0900_0000_0000;
pub const END_MMAP_ADDRESS: u64 = 0x7000_0000_0000;

/// Raw return values in `(-ERRNO_BAND, 0)` are negated error codes.
pub const ERRNO_BAND: i64 = 100;
