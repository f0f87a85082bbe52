pub mod abi;
pub mod mmap;
pub mod syscall_handlers;
