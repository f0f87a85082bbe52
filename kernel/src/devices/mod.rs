//! Device access. Only the COM1 serial port is driven so far; it carries
//! every log line the kernel writes.

pub mod serial;
