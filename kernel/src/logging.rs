//! Kernel logging over the serial port.
//!
//! Library code logs through the `log` macros. Nothing is printed until the
//! bootstrap core installs [`LOGGER`], so hosted unit tests run silent.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::sync::scheduler::current_core_id;

pub static LOGGER: Logger = Logger::new();

/// Writes one `[LEVEL core N] message` line per record. The lock keeps lines
/// from different cores from interleaving.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let core = current_core_id();
            let _guard = self.inner.lock();
            crate::serial_println!("[{} core {}] {}", record.level(), core, record.args());
        }
    }

    fn flush(&self) {}
}

/// Debug builds log allocator and sync traffic; release builds only
/// report boot progress and warnings.
pub const fn max_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs the serial logger. Only the bootstrap core (`cpu_id == 0`) does
/// anything; a second install is a boot bug.
pub fn init(cpu_id: u32) {
    if cpu_id == 0 {
        log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(max_level()))
            .expect("Logger initialization failed");
    }
}
