#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
extern crate alloc;

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod kernel_state;
pub mod logging;
pub mod memory;
pub mod sync;
pub mod syscalls;

#[cfg(target_os = "none")]
pub mod init;
#[cfg(target_os = "none")]
pub mod interrupts;

#[cfg(test)]
mod testing;

pub use devices::serial;
pub use kernel_state::Kernel;

pub mod prelude {
    pub use crate::serial_print;
    pub use crate::serial_println;
}

pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}
