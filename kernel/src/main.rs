#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use pagekernel::{idle_loop, init, serial_println};

#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn kmain() -> ! {
    let kernel = init::init();
    init::self_test(kernel);
    init::blocking_self_test(kernel);

    log::info!("BSP entering idle loop");
    idle_loop();
}

#[cfg(target_os = "none")]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}

// The kernel only boots on bare metal; hosted builds exist for unit tests.
#[cfg(not(target_os = "none"))]
fn main() {}
