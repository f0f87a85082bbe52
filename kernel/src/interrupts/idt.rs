use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::{
    constants::idt::{APIC_ERROR_VECTOR, SPURIOUS_VECTOR, WAKE_VECTOR},
    interrupts::x2apic,
};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt[WAKE_VECTOR].set_handler_fn(wake_handler);
        idt[APIC_ERROR_VECTOR].set_handler_fn(apic_error_handler);
        idt[SPURIOUS_VECTOR].set_handler_fn(spurious_handler);
        idt
    };
}

/// Loads the IDT for the specified CPU core.
pub fn init_idt(_cpu_id: u32) {
    IDT.load();
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let faulting_address = x86_64::registers::control::Cr2::read_raw();
    panic!(
        "EXCEPTION: PAGE FAULT at {:#X} ({:?})\n{:#?}",
        faulting_address, error_code, stack_frame
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT ({:#X})\n{:#?}",
        error_code, stack_frame
    );
}

/// The halted core resumes after `hlt` and rechecks its permit; there is
/// nothing else to do here.
extern "x86-interrupt" fn wake_handler(_: InterruptStackFrame) {
    x2apic::send_eoi();
}

extern "x86-interrupt" fn apic_error_handler(_: InterruptStackFrame) {
    log::warn!("local APIC error");
    x2apic::send_eoi();
}

extern "x86-interrupt" fn spurious_handler(_: InterruptStackFrame) {}
