//! Just enough interrupt handling for cores to halt and be woken: an IDT
//! with fault handlers and the wake vector, and the local x2APIC.

pub mod idt;
pub mod x2apic;

/// Loads the IDT and enables the local APIC on the calling core, then
/// unmasks interrupts.
pub fn init(cpu_id: u32) {
    idt::init_idt(cpu_id);
    x2apic::init_x2apic();
    x86_64::instructions::interrupts::enable();
}
