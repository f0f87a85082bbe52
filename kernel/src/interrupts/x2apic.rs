//! Local APIC access in x2APIC mode, through MSRs.

use raw_cpuid::CpuId;
use x86_64::registers::model_specific::Msr;

use crate::constants::idt::{APIC_ERROR_VECTOR, SPURIOUS_VECTOR};

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_EN: u64 = 1 << 11;
const APIC_EXTD: u64 = 1 << 10;

const X2APIC_TPR: u32 = 0x808;
const X2APIC_EOI: u32 = 0x80B;
const X2APIC_SVR: u32 = 0x80F;
const X2APIC_ICR: u32 = 0x830;
const X2APIC_LVT_TIMER: u32 = 0x832;
const X2APIC_LVT_ERROR: u32 = 0x837;

const SVR_SOFTWARE_ENABLE: u64 = 1 << 8;
const LVT_MASKED: u64 = 1 << 16;

/// Switches the calling core's APIC into x2APIC mode and software-enables
/// it. The timer stays masked; the only interrupts expected are wake IPIs.
pub fn init_x2apic() {
    let has_x2apic = CpuId::new()
        .get_feature_info()
        .is_some_and(|info| info.has_x2apic());
    assert!(has_x2apic, "x2APIC not supported on this CPU");

    unsafe {
        let mut base = Msr::new(IA32_APIC_BASE);
        let value = base.read();
        base.write(value | APIC_EN | APIC_EXTD);

        Msr::new(X2APIC_LVT_TIMER).write(LVT_MASKED);
        Msr::new(X2APIC_LVT_ERROR).write(u64::from(APIC_ERROR_VECTOR));
        Msr::new(X2APIC_TPR).write(0);
        Msr::new(X2APIC_SVR).write(SVR_SOFTWARE_ENABLE | u64::from(SPURIOUS_VECTOR));
    }
}

/// Signal end-of-interrupt
pub fn send_eoi() {
    unsafe { Msr::new(X2APIC_EOI).write(0) };
}

/// Sends fixed interrupt `vector` to the core with x2APIC id `target_cpu`.
pub fn send_ipi(vector: u8, target_cpu: u32) {
    // physical destination, fixed delivery, edge triggered
    let command = (u64::from(target_cpu) << 32) | u64::from(vector);
    unsafe { Msr::new(X2APIC_ICR).write(command) };
}
