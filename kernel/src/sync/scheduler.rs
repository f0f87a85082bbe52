use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::warn;
use raw_cpuid::CpuId;

use super::{Scheduler, ThreadId};
use crate::constants::MAX_CORES;

/// x2APIC id of the executing core, falling back to the 8-bit initial APIC
/// id on CPUs without topology enumeration.
pub fn current_core_id() -> u32 {
    let cpuid = CpuId::new();
    if let Some(mut levels) = cpuid.get_extended_topology_info() {
        if let Some(level) = levels.next() {
            return level.x2apic_id();
        }
    }
    cpuid
        .get_feature_info()
        .map_or(0, |info| u32::from(info.initial_local_apic_id()))
}

/// Never a real APIC id; it is the x2APIC broadcast destination.
const NO_CORE: u32 = u32::MAX;

/// Dense slot numbers for the sparse APIC ids of the running cores.
pub struct CoreSlots {
    ids: [AtomicU32; MAX_CORES],
}

impl Default for CoreSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreSlots {
    pub const fn new() -> Self {
        Self {
            ids: [const { AtomicU32::new(NO_CORE) }; MAX_CORES],
        }
    }

    pub fn find(&self, apic_id: u32) -> Option<usize> {
        self.ids
            .iter()
            .position(|id| id.load(Ordering::Acquire) == apic_id)
    }

    /// The slot of `apic_id`, taking a free one on first use. Only the core
    /// with that id claims for it, so an id never lands in two slots.
    pub fn claim(&self, apic_id: u32) -> Option<usize> {
        if apic_id == NO_CORE {
            return None;
        }
        self.find(apic_id).or_else(|| {
            self.ids.iter().position(|id| {
                id.compare_exchange(NO_CORE, apic_id, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
        })
    }
}

/// Treats every core as one thread of control, named by its APIC id. A
/// suspended core halts until a wake permit is posted for it; the poster
/// then interrupts it with a wake IPI.
pub struct CoreScheduler {
    slots: CoreSlots,
    permits: [AtomicBool; MAX_CORES],
}

impl Default for CoreScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreScheduler {
    pub const fn new() -> Self {
        Self {
            slots: CoreSlots::new(),
            permits: [const { AtomicBool::new(false) }; MAX_CORES],
        }
    }

    /// Gives the calling core a slot ahead of its first syscall.
    pub fn register_current(&self) -> Option<usize> {
        self.slots.claim(current_core_id())
    }

    fn suspend_core(&self, apic_id: u32) {
        let Some(slot) = self.slots.claim(apic_id) else {
            panic!("core {} found no scheduler slot ({} slots)", apic_id, MAX_CORES);
        };
        wait_for_permit(&self.permits[slot]);
    }

    fn resume_core(&self, apic_id: u32) {
        let Some(slot) = self.slots.find(apic_id) else {
            warn!("resume for core {} which never ran a syscall", apic_id);
            return;
        };
        self.permits[slot].store(true, Ordering::Release);
        wake(apic_id);
    }
}

impl Scheduler for CoreScheduler {
    fn current(&self) -> ThreadId {
        ThreadId(u64::from(current_core_id()))
    }

    fn suspend_current(&self) {
        self.suspend_core(current_core_id());
    }

    fn resume(&self, thread: ThreadId) {
        match u32::try_from(thread.0) {
            Ok(apic_id) => self.resume_core(apic_id),
            Err(_) => warn!("resume for thread {} which is not a core", thread.0),
        }
    }
}

#[cfg(target_os = "none")]
fn wait_for_permit(permit: &AtomicBool) {
    use x86_64::instructions::interrupts;

    loop {
        interrupts::disable();
        if permit.swap(false, Ordering::AcqRel) {
            interrupts::enable();
            return;
        }
        // sti only takes effect once hlt has started, so a wake IPI sent
        // after the check above still ends the halt
        interrupts::enable_and_hlt();
    }
}

#[cfg(not(target_os = "none"))]
fn wait_for_permit(permit: &AtomicBool) {
    while !permit.swap(false, Ordering::AcqRel) {
        core::hint::spin_loop();
    }
}

#[cfg(target_os = "none")]
fn wake(apic_id: u32) {
    use crate::{constants::idt::WAKE_VECTOR, interrupts::x2apic};

    x2apic::send_ipi(WAKE_VECTOR, apic_id);
}

#[cfg(not(target_os = "none"))]
fn wake(_apic_id: u32) {}
