//! Core bring-up: memory map, paging, heap and the kernel context on the
//! bootstrap core, then interrupts on every core.

use core::{
    hint::spin_loop,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use limine::{
    request::{HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker, SmpRequest},
    smp::{Cpu, RequestFlags},
    BaseRevision,
};
use log::{info, warn};
use spin::Once;
use x86_64::VirtAddr;

use crate::{
    constants::{memory::PAGE_SIZE, syscalls::*, MAX_CORES},
    idle_loop, interrupts, logging,
    memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        boot_frame_allocator::{boot_memory_map, BootIntoFrameAllocator},
        enable_no_execute, heap,
        paging::{self, KernelPageTables},
    },
    sync::scheduler::CoreScheduler,
    syscalls::{abi, mmap::ProtFlags, syscall_handlers::dispatch_syscall},
    Kernel,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static SMP_REQUEST: SmpRequest = SmpRequest::new().with_flags(RequestFlags::X2APIC);

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

pub type BootKernel = Kernel<KernelPageTables, CoreScheduler>;

static KERNEL: Once<BootKernel> = Once::new();

static BOOT_COMPLETE: AtomicBool = AtomicBool::new(false);
static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Mutex the first secondary core blocks on during the handoff check; 0 until
/// the bootstrap core holds it.
static HANDOFF_MUTEX: AtomicU64 = AtomicU64::new(0);
static HANDOFF_WAITER: AtomicBool = AtomicBool::new(false);
static HANDOFF_DONE: AtomicBool = AtomicBool::new(false);

pub fn init() -> &'static BootKernel {
    assert!(BASE_REVISION.is_supported());
    logging::init(0);
    info!("Booting BSP...");

    let memory_map_response = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");
    let hhdm_response = HHDM_REQUEST.get_response().expect("HHDM request failed");
    let hhdm_offset = VirtAddr::new(hhdm_response.offset());

    let regions = boot_memory_map(memory_map_response);
    unsafe { enable_no_execute() };
    let mut mapper = unsafe { paging::init(hhdm_offset) };

    // the bitmap lives on the heap, so the heap is mapped with boot frames first
    let mut boot_frames = BootIntoFrameAllocator::new(&regions);
    heap::init_heap(&mut mapper, &mut boot_frames).expect("Failed to initialize heap");
    let frames = BitmapFrameAllocator::init(&regions, boot_frames.allocated_frames());
    info!(
        "{} of {} frames free",
        frames.free_frames(),
        frames.total_frames()
    );

    let kernel = KERNEL.call_once(|| {
        Kernel::new(
            frames,
            KernelPageTables::new(mapper),
            CoreScheduler::new(),
        )
    });

    interrupts::init(0);
    kernel.scheduler().register_current();
    start_secondary_cores();
    kernel
}

fn start_secondary_cores() {
    let smp_response = SMP_REQUEST.get_response().expect("SMP request failed");
    let bsp_id = smp_response.bsp_lapic_id();
    info!("Detected {} CPU cores", smp_response.cpus().len());

    let mut started = 0;
    for cpu in smp_response.cpus() {
        if cpu.lapic_id == bsp_id {
            continue;
        }
        if started + 1 >= MAX_CORES {
            warn!("leaving core {} parked", cpu.lapic_id);
            continue;
        }
        cpu.goto_address.write(secondary_cpu_main);
        started += 1;
    }

    while CPU_COUNT.load(Ordering::SeqCst) < started {
        spin_loop();
    }

    BOOT_COMPLETE.store(true, Ordering::SeqCst);
    info!("All CPUs initialized");
}

#[no_mangle]
unsafe extern "C" fn secondary_cpu_main(cpu: &Cpu) -> ! {
    interrupts::init(cpu.id);
    let kernel = KERNEL.get().expect("kernel context missing on AP");
    kernel.scheduler().register_current();
    CPU_COUNT.fetch_add(1, Ordering::SeqCst);
    info!("AP {} initialized", cpu.lapic_id);

    while !BOOT_COMPLETE.load(Ordering::SeqCst) {
        spin_loop();
    }

    if !HANDOFF_WAITER.swap(true, Ordering::AcqRel) {
        wait_for_handoff(kernel);
    }
    idle_loop()
}

fn wait_for_handoff(kernel: &BootKernel) {
    let id = loop {
        match HANDOFF_MUTEX.load(Ordering::Acquire) {
            0 => spin_loop(),
            id => break id,
        }
    };

    // suspends this core until the bootstrap core releases
    let acquired = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_ACQUIRE, id, 0, 0));
    let released = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_RELEASE, id, 0, 0));
    info!("woke holding mutex {}: {:?}", id, [acquired, released]);
    HANDOFF_DONE.store(true, Ordering::Release);
}

/// Blocks a secondary core on a mutex held here, then releases it and waits
/// for that core to wake up owning it.
pub fn blocking_self_test(kernel: &BootKernel) {
    if CPU_COUNT.load(Ordering::SeqCst) == 0 {
        info!("single core, skipping the cross-core handoff");
        return;
    }
    let Ok(id) = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_CREATE, 0, 0, 0)) else {
        warn!("no mutex for the cross-core handoff");
        return;
    };
    let acquired = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_ACQUIRE, id, 0, 0));
    HANDOFF_MUTEX.store(id, Ordering::Release);

    while kernel.with_sync(|sync| sync.mutex(id).map_or(0, |mutex| mutex.waiters())) == 0 {
        spin_loop();
    }
    let released = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_RELEASE, id, 0, 0));

    while !HANDOFF_DONE.load(Ordering::Acquire) {
        spin_loop();
    }
    let destroyed = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_DESTROY, id, 0, 0));
    info!(
        "cross-core handoff of mutex {}: {:?}",
        id,
        [acquired, released, destroyed]
    );
}

/// Exercises every syscall once through the dispatcher and logs the results.
pub fn self_test(kernel: &BootKernel) {
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;

    let raw = dispatch_syscall(kernel, SYSCALL_MMAP, 2 * PAGE_SIZE, prot, 0);
    match abi::decode(raw) {
        Ok(addr) => {
            let ptr = addr as *mut u8;
            let value = unsafe {
                ptr.add(PAGE_SIZE as usize).write_volatile(0x5A);
                ptr.add(PAGE_SIZE as usize).read_volatile()
            };
            info!("mmap at {:#X}, read back {:#X}", addr, value);
            let backing = kernel.backing_frames(VirtAddr::new(addr));

            let read_only = ProtFlags::PROT_READ;
            let raw = dispatch_syscall(kernel, SYSCALL_MPROTECT, addr, PAGE_SIZE, read_only);
            info!("mprotect: {:?}", abi::decode(raw));
            let raw = dispatch_syscall(kernel, SYSCALL_MUNMAP, addr, 2 * PAGE_SIZE, 0);
            info!("munmap: {:?}", abi::decode(raw));

            // page-table frames taken by the mapping stay allocated
            if let Some(frames) = backing {
                let leaked = kernel.frames_still_used(frames);
                if leaked > 0 {
                    warn!("{} backing frames still allocated after munmap", leaked);
                }
            }
        }
        Err(code) => warn!("mmap failed with {}", code),
    }

    if let Ok(id) = abi::decode(dispatch_syscall(kernel, SYSCALL_MUTEX_CREATE, 0, 0, 0)) {
        let results = [
            dispatch_syscall(kernel, SYSCALL_MUTEX_ACQUIRE, id, 0, 0),
            dispatch_syscall(kernel, SYSCALL_MUTEX_RELEASE, id, 0, 0),
            dispatch_syscall(kernel, SYSCALL_MUTEX_DESTROY, id, 0, 0),
        ];
        info!("mutex {}: {:?}", id, results.map(abi::decode));
    }

    if let Ok(id) = abi::decode(dispatch_syscall(kernel, SYSCALL_SEM_CREATE, 1, 0, 0)) {
        let results = [
            dispatch_syscall(kernel, SYSCALL_SEM_ACQUIRE, id, 0, 0),
            dispatch_syscall(kernel, SYSCALL_SEM_RELEASE, id, 0, 0),
            dispatch_syscall(kernel, SYSCALL_SEM_DESTROY, id, 0, 0),
        ];
        info!("semaphore {}: {:?}", id, results.map(abi::decode));
    }
}
