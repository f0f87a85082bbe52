use log::debug;
use x86_64::VirtAddr;

use super::{
    abi::{self, SyscallError, ESUCCESS},
    mmap::ProtFlags,
};
use crate::{
    constants::syscalls::{
        SYSCALL_MMAP, SYSCALL_MPROTECT, SYSCALL_MUNMAP, SYSCALL_MUTEX_ACQUIRE,
        SYSCALL_MUTEX_CREATE, SYSCALL_MUTEX_DESTROY, SYSCALL_MUTEX_RELEASE, SYSCALL_SEM_ACQUIRE,
        SYSCALL_SEM_CREATE, SYSCALL_SEM_DESTROY, SYSCALL_SEM_RELEASE,
    },
    memory::paging::PageTableManager,
    sync::Scheduler,
    Kernel,
};

/// Runs syscall `number` for the current thread and returns the raw result
/// word. On failure the thread's error cell receives the error code.
pub fn dispatch_syscall<P, S>(
    kernel: &Kernel<P, S>,
    number: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
) -> u64
where
    P: PageTableManager,
    S: Scheduler,
{
    let result = match number {
        SYSCALL_MMAP => sys_mmap(kernel, arg1, arg2, arg3),
        SYSCALL_MUNMAP => sys_munmap(kernel, arg1, arg2),
        SYSCALL_MPROTECT => sys_mprotect(kernel, arg1, arg2, arg3),
        SYSCALL_MUTEX_CREATE => Ok(kernel.mutex_create()),
        SYSCALL_MUTEX_ACQUIRE => done(kernel.mutex_acquire(arg1)),
        SYSCALL_MUTEX_RELEASE => done(kernel.mutex_release(arg1)),
        SYSCALL_MUTEX_DESTROY => done(kernel.mutex_destroy(arg1)),
        SYSCALL_SEM_CREATE => kernel.semaphore_create(arg1).map_err(SyscallError::from),
        SYSCALL_SEM_ACQUIRE => done(kernel.semaphore_acquire(arg1)),
        SYSCALL_SEM_RELEASE => done(kernel.semaphore_release(arg1)),
        SYSCALL_SEM_DESTROY => done(kernel.semaphore_destroy(arg1)),
        _ => {
            debug!("unknown syscall {}", number);
            Err(SyscallError::InvalidArgument)
        }
    };

    if let Err(err) = result {
        debug!("syscall {} failed: {}", number, err);
        kernel.record_error(kernel.scheduler().current(), err);
    }
    abi::encode(result)
}

fn done<E>(result: Result<(), E>) -> Result<u64, SyscallError>
where
    SyscallError: From<E>,
{
    result.map(|()| ESUCCESS).map_err(SyscallError::from)
}

fn user_addr(addr: u64) -> Result<VirtAddr, SyscallError> {
    VirtAddr::try_new(addr).map_err(|_| SyscallError::InvalidArgument)
}

fn prot_flags(bits: u64) -> Result<ProtFlags, SyscallError> {
    ProtFlags::from_bits(bits).ok_or(SyscallError::InvalidArgument)
}

fn sys_mmap<P: PageTableManager, S: Scheduler>(
    kernel: &Kernel<P, S>,
    size: u64,
    prot: u64,
    hint: u64,
) -> Result<u64, SyscallError> {
    // a hint that is not even a valid address is simply no hint
    let hint = VirtAddr::try_new(hint).ok().filter(|addr| !addr.is_null());
    kernel
        .mmap(size, prot_flags(prot)?, hint)
        .map(VirtAddr::as_u64)
}

fn sys_munmap<P: PageTableManager, S: Scheduler>(
    kernel: &Kernel<P, S>,
    addr: u64,
    size: u64,
) -> Result<u64, SyscallError> {
    done(kernel.munmap(user_addr(addr)?, size))
}

fn sys_mprotect<P: PageTableManager, S: Scheduler>(
    kernel: &Kernel<P, S>,
    addr: u64,
    size: u64,
    prot: u64,
) -> Result<u64, SyscallError> {
    done(kernel.mprotect(user_addr(addr)?, size, prot_flags(prot)?))
}
