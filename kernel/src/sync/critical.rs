//! Critical sections around the kernel's shared state.
//!
//! On bare metal a critical section disables interrupts on the local core
//! and takes a spinlock, so neither another core nor an interrupt handler on
//! this core can observe the guarded state half-updated. Hosted builds have
//! no interrupts to mask.

use spin::Mutex;

#[cfg(target_os = "none")]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(target_os = "none"))]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

/// Runs `f` on the data behind `lock` inside a critical section.
pub fn with_locked<T, F, R>(lock: &Mutex<T>, f: F) -> R
where
    F: FnOnce(&mut T) -> R,
{
    without_interrupts(|| {
        let mut guard = lock.lock();
        f(&mut guard)
    })
}
