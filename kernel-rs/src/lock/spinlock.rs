//! Interrupt-masking mutual exclusion.
//!
//! The lock guards data against interrupt handlers, not against other
//! CPUs: acquisition disables IRQs and there is nothing to spin on.
//! With interrupts masked while any lock is held, a held lock can only
//! be seen at `acquire` through re-entrancy, which panics.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};
use crate::cpu::{Cpu, CPUS};

/// The interrupt-masking raw lock.
pub struct RawSpinlock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    /// Is the lock held?
    locked: AtomicBool,

    /// The cpu holding the lock. Written only while the lock is held.
    cpu: Cell<*mut Cpu>,
}

/// Locks that mask interrupts while held.
pub type SpinLock<T> = Lock<RawSpinlock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            cpu: Cell::new(ptr::null_mut()),
        }
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.get() == CPUS.current()
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock.
        unsafe { CPUS.push_off() };
        assert!(!self.holding(), "acquire {}", self.name);

        // On a single CPU with interrupts now off, a set `locked` means
        // re-entrancy rather than contention, so there is no spin.
        assert!(
            !self.locked.swap(true, Ordering::Acquire),
            "acquire {}",
            self.name
        );

        // Record info about lock acquisition for holding().
        self.cpu.set(CPUS.current());
    }

    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.cpu.set(ptr::null_mut());
        self.locked.store(false, Ordering::Release);
        unsafe { CPUS.pop_off() };
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm;

    #[test]
    fn lock_unlock() {
        let lk = SpinLock::new("t", 7u32);
        {
            let mut g = lk.lock();
            *g += 1;
        }
        assert_eq!(*lk.lock(), 8);
    }

    #[test]
    fn lock_masks_interrupts() {
        unsafe { arm::intr_on() };
        let lk = SpinLock::new("t", ());
        let g = lk.lock();
        assert!(!arm::intr_get());
        drop(g);
        assert!(arm::intr_get());
        arm::intr_off();
    }

    #[test]
    fn nested_locks_restore_on_last_release() {
        unsafe { arm::intr_on() };
        let a = SpinLock::new("a", ());
        let b = SpinLock::new("b", ());
        let ga = a.lock();
        let gb = b.lock();
        drop(gb);
        assert!(!arm::intr_get());
        drop(ga);
        assert!(arm::intr_get());
        arm::intr_off();
    }

    #[test]
    fn initially_masked_stays_masked() {
        arm::intr_off();
        let lk = SpinLock::new("t", ());
        drop(lk.lock());
        assert!(!arm::intr_get());
    }

    #[test]
    #[should_panic(expected = "acquire reent")]
    fn reentrant_acquire_panics() {
        let lk = SpinLock::new("reent", ());
        let _g = lk.lock();
        lk.lock.acquire();
    }

    #[test]
    fn reacquire_after_releases_in_between() {
        unsafe { arm::intr_on() };
        let lk = SpinLock::new("t", 1u32);
        let mut g = lk.lock();
        let was_enabled = g.reacquire_after(arm::intr_get);
        assert!(was_enabled);
        assert!(!arm::intr_get());
        drop(g);
        arm::intr_off();
    }
}
