//! Per-CPU state.
//!
//! The machine boots exactly one core; `current` is the fixed index-0
//! lookup of the uniprocessor design. Under host tests each test thread
//! gets a `Cpu` of its own so the interrupt-nesting state does not race.

use core::cell::UnsafeCell;
use core::ptr;

use array_macro::array;

use crate::arm::{intr_get, intr_off, intr_on};
use crate::param::NCPU;
use crate::proc::Context;

pub static CPUS: Cpus = Cpus::new();

// The `Cpu` struct of the current cpu can be mutated through a shared
// reference to `Cpus`, so it needs interior mutability.
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

// SAFETY: only the boot core ever runs, and it accesses its own slot.
unsafe impl Sync for Cpus {}

/// Per-CPU state.
pub struct Cpu {
    /// Index of the process running on this cpu, if any.
    pub proc: Option<usize>,

    /// swtch() here to enter scheduler().
    pub scheduler: *mut Context,

    /// Depth of push_off() nesting.
    pub noff: i32,

    /// Were interrupts enabled before the outermost push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            scheduler: ptr::null_mut(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

impl Cpus {
    const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    /// Return this CPU's cpu struct.
    #[cfg(not(test))]
    pub fn current(&self) -> *mut Cpu {
        self.0[cpu_id()].get()
    }

    /// Host tests run on several threads at once; give each its own Cpu
    /// so push_off nesting stays coherent per thread.
    #[cfg(test)]
    pub fn current(&self) -> *mut Cpu {
        use std::cell::UnsafeCell;

        std::thread_local! {
            static CPU: UnsafeCell<Cpu> = UnsafeCell::new(Cpu::new());
        }
        CPU.with(|c| c.get())
    }

    /// push_off/pop_off are like intr_off()/intr_on() except that they
    /// are matched: it takes two pop_off()s to undo two push_off()s.
    /// Also, if interrupts are initially off, then push_off, pop_off
    /// leaves them off.
    ///
    /// # Safety
    ///
    /// Every push_off() must be balanced by a pop_off() on the same CPU.
    pub unsafe fn push_off(&self) {
        let old = intr_get();
        intr_off();
        let cpu = unsafe { &mut *self.current() };
        if cpu.noff == 0 {
            cpu.interrupt_enabled = old;
        }
        cpu.noff += 1;
    }

    /// pop_off() should be paired with push_off().
    ///
    /// # Safety
    ///
    /// See push_off().
    pub unsafe fn pop_off(&self) {
        assert!(!intr_get(), "pop_off - interruptible");
        let cpu = unsafe { &mut *self.current() };
        cpu.noff -= 1;
        assert!(cpu.noff >= 0, "pop_off");
        if cpu.noff == 0 && cpu.interrupt_enabled {
            // SAFETY: the outermost critical section just ended.
            unsafe { intr_on() };
        }
    }
}

/// Which core is this? The boot shim parks all but core 0.
pub fn cpu_id() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm;

    fn noff() -> i32 {
        unsafe { (*CPUS.current()).noff }
    }

    #[test]
    fn push_pop_balance() {
        unsafe { arm::intr_on() };
        unsafe { CPUS.push_off() };
        assert_eq!(noff(), 1);
        assert!(!arm::intr_get());
        unsafe { CPUS.push_off() };
        assert_eq!(noff(), 2);
        unsafe { CPUS.pop_off() };
        assert!(!arm::intr_get());
        unsafe { CPUS.pop_off() };
        assert_eq!(noff(), 0);
        assert!(arm::intr_get());
        arm::intr_off();
    }

    #[test]
    fn fuzzed_nesting_restores_iff_balanced() {
        // Deterministic xorshift; no external dependencies in tests.
        let mut state = 0x2545_f491u32;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        for initial in [false, true] {
            for _ in 0..100 {
                if initial {
                    unsafe { arm::intr_on() };
                } else {
                    arm::intr_off();
                }
                let depth = rand() % 8 + 1;
                for _ in 0..depth {
                    unsafe { CPUS.push_off() };
                    assert!(!arm::intr_get());
                }
                for _ in 0..depth {
                    unsafe { CPUS.pop_off() };
                }
                assert_eq!(noff(), 0);
                // At depth zero the IRQ state equals the state captured
                // at the outermost push_off.
                assert_eq!(arm::intr_get(), initial);
            }
        }
        arm::intr_off();
    }
}
