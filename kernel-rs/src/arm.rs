//! ARMv7 instructions and system-register accessors.
//!
//! Off the target, the IRQ flag is modeled by a plain boolean so the
//! interrupt-nesting and lock logic stays exercisable by host tests; the
//! barrier and cache-maintenance calls become no-ops.

// Dead code is allowed in this file because not all wrappers are used in
// every configuration.
#![allow(dead_code)]

use cfg_if::cfg_if;

pub const PSR_MODE_USR: usize = 0x10;
pub const PSR_MODE_FIQ: usize = 0x11;
pub const PSR_MODE_IRQ: usize = 0x12;
pub const PSR_MODE_SVC: usize = 0x13;
pub const PSR_MODE_MON: usize = 0x16;
pub const PSR_MODE_ABT: usize = 0x17;
pub const PSR_MODE_UND: usize = 0x1b;
pub const PSR_MODE_SYS: usize = 0x1f;
pub const PSR_MASK: usize = 0x1f;

pub const PSR_DISABLE_IRQ: usize = 0x80;
pub const PSR_DISABLE_FIQ: usize = 0x40;

cfg_if! {
    if #[cfg(target_arch = "arm")] {
        use core::arch::asm;

        /// Read the current program status register.
        #[inline]
        pub fn read_cpsr() -> usize {
            let x: usize;
            unsafe { asm!("mrs {}, cpsr", out(reg) x) };
            x
        }

        /// Enable device interrupts (IRQ).
        ///
        /// # Safety
        ///
        /// Interrupt handlers must be set properly.
        #[inline]
        pub unsafe fn intr_on() {
            unsafe { asm!("cpsie i") };
        }

        /// Disable device interrupts (IRQ).
        #[inline]
        pub fn intr_off() {
            // SAFETY: turning interrupts off is always safe.
            unsafe { asm!("cpsid i") };
        }

        /// Are device interrupts (IRQ) enabled?
        #[inline]
        pub fn intr_get() -> bool {
            read_cpsr() & PSR_DISABLE_IRQ == 0
        }

        /// Data synchronization barrier.
        #[inline]
        pub fn dsb_barrier() {
            unsafe { asm!("dsb") };
        }

        /// Instruction synchronization barrier.
        #[inline]
        pub fn isb() {
            unsafe { asm!("isb") };
        }

        /// Invalidate the instruction cache and branch predictor.
        pub fn flush_idcache() {
            unsafe {
                asm!(
                    "mcr p15, 0, {tmp}, c7, c5, 0", // ICIALLU
                    "mcr p15, 0, {tmp}, c7, c5, 6", // BPIALL
                    "dsb",
                    "isb",
                    tmp = in(reg) 0usize,
                );
            }
        }

        /// Invalidate the entire unified TLB.
        pub fn flush_tlb() {
            unsafe {
                asm!(
                    "mcr p15, 0, {tmp}, c8, c7, 0", // TLBIALL
                    "dsb",
                    "isb",
                    tmp = in(reg) 0usize,
                );
            }
        }

        /// Clean the data cache for `[va1, va2)` to the point of
        /// coherency, by cache line.
        pub fn flush_dcache(va1: usize, va2: usize) {
            const CACHE_LINE_SIZE: usize = 32;
            let mut va = va1 & !(CACHE_LINE_SIZE - 1);
            while va < va2 {
                unsafe { asm!("mcr p15, 0, {}, c7, c10, 1", in(reg) va) }; // DCCMVAC
                va += CACHE_LINE_SIZE;
            }
            dsb_barrier();
        }

        /// Install a new translation-table base.
        ///
        /// # Safety
        ///
        /// `pa` must be the physical address of a valid, 16 KiB-aligned
        /// first-level table that maps the currently executing code.
        pub unsafe fn set_pgtbase(pa: usize) {
            unsafe { asm!("mcr p15, 0, {}, c2, c0, 0", in(reg) pa) }; // TTBR0
            isb();
        }

        /// Read the instruction fault address register.
        #[inline]
        pub fn read_ifar() -> usize {
            let x: usize;
            unsafe { asm!("mrc p15, 0, {}, c6, c0, 2", out(reg) x) };
            x
        }
    } else {
        // Host build: model the IRQ-enable flag so the push_off/pop_off
        // and spinlock state machines can run under `cargo test`. Tests
        // run on many threads, so the flag is per-thread there.

        cfg_if! {
            if #[cfg(test)] {
                use std::cell::Cell;

                std::thread_local! {
                    static IRQ_ENABLED: Cell<bool> = const { Cell::new(false) };
                }

                fn irq_flag() -> bool {
                    IRQ_ENABLED.with(|f| f.get())
                }

                fn set_irq_flag(on: bool) {
                    IRQ_ENABLED.with(|f| f.set(on));
                }
            } else {
                use core::sync::atomic::{AtomicBool, Ordering};

                static IRQ_ENABLED: AtomicBool = AtomicBool::new(false);

                fn irq_flag() -> bool {
                    IRQ_ENABLED.load(Ordering::Relaxed)
                }

                fn set_irq_flag(on: bool) {
                    IRQ_ENABLED.store(on, Ordering::Relaxed);
                }
            }
        }

        pub fn read_cpsr() -> usize {
            let irq = if irq_flag() { 0 } else { PSR_DISABLE_IRQ };
            PSR_MODE_SVC | irq
        }

        pub unsafe fn intr_on() {
            set_irq_flag(true);
        }

        pub fn intr_off() {
            set_irq_flag(false);
        }

        pub fn intr_get() -> bool {
            irq_flag()
        }

        pub fn dsb_barrier() {}
        pub fn isb() {}
        pub fn flush_idcache() {}
        pub fn flush_tlb() {}
        pub fn flush_dcache(_va1: usize, _va2: usize) {}

        pub unsafe fn set_pgtbase(_pa: usize) {
            unreachable!("set_pgtbase runs only on the target");
        }

        pub fn read_ifar() -> usize {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_flag_roundtrip() {
        intr_off();
        assert!(!intr_get());
        assert!(read_cpsr() & PSR_DISABLE_IRQ != 0);
        unsafe { intr_on() };
        assert!(intr_get());
        intr_off();
    }
}
