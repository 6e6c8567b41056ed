//! Trap handling: vector installation, per-mode stacks, and the
//! dispatcher every exception funnels into.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::arm::{self, PSR_MASK, PSR_MODE_USR};
use crate::kalloc::Kmem;
use crate::kernel::kernel;
use crate::lock::SpinLock;
use crate::memlayout::INT_REGS_BASE;
use crate::mmu::{HVECTORS, PGSIZE};
use crate::println;
use crate::proc::{my_proc, CurrentProc, TrapFrame};
use crate::syscall::syscall;
use crate::timer;
use crate::uart;
use crate::vector::{set_mode_sp, vectors_addr, VECTORS_WORDS};

/// Trap numbers, chosen not to overlap processor-defined exception or
/// interrupt codes.
pub const T_UND: usize = 0x01;
pub const T_PABT: usize = 0x02;
pub const T_DABT: usize = 0x04;
pub const T_SYSCALL: usize = 0x40;
pub const T_IRQ: usize = 0x80;

/// System timer bit in pending/enable register 0.
pub const IRQ_TIMER_BIT: u32 = 3;

/// Mini-UART bit in pending/enable register 0 (routed through AUX).
pub const IRQ_MINIUART_BIT: u32 = 29;

register_structs! {
    /// BCM2835 interrupt controller.
    pub IntCtrlRegs {
        (0x00 => irq_basic_pending: ReadOnly<u32>),
        (0x04 => irq_pending: [ReadOnly<u32>; 2]),
        (0x0c => fiq_control: ReadWrite<u32>),
        (0x10 => irq_enable: [ReadWrite<u32>; 2]),
        (0x18 => irq_basic_enable: ReadWrite<u32>),
        (0x1c => irq_disable: [ReadWrite<u32>; 2]),
        (0x24 => irq_basic_disable: ReadWrite<u32>),
        (0x28 => @END),
    }
}

pub struct IntCtrl {
    base: usize,
}

impl core::ops::Deref for IntCtrl {
    type Target = IntCtrlRegs;

    fn deref(&self) -> &Self::Target {
        unsafe { &*(self.base as *const IntCtrlRegs) }
    }
}

pub static INT_CTRL: IntCtrl = IntCtrl {
    base: INT_REGS_BASE,
};

impl IntCtrl {
    fn any_pending(&self) -> bool {
        self.irq_pending[0].get() != 0
            || self.irq_pending[1].get() != 0
            || self.irq_basic_pending.get() != 0
    }

    fn pending0(&self) -> u32 {
        self.irq_pending[0].get()
    }

    /// Unmask a source in pending/enable register 0.
    pub fn enable0(&self, bit: u32) {
        self.irq_enable[0].set(self.irq_enable[0].get() | 1 << bit);
    }
}

/// Enables interrupts from the sources the kernel uses: the mini-UART
/// (through AUX) and the basic ARM timer.
pub fn enable_intrs() {
    INT_CTRL.enable0(IRQ_MINIUART_BIT);
    INT_CTRL
        .irq_basic_enable
        .set(INT_CTRL.irq_basic_enable.get() | 1);
}

/// Disables IRQ and FIQ delivery from every source and device.
pub fn disable_intrs() {
    INT_CTRL.irq_disable[0].set(0);
    INT_CTRL.irq_disable[1].set(0);
    INT_CTRL.irq_basic_disable.set(0);
    INT_CTRL.fiq_control.set(0);
}

/// The CPSR mode-and-mask words `tv_init` hands to `set_mode_sp`: each
/// privileged mode that can take an exception gets a 4 KiB stack, with
/// IRQ and FIQ masked in that mode.
const MODE_STACKS: [usize; 6] = [
    0xd1, // fiq
    0xd2, // irq
    0xdb, // undefined
    0xd7, // abort
    0xd6, // secure monitor
    0xdf, // system
];

/// Installs the exception vectors at `HVECTORS` and gives every
/// privileged mode its stack.
///
/// # Safety
///
/// Must run once at boot, after `kvmalloc` mapped the vector page.
pub unsafe fn tv_init(allocator: &SpinLock<Kmem>) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            vectors_addr() as *const u32,
            HVECTORS as *mut u32,
            VECTORS_WORDS,
        );
    }
    arm::dsb_barrier();
    arm::flush_idcache();

    for cpsr_c in MODE_STACKS {
        let mut page = allocator.lock().alloc().expect("tv_init: out of memory");
        page.write_bytes(0);
        let top = page.into_usize() + PGSIZE;
        unsafe { set_mode_sp(top, cpsr_c) };
    }
    arm::dsb_barrier();
}

/// Prints the register state a trap captured.
fn trap_oops(tf: &TrapFrame) {
    println!(
        "trapno: {:#x}, spsr: {:#x}, sp: {:#x}, pc: {:#x} cpsr: {:#x} ifar: {:#x}",
        tf.trapno, tf.spsr, tf.sp, tf.pc, tf.cpsr, tf.ifar
    );
    println!(
        "saved registers: r0: {:#x}, r1: {:#x}, r2: {:#x}, r3: {:#x}, r4: {:#x}, r5: {:#x}",
        tf.r0, tf.r1, tf.r2, tf.r3, tf.r4, tf.r5
    );
    println!(
        "more registers: r6: {:#x}, r7: {:#x}, r8: {:#x}, r9: {:#x}, r10: {:#x}, r11: {:#x}, r12: {:#x}",
        tf.r6, tf.r7, tf.r8, tf.r9, tf.r10, tf.r11, tf.r12
    );
}

/// Drains every pending interrupt source. Returns whether one of them
/// was the system timer.
fn handle_irq() -> bool {
    let mut istimer = false;
    while INT_CTRL.any_pending() {
        if INT_CTRL.pending0() & (1 << IRQ_TIMER_BIT) != 0 {
            istimer = true;
            timer::timer_tick();
        }
        if INT_CTRL.pending0() & (1 << IRQ_MINIUART_BIT) != 0 {
            uart::uart_rx();
        }
    }
    istimer
}

/// A trap that is neither a system call nor a recognized interrupt: in
/// the kernel it is our own mistake and fatal; in user space the
/// process misbehaved and is marked for death.
fn handle_bad_trap(tf: &TrapFrame, curr: Option<&CurrentProc<'_>>) {
    let from_user = tf.spsr & PSR_MASK == PSR_MODE_USR;
    match curr {
        Some(curr) if from_user => {
            println!(
                "pid {} {}: trap {:#x} addr {:#x} spsr {:#x} cpsr {:#x} ifar {:#x}--kill proc",
                curr.pid(),
                curr.data().name_str(),
                tf.trapno,
                tf.pc,
                tf.spsr,
                tf.cpsr,
                tf.ifar
            );
            curr.set_killed();
        }
        _ => {
            trap_oops(tf);
            panic!("trap");
        }
    }
}

/// The dispatcher every exception stub calls.
#[no_mangle]
pub unsafe extern "C" fn trap(tf: &mut TrapFrame) {
    if tf.trapno == T_SYSCALL {
        // SAFETY: only one CurrentProc exists on this stack.
        let mut curr = unsafe { my_proc() }.expect("syscall with no process");
        if curr.killed() {
            kernel().procs.exit(&mut curr);
        }
        curr.data_mut().tf = tf;
        syscall(&mut curr);
        if curr.killed() {
            kernel().procs.exit(&mut curr);
        }
        return;
    }

    let mut istimer = false;
    match tf.trapno {
        T_IRQ => istimer = handle_irq(),
        _ => {
            // SAFETY: as above.
            let curr = unsafe { my_proc() };
            handle_bad_trap(tf, curr.as_ref());
        }
    }

    // Force the process to give up the CPU on a clock tick, and force
    // it off entirely if it has been killed and is headed back to user
    // space; a killed process still inside a system call gets to reach
    // the regular return first.
    // SAFETY: the earlier CurrentProc values are gone.
    if let Some(mut curr) = unsafe { my_proc() } {
        let from_user = tf.spsr & PSR_MASK == PSR_MODE_USR;
        if curr.killed() && from_user {
            kernel().procs.exit(&mut curr);
        }
        if istimer {
            kernel().procs.yield_if_running(curr.idx());
        }
        if curr.killed() && from_user {
            kernel().procs.exit(&mut curr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_numbers_are_distinct() {
        let nums = [T_UND, T_PABT, T_DABT, T_SYSCALL, T_IRQ];
        for (i, a) in nums.iter().enumerate() {
            for b in &nums[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn controller_register_offsets() {
        // The BCM2835 block is 0x28 bytes; a wrong layout would shift
        // every register behind it.
        assert_eq!(core::mem::size_of::<IntCtrlRegs>(), 0x28);
    }
}
