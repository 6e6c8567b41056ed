//! The BCM2835 system timer: free-running counter with four compare
//! registers, of which channel 3 drives the scheduler tick.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::kernel::{kernel, ticks_chan};
use crate::memlayout::TIMER_REGS_BASE;
use crate::trap::{INT_CTRL, IRQ_TIMER_BIT};

/// Counter increments between interrupts: 100 ticks a second on the
/// 1 MHz timer clock.
const TIMER_FREQ: u32 = 10_000;

register_structs! {
    TimerRegs {
        (0x00 => control_status: ReadWrite<u32>),
        (0x04 => counter_lo: ReadOnly<u32>),
        (0x08 => counter_hi: ReadOnly<u32>),
        (0x0c => compare: [ReadWrite<u32>; 4]),
        (0x1c => @END),
    }
}

fn regs() -> &'static TimerRegs {
    unsafe { &*(TIMER_REGS_BASE as *const TimerRegs) }
}

/// Arms compare channel 3 one period ahead and unmasks its interrupt.
pub fn timer_init() {
    INT_CTRL.enable0(IRQ_TIMER_BIT);
    let t = regs();
    t.compare[3].set(t.counter_lo.get().wrapping_add(TIMER_FREQ));
}

/// The timer interrupt: acknowledge, advance the tick counter, wake
/// sleepers, re-arm.
pub fn timer_tick() {
    let t = regs();
    t.control_status.set(1 << IRQ_TIMER_BIT);

    {
        let mut ticks = kernel().ticks.lock();
        *ticks = ticks.wrapping_add(1);
    }
    kernel().procs.wakeup(ticks_chan());

    t.compare[3].set(t.counter_lo.get().wrapping_add(TIMER_FREQ));
}

/// Busy-waits for `us` microseconds on the free-running counter.
#[cfg(target_arch = "arm")]
pub fn delay(us: u32) {
    if us == 0 {
        return;
    }
    let t = regs();
    let until = t.counter_lo.get().wrapping_add(us);
    while t.counter_lo.get() != until {}
}

#[cfg(not(target_arch = "arm"))]
pub fn delay(_us: u32) {}
