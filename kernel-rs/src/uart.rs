//! BCM2835 mini-UART, routed to GPIO 14/15 (alt function 5).
//!
//! Transmit is polled; receive is interrupt-driven and feeds the
//! console. Off the target the byte sink vanishes, so diagnostics in
//! host tests go nowhere instead of at a made-up MMIO window.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::console;
use crate::memlayout::{AUX_REGS_BASE, GPIO_REGS_BASE};

register_structs! {
    AuxRegs {
        (0x00 => irq: ReadOnly<u32>),
        (0x04 => enables: ReadWrite<u32>),
        (0x08 => _reserved_0),
        (0x40 => mu_io: ReadWrite<u32>),
        (0x44 => mu_ier: ReadWrite<u32>),
        (0x48 => mu_iir: ReadWrite<u32>),
        (0x4c => mu_lcr: ReadWrite<u32>),
        (0x50 => mu_mcr: ReadWrite<u32>),
        (0x54 => mu_lsr: ReadOnly<u32>),
        (0x58 => mu_msr: ReadOnly<u32>),
        (0x5c => mu_scratch: ReadWrite<u32>),
        (0x60 => mu_cntl: ReadWrite<u32>),
        (0x64 => mu_stat: ReadOnly<u32>),
        (0x68 => mu_baud: ReadWrite<u32>),
        (0x6c => @END),
    }
}

register_structs! {
    GpioRegs {
        (0x00 => fsel: [ReadWrite<u32>; 6]),
        (0x18 => _reserved_0),
        (0x94 => pud: ReadWrite<u32>),
        (0x98 => pudclk: [ReadWrite<u32>; 2]),
        (0xa0 => @END),
    }
}

#[cfg(target_arch = "arm")]
const LSR_TX_EMPTY: u32 = 0x20;
const LSR_RX_READY: u32 = 0x01;

fn aux() -> &'static AuxRegs {
    unsafe { &*(AUX_REGS_BASE as *const AuxRegs) }
}

fn gpio() -> &'static GpioRegs {
    unsafe { &*(GPIO_REGS_BASE as *const GpioRegs) }
}

/// Selects alternate function `func` for GPIO `pin`.
fn set_gpio_func(pin: usize, func: u32) {
    let sel = &gpio().fsel[pin / 10];
    let shift = (pin % 10) * 3;
    let mut data = sel.get();
    data &= !(7 << shift);
    data |= func << shift;
    sel.set(data);
}

/// Brings up the mini-UART: AUX enable, 8-bit, 115200 baud on the
/// stock clock, RX interrupt armed, pins 14/15 switched to alt 5 with
/// pull-up/down disabled.
pub fn uart_init() {
    let aux = aux();
    aux.enables.set(1);
    aux.mu_cntl.set(0);
    aux.mu_lcr.set(0x3);
    aux.mu_mcr.set(0);
    aux.mu_ier.set(0x1);
    aux.mu_iir.set(0xc7);
    aux.mu_baud.set(270);

    set_gpio_func(14, 2); // alt5: TXD1
    set_gpio_func(15, 2); // alt5: RXD1

    let gpio = gpio();
    gpio.pud.set(0);
    crate::timer::delay(10);
    gpio.pudclk[0].set((1 << 14) | (1 << 15));
    crate::timer::delay(10);
    gpio.pud.set(0);
    gpio.pudclk[0].set(0);

    aux.mu_cntl.set(3);
}

/// Writes one byte, polled; a LF gets a CR ahead of it.
#[cfg(target_arch = "arm")]
pub fn uart_putc(c: u8) {
    let aux = aux();
    if c == b'\n' {
        while aux.mu_lsr.get() & LSR_TX_EMPTY == 0 {}
        aux.mu_io.set(b'\r' as u32);
    }
    while aux.mu_lsr.get() & LSR_TX_EMPTY == 0 {}
    aux.mu_io.set(c as u32);
}

/// Host builds have no UART; bytes vanish.
#[cfg(not(target_arch = "arm"))]
pub fn uart_putc(_c: u8) {}

fn uart_getc() -> Option<u8> {
    let aux = aux();
    if aux.mu_lsr.get() & LSR_RX_READY != 0 {
        Some(aux.mu_io.get() as u8)
    } else {
        None
    }
}

/// The mini-UART interrupt: drain received bytes into the console.
pub fn uart_rx() {
    while let Some(c) = uart_getc() {
        console::console_intr(c);
    }
}
