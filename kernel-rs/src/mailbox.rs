//! The videocore property mailbox. The kernel only asks it one
//! question: how much RAM the board has.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, WriteOnly};

use crate::arm;
use crate::kalloc::Kmem;
use crate::lock::SpinLock;
use crate::memlayout::{v2p, MAILBOX_BASE};
use crate::mmu::PGSIZE;

const MPI_TAG_GET_ARM_MEMORY: u32 = 0x0001_0005;
const MPI_REQUEST: u32 = 0;

/// Property channel.
const CHANNEL: u32 = 8;

const STATUS_FULL: u32 = 0x8000_0000;
const STATUS_EMPTY: u32 = 0x4000_0000;

register_structs! {
    MailboxRegs {
        (0x00 => read: ReadOnly<u32>),
        (0x04 => _reserved_0),
        (0x18 => status: ReadOnly<u32>),
        (0x1c => _reserved_1),
        (0x20 => write: WriteOnly<u32>),
        (0x24 => @END),
    }
}

fn regs() -> &'static MailboxRegs {
    unsafe { &*(MAILBOX_BASE as *const MailboxRegs) }
}

fn write_buffer(kva: usize) {
    // The GPU sees the buffer through its own window; hand it a bus
    // address, after making sure the data has left the cache.
    let bus = (v2p(kva) | 0xc000_0000) as u32;
    arm::flush_dcache(kva, kva + PGSIZE);
    let m = regs();
    while m.status.get() & STATUS_FULL != 0 {}
    m.write.set((bus & 0xffff_fff0) | CHANNEL);
}

fn read_response() -> u32 {
    let m = regs();
    loop {
        while m.status.get() & STATUS_EMPTY != 0 {}
        let x = m.read.get();
        if x & 0xf == CHANNEL {
            return x & 0xffff_fff0;
        }
    }
}

/// Asks the firmware for the ARM memory span; returns its size in
/// bytes. Needs one scratch page for the property buffer.
pub fn arm_memory_size(allocator: &SpinLock<Kmem>) -> usize {
    let mut page = allocator.lock().alloc().expect("mailbox: out of memory");
    page.write_bytes(0);

    {
        let buf = unsafe { &mut *(page.addr() as *mut [u32; 8]) };
        buf[0] = 8 * 4; // total size
        buf[1] = MPI_REQUEST;
        buf[2] = MPI_TAG_GET_ARM_MEMORY;
        buf[3] = 8; // value buffer size
        buf[4] = 0; // request length
        buf[5] = 0; // base
        buf[6] = 0; // size
        buf[7] = 0; // end tag
    }

    write_buffer(page.addr());
    let _ = read_response();

    let buf = unsafe { &*(page.addr() as *const [u32; 8]) };
    assert_eq!(buf[1], 0x8000_0000, "mailbox: request failed");
    let size = buf[6] as usize;

    allocator.lock().free(page);
    size
}
