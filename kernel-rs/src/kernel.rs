//! The kernel singleton and the boot sequence.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::console::Console;
use crate::file::{FileTable, ICache};
use crate::kalloc::Kmem;
use crate::lock::SpinLock;
use crate::memlayout::{p2v, PHYSTART};
use crate::printer::Printer;
use crate::proc::Procs;
use crate::vm;

/// The kernel.
static KERNEL: Kernel = Kernel::new();

/// After boot the kernel is safe to access immutably from anywhere.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

pub struct Kernel {
    panicked: AtomicBool,

    /// The monotonic clock-tick counter and its lock; sleepers wait on
    /// the counter's address.
    pub ticks: SpinLock<u32>,

    pub printer: SpinLock<Printer>,

    /// Physical page allocator.
    pub kmem: SpinLock<Kmem>,

    /// Process system.
    pub procs: Procs,

    pub ftable: FileTable,

    pub icache: ICache,

    pub console: Console,
}

impl Kernel {
    const fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            ticks: SpinLock::new("time", 0),
            printer: SpinLock::new("printer", Printer::new()),
            kmem: SpinLock::new("kmem", Kmem::new()),
            procs: Procs::new(),
            ftable: FileTable::new(),
            icache: ICache::new(),
            console: Console::new(),
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Prints the formatted string through the printer. A panicking
    /// kernel bypasses the lock so the report always gets out.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut printer = self.printer.lock();
            printer.write_fmt(args)
        }
    }
}

/// The wait token `sys_sleep` and the timer agree on: the address of
/// the tick counter.
pub fn ticks_chan() -> usize {
    &KERNEL.ticks as *const _ as usize
}

/// print! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*)).unwrap();
    };
}

/// println! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic by reporting and freezing the machine.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    println!("{}", info);

    loop {
        core::hint::spin_loop();
    }
}

/// First address after the kernel image, provided by the linker script.
#[cfg(target_arch = "arm")]
fn kernel_end() -> usize {
    extern "C" {
        static mut end: [u8; 0];
    }
    unsafe { core::ptr::addr_of!(end) as usize }
}

#[cfg(not(target_arch = "arm"))]
fn kernel_end() -> usize {
    p2v(0x8000)
}

/// The boot entry assembly jumps here with the MMU running on the
/// bootstrap tables.
///
/// # Safety
///
/// Called exactly once, on the boot core.
#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    unsafe { vm::mmu_init_stage1() };

    crate::uart::uart_init();
    crate::arm::dsb_barrier();
    println!();
    println!("av6 kernel is booting");

    // Collect some free space (8 MiB) for imminent use; the physical
    // space below 0x8000 is reserved for the page directory and the
    // boot stack.
    let kmem = &kernel().kmem;
    unsafe {
        kmem.lock()
            .freerange(kernel_end(), p2v(PHYSTART + 8 * 1024 * 1024))
    };

    let pm_size = crate::mailbox::arm_memory_size(kmem);
    println!("ARM memory is {:#x}", pm_size);

    unsafe { vm::kvmalloc(pm_size, kmem) };
    unsafe { crate::trap::tv_init(kmem) };

    // The rest of RAM, now that its size is known.
    unsafe {
        kmem.lock()
            .freerange(p2v(PHYSTART + 8 * 1024 * 1024), p2v(PHYSTART + pm_size))
    };

    kernel().procs.userinit(kmem);

    crate::timer::timer_init();
    crate::trap::enable_intrs();

    unsafe { kernel().procs.scheduler() }
}
