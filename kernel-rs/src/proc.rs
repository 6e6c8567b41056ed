//! Processes, the process table and the scheduler.
//!
//! All lifecycle state (`state`, `pid`, `parent`, `channel`) lives in
//! one table behind the `ptable` spinlock; every transition and every
//! scan takes it. The rest of a PCB is private to its owner: the
//! running process itself, setup code while the slot is EMBRYO, or the
//! reaping parent once it is ZOMBIE. Cross-process references are slot
//! indices, never pointers.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::str;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use itertools::izip;
use static_assertions::const_assert_eq;

use crate::arm::intr_get;
use crate::cpu::CPUS;
use crate::file::{namei, RcFile, RcInode};
use crate::kalloc::Kmem;
use crate::kernel::kernel;
use crate::lock::{Guard, RawLock, SpinLock, SpinLockGuard};
use crate::mmu::PGSIZE;
use crate::page::Page;
use crate::param::{KSTACKSIZE, MAXPROCNAME, NOFILE, NPROC};
use crate::println;
use crate::vector::{swtch, trapret_addr};
use crate::vm::{switchkvm, switchuvm, PageDir};

/// Saved registers for kernel context switches. r0-r3 are caller-saved
/// under the ARM convention, so only the callee-saved set plus lr and
/// the resume pc are kept. A paused process's saved stack pointer is a
/// pointer to its `Context`, at the low end of its kernel stack frame;
/// the layout must match the `swtch` assembly.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub r4: usize,
    pub r5: usize,
    pub r6: usize,
    pub r7: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub lr: usize,
    pub pc: usize,
}

/// The trap frame built on the supervisor stack by the exception entry
/// stubs and consumed on return. Field order is the contract with that
/// assembly; do not reorder.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    /// User-mode stack pointer.
    pub sp: usize,
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r4: usize,
    pub r5: usize,
    pub r6: usize,
    pub r7: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub trapno: usize,
    /// Instruction fault address register.
    pub ifar: usize,
    /// CPSR while handling the trap.
    pub cpsr: usize,
    /// CPSR of the trapped mode.
    pub spsr: usize,
    /// Return address of the interrupted code.
    pub pc: usize,
}

const_assert_eq!(mem::size_of::<Context>(), 11 * mem::size_of::<usize>());
const_assert_eq!(mem::size_of::<TrapFrame>(), 21 * mem::size_of::<usize>());

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    fn as_str(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

pub type Pid = i32;

/// The lifecycle part of a PCB; the `ptable` lock must be held to read
/// or write any of it.
pub struct ProcInfo {
    pub state: ProcState,
    pub pid: Pid,
    /// Slot index of the parent, if any.
    pub parent: Option<usize>,
    /// If nonzero, sleeping on this wait token.
    pub channel: usize,
}

/// The owner-private part of a PCB.
pub struct ProcData {
    /// Bytes of user memory, page-aligned at quiescent points.
    pub sz: usize,
    /// This process's user page directory.
    pub pgdir: Option<PageDir>,
    /// The single kernel-stack page.
    pub kstack: Option<Page>,
    /// Trap frame at the top of the kernel stack.
    pub tf: *mut TrapFrame,
    /// swtch() here to run the process.
    pub context: *mut Context,
    /// Open files.
    pub ofile: [Option<RcFile>; NOFILE],
    /// Current directory.
    pub cwd: Option<RcInode>,
    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            sz: 0,
            pgdir: None,
            kstack: None,
            tf: ptr::null_mut(),
            context: ptr::null_mut(),
            ofile: array![_ => None; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }

    fn set_name(&mut self, name: &[u8]) {
        let n = core::cmp::min(name.len(), MAXPROCNAME - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n] = 0;
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(0);
        str::from_utf8(&self.name[..len]).unwrap_or("???")
    }
}

struct ProcShared {
    /// Set by kill(); the process dies at the next kernel-to-user
    /// boundary. Atomic so it needs no lock.
    killed: AtomicBool,
    data: UnsafeCell<ProcData>,
}

pub struct Ptable {
    pub procs: [ProcInfo; NPROC],
    nextpid: Pid,
    init_proc: Option<usize>,
}

/// The process system.
pub struct Procs {
    ptable: SpinLock<Ptable>,
    shared: [ProcShared; NPROC],
}

// SAFETY: ProcInfo is reached only through the ptable lock; ProcData
// only by the slot's owner.
unsafe impl Sync for Procs {}

/// A handle to the process currently running on this CPU.
///
/// Holding one certifies that the slot is RUNNING and owned by this
/// thread of control, so its `ProcData` is accessible without the lock.
pub struct CurrentProc<'s> {
    procs: &'s Procs,
    idx: usize,
}

impl CurrentProc<'_> {
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// The pid does not change while the process runs, so no lock.
    pub fn pid(&self) -> Pid {
        unsafe { (*self.procs.ptable.get_mut_raw()).procs[self.idx].pid }
    }

    pub fn killed(&self) -> bool {
        self.procs.shared[self.idx].killed.load(Ordering::Acquire)
    }

    pub fn set_killed(&self) {
        self.procs.shared[self.idx].killed.store(true, Ordering::Release);
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.procs.shared[self.idx].data.get() }
    }

    pub fn data_mut(&mut self) -> &mut ProcData {
        unsafe { &mut *self.procs.shared[self.idx].data.get() }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        unsafe { &*self.data().tf }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        unsafe { &mut *self.data().tf }
    }
}

/// Returns a handle to the current process, if any.
///
/// # Safety
///
/// At most one `CurrentProc` may be alive per thread of control;
/// otherwise two mutable paths to the same `ProcData` could exist.
pub unsafe fn my_proc() -> Option<CurrentProc<'static>> {
    unsafe { CPUS.push_off() };
    let idx = unsafe { (*CPUS.current()).proc };
    unsafe { CPUS.pop_off() };
    idx.map(|idx| CurrentProc {
        procs: &kernel().procs,
        idx,
    })
}

/// A user program that parks init in a sleep loop; without a disk
/// filesystem there is nothing to exec.
///   mov r0, #100
///   mov r7, #13      @ SYS_SLEEP
///   svc #0
///   b   0 <start>
/// od -t xC initcode
const INITCODE: [u8; 16] = [
    0x64, 0x00, 0xa0, 0xe3, 0x0d, 0x70, 0xa0, 0xe3, 0x00, 0x00, 0x00, 0xef, 0xfb, 0xff, 0xff, 0xea,
];

impl Procs {
    pub const fn new() -> Self {
        Self {
            ptable: SpinLock::new(
                "ptable",
                Ptable {
                    procs: array![_ => ProcInfo {
                        state: ProcState::Unused,
                        pid: 0,
                        parent: None,
                        channel: 0,
                    }; NPROC],
                    nextpid: 1,
                    init_proc: None,
                },
            ),
            shared: array![_ => ProcShared {
                killed: AtomicBool::new(false),
                data: UnsafeCell::new(ProcData::new()),
            }; NPROC],
        }
    }

    /// The wait token a process sleeps on when it waits for its own
    /// children; any unique address works.
    fn chan(&self, idx: usize) -> usize {
        &self.shared[idx] as *const _ as usize
    }

    fn data_raw(&self, idx: usize) -> *mut ProcData {
        self.shared[idx].data.get()
    }

    /// Finds an UNUSED slot and initializes the state required to run
    /// in the kernel: a fresh kernel stack whose top holds a trap frame
    /// and, below it, a context that resumes in `fork_return` and falls
    /// through to `trapret`.
    fn allocproc(&self, allocator: &SpinLock<Kmem>) -> Option<usize> {
        let mut ptable = self.ptable.lock();
        let idx = ptable
            .procs
            .iter()
            .position(|p| p.state == ProcState::Unused)?;
        ptable.procs[idx].state = ProcState::Embryo;
        ptable.procs[idx].pid = ptable.nextpid;
        ptable.nextpid += 1;
        drop(ptable);

        // The slot is EMBRYO: ours to set up, no lock needed.
        let data = unsafe { &mut *self.data_raw(idx) };
        let mut kstack = match allocator.lock().alloc() {
            Some(page) => page,
            None => {
                let mut ptable = self.ptable.lock();
                ptable.procs[idx].state = ProcState::Unused;
                ptable.procs[idx].pid = 0;
                return None;
            }
        };
        kstack.write_bytes(0);

        let mut sp = kstack.addr() + KSTACKSIZE;
        sp -= mem::size_of::<TrapFrame>();
        data.tf = sp as *mut TrapFrame;
        sp -= mem::size_of::<Context>();
        data.context = sp as *mut Context;
        unsafe {
            (*data.context).pc = fork_return as usize;
            (*data.context).lr = trapret_addr();
        }
        data.kstack = Some(kstack);
        Some(idx)
    }

    /// Sets up the first user process.
    pub fn userinit(&self, allocator: &SpinLock<Kmem>) {
        let idx = self.allocproc(allocator).expect("userinit: no proc slot");
        let data = unsafe { &mut *self.data_raw(idx) };

        let mut pgdir = PageDir::setupkvm(allocator).expect("userinit: out of memory?");
        pgdir.uvminit(&INITCODE, allocator);
        data.pgdir = Some(pgdir);
        data.sz = PGSIZE;

        // Prepare the very first "return" from kernel to user.
        unsafe {
            *data.tf = TrapFrame::default();
            (*data.tf).spsr = crate::arm::PSR_MODE_USR;
            (*data.tf).sp = PGSIZE;
            (*data.tf).pc = 0; // beginning of initcode
        }
        data.set_name(b"initcode");
        data.cwd = namei("/");

        let mut ptable = self.ptable.lock();
        ptable.init_proc = Some(idx);
        ptable.procs[idx].state = ProcState::Runnable;
    }

    /// Grows or shrinks the current process's memory by `n` bytes.
    pub fn growproc(
        &self,
        curr: &mut CurrentProc<'_>,
        n: i32,
        allocator: &SpinLock<Kmem>,
    ) -> Result<(), ()> {
        let data = curr.data_mut();
        let sz = data.sz;
        let pgdir = data.pgdir.as_mut().expect("growproc: no pgdir");
        let newsz = if n >= 0 {
            sz.checked_add(n as usize).ok_or(())?
        } else {
            sz.checked_sub(n.unsigned_abs() as usize).ok_or(())?
        };
        let sz = if n > 0 {
            pgdir.allocuvm(sz, newsz, allocator)?
        } else if n < 0 {
            pgdir.deallocuvm(sz, newsz, allocator)
        } else {
            sz
        };
        data.sz = sz;
        switchuvm(curr.data().pgdir.as_ref().expect("growproc: no pgdir"));
        Ok(())
    }

    /// Creates a new process as a duplicate of the caller. Returns the
    /// child's pid to the parent; the child's trap frame is set up to
    /// return 0 from the same system call.
    pub fn fork(
        &self,
        curr: &mut CurrentProc<'_>,
        allocator: &SpinLock<Kmem>,
    ) -> Result<Pid, ()> {
        let idx = self.allocproc(allocator).ok_or(())?;
        let child = unsafe { &mut *self.data_raw(idx) };

        // Copy user memory from parent to child.
        let sz = curr.data().sz;
        let parent_pgdir = curr.data_mut().pgdir.as_mut().expect("fork: no pgdir");
        match parent_pgdir.copyuvm(sz, allocator) {
            Ok(pgdir) => child.pgdir = Some(pgdir),
            Err(()) => {
                allocator.lock().free(child.kstack.take().expect("fork"));
                child.tf = ptr::null_mut();
                child.context = ptr::null_mut();
                let mut ptable = self.ptable.lock();
                ptable.procs[idx].state = ProcState::Unused;
                ptable.procs[idx].pid = 0;
                return Err(());
            }
        }
        child.sz = sz;

        // Same saved user registers, but r0 = 0 so the child returns
        // zero from fork.
        unsafe {
            *child.tf = *curr.trap_frame();
            (*child.tf).r0 = 0;
        }

        // Share the parent's open files and working directory.
        for (cf, pf) in izip!(child.ofile.iter_mut(), curr.data().ofile.iter()) {
            if let Some(f) = pf {
                *cf = Some(f.dup());
            }
        }
        child.cwd = curr.data().cwd.as_ref().map(|ip| ip.dup());
        let name = curr.data().name;
        child.set_name(&name);

        let mut ptable = self.ptable.lock();
        let pid = ptable.procs[idx].pid;
        ptable.procs[idx].parent = Some(curr.idx());
        ptable.procs[idx].state = ProcState::Runnable;
        Ok(pid)
    }

    /// Exits the current process. Never returns; the slot stays ZOMBIE
    /// until the parent calls wait().
    pub fn exit(&self, curr: &mut CurrentProc<'_>) -> ! {
        let init_idx = self.ptable.lock().init_proc.expect("exit: no init");
        assert_ne!(curr.idx(), init_idx, "init exiting");

        // Close all open files and drop the working directory.
        let data = curr.data_mut();
        for fd in 0..NOFILE {
            if let Some(f) = data.ofile[fd].take() {
                f.close();
            }
        }
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }

        let mut ptable = self.ptable.lock();

        // Parent might be sleeping in wait().
        if let Some(parent) = ptable.procs[curr.idx()].parent {
            let chan = self.chan(parent);
            Self::wakeup1(&mut ptable, chan);
        }

        // Pass abandoned children to init; init reaps any that are
        // already dead.
        let init_chan = self.chan(init_idx);
        for i in 0..NPROC {
            if ptable.procs[i].parent == Some(curr.idx()) {
                ptable.procs[i].parent = Some(init_idx);
                if ptable.procs[i].state == ProcState::Zombie {
                    Self::wakeup1(&mut ptable, init_chan);
                }
            }
        }

        // Jump into the scheduler, never to return.
        ptable.procs[curr.idx()].state = ProcState::Zombie;
        self.sched(&mut ptable, curr.idx());
        unreachable!("zombie exit");
    }

    /// Waits for a child to exit; reaps it and returns its pid, or
    /// fails if the caller has no children.
    pub fn wait(
        &self,
        curr: &mut CurrentProc<'_>,
        allocator: &SpinLock<Kmem>,
    ) -> Result<Pid, ()> {
        // Hold the table lock across the scan and the sleep so a child's
        // exit cannot slip between the decision to sleep and the sleep.
        let mut ptable = self.ptable.lock();
        loop {
            let mut havekids = false;
            for i in 0..NPROC {
                if ptable.procs[i].parent != Some(curr.idx()) {
                    continue;
                }
                havekids = true;
                if ptable.procs[i].state == ProcState::Zombie {
                    let pid = ptable.procs[i].pid;

                    // Reclaim everything the child owned.
                    let data = unsafe { &mut *self.data_raw(i) };
                    allocator.lock().free(data.kstack.take().expect("wait: no kstack"));
                    data.tf = ptr::null_mut();
                    data.context = ptr::null_mut();
                    data.pgdir.take().expect("wait: no pgdir").freevm(allocator);
                    data.sz = 0;
                    data.name[0] = 0;

                    ptable.procs[i].pid = 0;
                    ptable.procs[i].parent = None;
                    ptable.procs[i].channel = 0;
                    ptable.procs[i].state = ProcState::Unused;
                    self.shared[i].killed.store(false, Ordering::Release);
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || curr.killed() {
                return Err(());
            }

            // Wait for a child to exit.
            let chan = self.chan(curr.idx());
            ptable.procs[curr.idx()].channel = chan;
            ptable.procs[curr.idx()].state = ProcState::Sleeping;
            self.sched(&mut ptable, curr.idx());
            ptable.procs[curr.idx()].channel = 0;
        }
    }

    /// The per-CPU scheduler loop; never returns. Picks the next
    /// RUNNABLE slot in table order, installs its address space and
    /// switches to it; the process switches back here when it yields,
    /// sleeps or exits.
    ///
    /// # Safety
    ///
    /// Must only be called once per CPU, at the end of boot.
    pub unsafe fn scheduler(&'static self) -> ! {
        static FIRST: AtomicBool = AtomicBool::new(true);

        let cpu = CPUS.current();
        unsafe { (*cpu).proc = None };
        loop {
            // Let devices interrupt between rounds. On the very first
            // round interrupts were never enabled, and stay that way
            // until the first process runs.
            if !FIRST.swap(false, Ordering::Relaxed) {
                unsafe { crate::arm::intr_on() };
            }

            let mut ptable = self.ptable.lock();
            for idx in 0..NPROC {
                if ptable.procs[idx].state != ProcState::Runnable {
                    continue;
                }

                // Switch to the chosen process. It is the process's job
                // to release the table lock and reacquire it before
                // jumping back here.
                unsafe { (*cpu).proc = Some(idx) };
                let data = unsafe { &mut *self.data_raw(idx) };
                switchuvm(data.pgdir.as_ref().expect("scheduler: no pgdir"));
                ptable.procs[idx].state = ProcState::Running;
                unsafe { swtch(ptr::addr_of_mut!((*cpu).scheduler), data.context) };

                // The process is done running for now; it changed its
                // state before coming back.
                switchkvm();
                unsafe { (*cpu).proc = None };
            }
            drop(ptable);
        }
    }

    /// Switches to the scheduler. The table lock must be held (the
    /// guard proves it) and must be the only lock, the process state
    /// must already have been changed, and interrupts must be off. The
    /// saved IRQ-enable flag is a property of this kernel thread, not
    /// of the CPU, so it is carried across the switch.
    fn sched(&self, ptable: &mut SpinLockGuard<'_, Ptable>, idx: usize) {
        assert!(!intr_get(), "sched interruptible");
        assert_ne!(ptable.procs[idx].state, ProcState::Running, "sched running");
        let cpu = CPUS.current();
        unsafe {
            assert_eq!((*cpu).noff, 1, "sched locks");
            let intena = (*cpu).interrupt_enabled;
            let data = &mut *self.data_raw(idx);
            swtch(ptr::addr_of_mut!(data.context), (*cpu).scheduler);
            (*CPUS.current()).interrupt_enabled = intena;
        }
    }

    /// Gives up the CPU for one scheduling round.
    pub fn yield_cpu(&self, idx: usize) {
        let mut ptable = self.ptable.lock();
        ptable.procs[idx].state = ProcState::Runnable;
        self.sched(&mut ptable, idx);
    }

    /// Like `yield_cpu`, but only if the slot is still RUNNING; the
    /// timer interrupt uses this so the check and the transition happen
    /// under one lock acquisition.
    pub fn yield_if_running(&self, idx: usize) {
        let mut ptable = self.ptable.lock();
        if ptable.procs[idx].state == ProcState::Running {
            ptable.procs[idx].state = ProcState::Runnable;
            self.sched(&mut ptable, idx);
        }
    }

    /// Atomically releases `lk` and sleeps on `chan`; reacquires `lk`
    /// when awakened. For sleeping on the table lock itself (wait()),
    /// the body is inlined at the call site instead.
    pub fn sleep<R: RawLock, T>(&self, idx: usize, chan: usize, lk: &mut Guard<'_, R, T>) {
        debug_assert_ne!(
            lk.raw(),
            &self.ptable as *const _ as *const u8 as usize,
            "sleep: ptable lock"
        );

        // Acquire the table lock before releasing `lk`: wakeup() runs
        // with the table lock held, so once we hold it no wakeup
        // sequenced after our decision to sleep can be missed.
        let mut ptable = self.ptable.lock();
        lk.reacquire_after(move || {
            ptable.procs[idx].channel = chan;
            ptable.procs[idx].state = ProcState::Sleeping;
            self.sched(&mut ptable, idx);

            // Tidy up.
            ptable.procs[idx].channel = 0;
        });
    }

    fn wakeup1(ptable: &mut Ptable, chan: usize) {
        for p in ptable.procs.iter_mut() {
            if p.state == ProcState::Sleeping && p.channel == chan {
                p.state = ProcState::Runnable;
            }
        }
    }

    /// Wakes all processes sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        let mut ptable = self.ptable.lock();
        Self::wakeup1(&mut ptable, chan);
    }

    /// Kills the process with the given pid. The victim won't exit
    /// until it next crosses the kernel-to-user boundary; a sleeper is
    /// lifted to RUNNABLE so it can get there.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let mut ptable = self.ptable.lock();
        for (i, p) in ptable.procs.iter_mut().enumerate() {
            if p.pid == pid && p.state != ProcState::Unused {
                self.shared[i].killed.store(true, Ordering::Release);
                if p.state == ProcState::Sleeping {
                    p.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Releases the table lock a brand-new process inherits from the
    /// scheduler.
    ///
    /// # Safety
    ///
    /// Only `fork_return` may call this, exactly once per first switch.
    unsafe fn release_inherited_lock(&self) {
        unsafe { self.ptable.unlock() };
    }

    /// Prints a process listing to the console. For debugging; runs
    /// lockless so a wedged machine can still be inspected.
    pub fn procdump(&self) {
        println!();
        let ptable = self.ptable.get_mut_raw();
        for i in 0..NPROC {
            let (state, pid) = unsafe { ((*ptable).procs[i].state, (*ptable).procs[i].pid) };
            if state != ProcState::Unused {
                let name = unsafe { (*self.data_raw(i)).name_str() };
                println!("{} {} {}", pid, state.as_str(), name);
            }
        }
    }
}

/// A fork child's very first scheduling by `scheduler()` switches here;
/// returning drops into `trapret`, which unwinds the child's copy of
/// the parent's trap frame back to user mode.
#[no_mangle]
pub extern "C" fn fork_return() {
    // Still holding the table lock from scheduler().
    unsafe { kernel().procs.release_inherited_lock() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::test_arena;

    fn state_of(procs: &Procs, idx: usize) -> (ProcState, Pid) {
        let ptable = procs.ptable.lock();
        (ptable.procs[idx].state, ptable.procs[idx].pid)
    }

    #[test]
    fn allocproc_initializes_the_slot() {
        let procs = Procs::new();
        let kmem = test_arena(4);

        let a = procs.allocproc(&kmem).unwrap();
        let b = procs.allocproc(&kmem).unwrap();
        assert_ne!(a, b);

        let (state, pid_a) = state_of(&procs, a);
        assert_eq!(state, ProcState::Embryo);
        let (_, pid_b) = state_of(&procs, b);
        // Pids are positive and monotonically increasing.
        assert!(pid_a >= 1);
        assert_eq!(pid_b, pid_a + 1);

        let data = unsafe { &*procs.data_raw(a) };
        let kstack = data.kstack.as_ref().unwrap().addr();
        assert_eq!(data.tf as usize, kstack + KSTACKSIZE - mem::size_of::<TrapFrame>());
        assert_eq!(
            data.context as usize,
            data.tf as usize - mem::size_of::<Context>()
        );
        // First switch resumes in fork_return and falls into trapret.
        let ctx = unsafe { &*data.context };
        assert_eq!(ctx.pc, fork_return as usize);
        assert_eq!(ctx.lr, trapret_addr());
    }

    #[test]
    fn allocproc_failure_resets_the_slot() {
        let procs = Procs::new();
        let kmem = test_arena(0); // no pages at all
        assert!(procs.allocproc(&kmem).is_none());
        // UNUSED slots look untouched: pid 0, no kstack, no pgdir.
        for i in 0..NPROC {
            let (state, pid) = state_of(&procs, i);
            assert_eq!(state, ProcState::Unused);
            assert_eq!(pid, 0);
            let data = unsafe { &*procs.data_raw(i) };
            assert!(data.kstack.is_none());
            assert!(data.pgdir.is_none());
        }
    }

    #[test]
    fn table_fills_up_at_nproc() {
        let procs = Procs::new();
        let kmem = test_arena(NPROC + 1);
        for _ in 0..NPROC {
            assert!(procs.allocproc(&kmem).is_some());
        }
        assert!(procs.allocproc(&kmem).is_none());
    }

    #[test]
    fn wakeup_hits_only_the_matching_channel() {
        let procs = Procs::new();
        let kmem = test_arena(4);
        let a = procs.allocproc(&kmem).unwrap();
        let b = procs.allocproc(&kmem).unwrap();

        {
            let mut ptable = procs.ptable.lock();
            ptable.procs[a].state = ProcState::Sleeping;
            ptable.procs[a].channel = 0xdead;
            ptable.procs[b].state = ProcState::Sleeping;
            ptable.procs[b].channel = 0xbeef;
        }

        procs.wakeup(0xdead);
        assert_eq!(state_of(&procs, a).0, ProcState::Runnable);
        assert_eq!(state_of(&procs, b).0, ProcState::Sleeping);
    }

    #[test]
    fn kill_lifts_a_sleeper() {
        let procs = Procs::new();
        let kmem = test_arena(4);
        let a = procs.allocproc(&kmem).unwrap();
        let pid = state_of(&procs, a).1;

        {
            let mut ptable = procs.ptable.lock();
            ptable.procs[a].state = ProcState::Sleeping;
            ptable.procs[a].channel = 0x1234;
        }

        assert_eq!(procs.kill(pid), Ok(()));
        assert_eq!(state_of(&procs, a).0, ProcState::Runnable);
        assert!(procs.shared[a].killed.load(Ordering::Acquire));

        // A pid that does not exist fails.
        assert_eq!(procs.kill(9999), Err(()));
    }

    #[test]
    fn kill_leaves_runnable_state_alone() {
        let procs = Procs::new();
        let kmem = test_arena(4);
        let a = procs.allocproc(&kmem).unwrap();
        let pid = state_of(&procs, a).1;
        {
            let mut ptable = procs.ptable.lock();
            ptable.procs[a].state = ProcState::Runnable;
        }
        assert_eq!(procs.kill(pid), Ok(()));
        assert_eq!(state_of(&procs, a).0, ProcState::Runnable);
    }
}
