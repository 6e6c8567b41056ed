//! Process-related system calls.

use crate::kernel::{kernel, ticks_chan};
use crate::proc::CurrentProc;

/// Create a process. Returns the child's pid.
pub fn sys_fork(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid = kernel().procs.fork(curr, &kernel().kmem)?;
    Ok(pid as usize)
}

/// Terminate the current process. No return.
pub fn sys_exit(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    kernel().procs.exit(curr)
}

/// Wait for a child to exit. Returns its pid.
pub fn sys_wait(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid = kernel().procs.wait(curr, &kernel().kmem)?;
    Ok(pid as usize)
}

/// Terminate the process with the given pid.
pub fn sys_kill(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid = curr.argint(0)?;
    kernel().procs.kill(pid)?;
    Ok(0)
}

/// Return the current process's pid.
pub fn sys_getpid(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    Ok(curr.pid() as usize)
}

/// Grow (or shrink) the process's memory by n bytes. Returns the old
/// program break.
pub fn sys_sbrk(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let n = curr.argint(0)?;
    let addr = curr.data().sz;
    kernel().procs.growproc(curr, n, &kernel().kmem)?;
    Ok(addr)
}

/// Pause for n clock ticks; a kill cuts the pause short with an error.
pub fn sys_sleep(curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let n = curr.argint(0)?;
    let mut ticks = kernel().ticks.lock();
    let ticks0 = *ticks;
    while ticks.wrapping_sub(ticks0) < n as u32 {
        if curr.killed() {
            return Err(());
        }
        kernel().procs.sleep(curr.idx(), ticks_chan(), &mut ticks);
    }
    Ok(0)
}

/// Return how many clock tick interrupts have occurred since start.
pub fn sys_uptime(_curr: &mut CurrentProc<'_>) -> Result<usize, ()> {
    Ok(*kernel().ticks.lock() as usize)
}
