//! System-call argument decoding and dispatch.
//!
//! The number rides in r7 (EABI convention) so r0-r3 stay pure argument
//! registers; the result goes back in r0, with all-ones for failure.
//! The gaps in the number space belong to the file system calls, which
//! live with the filesystem.

use crate::println;
use crate::proc::{CurrentProc, TrapFrame};
use crate::sysproc::{
    sys_exit, sys_fork, sys_getpid, sys_kill, sys_sbrk, sys_sleep, sys_uptime, sys_wait,
};

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;

impl TrapFrame {
    /// The nth system-call argument register.
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.r0,
            1 => self.r1,
            2 => self.r2,
            3 => self.r3,
            _ => panic!("argraw"),
        }
    }
}

impl CurrentProc<'_> {
    /// Fetches the nth 32-bit system call argument.
    pub fn argint(&self, n: usize) -> Result<i32, ()> {
        Ok(self.trap_frame().arg(n) as i32)
    }
}

/// Decodes the trap frame of the current process and runs the handler;
/// the return value (or -1) lands in the frame's r0.
pub fn syscall(curr: &mut CurrentProc<'_>) {
    let num = curr.trap_frame().r7;
    let ret = match num {
        SYS_FORK => sys_fork(curr),
        SYS_EXIT => sys_exit(curr),
        SYS_WAIT => sys_wait(curr),
        SYS_KILL => sys_kill(curr),
        SYS_GETPID => sys_getpid(curr),
        SYS_SBRK => sys_sbrk(curr),
        SYS_SLEEP => sys_sleep(curr),
        SYS_UPTIME => sys_uptime(curr),
        _ => {
            println!(
                "{} {}: unknown sys call {}",
                curr.pid(),
                curr.data().name_str(),
                num
            );
            Err(())
        }
    };
    curr.trap_frame_mut().r0 = match ret {
        Ok(v) => v,
        Err(()) => usize::MAX,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_registers_in_order() {
        let tf = TrapFrame {
            r0: 10,
            r1: 11,
            r2: 12,
            r3: 13,
            r4: 99,
            ..TrapFrame::default()
        };
        for n in 0..4 {
            assert_eq!(tf.arg(n), 10 + n);
        }
    }

    #[test]
    #[should_panic(expected = "argraw")]
    fn fifth_argument_is_out_of_range() {
        let tf = TrapFrame::default();
        let _ = tf.arg(4);
    }
}
