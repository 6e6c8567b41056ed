/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs. Only CPU 0 is ever started; the boot shim
/// parks the other cores.
pub const NCPU: usize = 4;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of in-core inodes.
pub const NINODE: usize = 50;

/// Size of a process's kernel stack.
pub const KSTACKSIZE: usize = crate::mmu::PGSIZE;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;
