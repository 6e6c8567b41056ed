//! Boot entry: runs at physical addresses, builds the bootstrap
//! translation tables at `K_PDX_BASE`, turns the MMU on and jumps to
//! `kmain` in the kernel window.
//!
//! The bootstrap map is the bare minimum: an identity section for the
//! first megabyte (so this code keeps executing the instant the MMU
//! comes on; stage 2 deletes it later) and a 64 MiB kernel window,
//! which stage 1 widens. SCTLR gets the high-vectors bit so exceptions
//! go to `HVECTORS`.

#[cfg(target_arch = "arm")]
core::arch::global_asm!(
    r#"
    .section .text.boot
    .globl _start
    _start:
        cpsid   if, #0x13           @ supervisor mode, interrupts masked

        @ Zero the 16 KiB first-level table at K_PDX_BASE.
        mov     r0, #0x4000
        mov     r1, #0
        mov     r2, #0x4000
    1:  str     r1, [r0], #4
        subs    r2, r2, #4
        bne     1b

        @ Section attributes: domain 0, kernel RW, cached, buffered.
        ldr     r3, =0x0000040e

        @ Identity-map the first megabyte.
        mov     r0, #0x4000
        str     r3, [r0]

        @ Map 64 MiB of kernel window: VA 0x80000000 -> PA 0.
        add     r0, r0, #0x2000     @ &l1[0x800]
        mov     r4, #64
        mov     r5, #0
    2:  orr     r6, r5, r3
        str     r6, [r0], #4
        add     r5, r5, #0x100000
        subs    r4, r4, #1
        bne     2b

        @ Domain 0 to client mode.
        mov     r0, #1
        mcr     p15, 0, r0, c3, c0, 0

        @ Translation-table base.
        mov     r0, #0x4000
        mcr     p15, 0, r0, c2, c0, 0

        @ Clean slate for the TLB and caches.
        mov     r0, #0
        mcr     p15, 0, r0, c8, c7, 0   @ TLBIALL
        mcr     p15, 0, r0, c7, c5, 0   @ ICIALLU
        dsb
        isb

        @ MMU on, caches on, high vectors.
        mrc     p15, 0, r0, c1, c0, 0
        ldr     r1, =0x00003005         @ M, C, I, V
        orr     r0, r0, r1
        mcr     p15, 0, r0, c1, c0, 0
        isb

        @ Boot stack just below the page tables, then into Rust at the
        @ kernel-window address.
        ldr     sp, =0x80003000
        ldr     pc, =kmain

        .ltorg
    "#
);
