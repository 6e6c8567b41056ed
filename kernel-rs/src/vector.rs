//! Exception vectors, trap entry/exit stubs and the context switch.
//!
//! The first eight words of `vectors` are `ldr pc, [pc, #24]`
//! instructions whose literal pool holds the handler addresses; the
//! whole blob is position-independent and gets copied to `HVECTORS` at
//! boot.
//!
//! Each entry stub stages the banked return address, SPSR and r0 in
//! scratch slots below the eventual frame, switches to supervisor mode
//! with IRQs masked, and builds the `TrapFrame` the dispatcher expects:
//! user SP, r0-r14, trap number, IFAR, CPSR, SPSR, return PC, growing
//! down from the supervisor stack pointer. `trapret` unwinds it; a
//! frame whose SPSR names a non-user mode takes the leg that skips the
//! banked user SP/LR reload and restores the interrupted kernel LR
//! instead.
//!
//! `swtch` saves the callee-save registers as a `Context` on the old
//! kernel stack, parks the resulting stack pointer in `*old`, and
//! resumes from the context a `new` points at.

use cfg_if::cfg_if;

use crate::proc::Context;

cfg_if! {
    if #[cfg(target_arch = "arm")] {
        use core::arch::global_asm;

        global_asm!(
            r#"
            .text

            .balign 32
            .globl vectors
            vectors:
                ldr     pc, [pc, #24]       @ reset
                ldr     pc, [pc, #24]       @ undefined instruction
                ldr     pc, [pc, #24]       @ supervisor call
                ldr     pc, [pc, #24]       @ prefetch abort
                ldr     pc, [pc, #24]       @ data abort
                ldr     pc, [pc, #24]       @ (reserved)
                ldr     pc, [pc, #24]       @ irq
                ldr     pc, [pc, #24]       @ fiq
                .word   trap_reset
                .word   trap_und
                .word   trap_swi
                .word   trap_pabt
                .word   trap_dabt
                .word   trap_reset
                .word   trap_irq
                .word   trap_fiq

            @ Build a 21-word trap frame on the supervisor stack and call
            @ trap(). The three staging slots sit below the frame so the
            @ supervisor-call case, which is already on this stack, does
            @ not overwrite them while the frame grows.
            .macro  TRAPENTER name, trapno, lradj
            .globl  \name
            \name:
                sub     lr, lr, #\lradj
                str     lr, [sp, #-88]      @ stage return pc
                mrs     lr, spsr
                str     lr, [sp, #-92]      @ stage spsr
                str     r0, [sp, #-96]      @ stage r0
                sub     r0, sp, #96
                cpsid   i, #0x13            @ supervisor mode, irq masked
                str     r14, [sp, #-24]     @ interrupted kernel lr, before
                                            @ it doubles as scratch below
                ldr     lr, [r0, #8]
                stmfd   sp!, {{lr}}         @ tf.pc
                ldr     lr, [r0, #4]
                stmfd   sp!, {{lr}}         @ tf.spsr
                mrs     lr, cpsr
                stmfd   sp!, {{lr}}         @ tf.cpsr
                mrc     p15, 0, lr, c6, c0, 2
                stmfd   sp!, {{lr}}         @ tf.ifar
                mov     lr, #\trapno
                stmfd   sp!, {{lr}}         @ tf.trapno
                ldr     lr, [sp, #12]       @ spsr: user or kernel trap?
                and     lr, lr, #0x1f
                cmp     lr, #0x10
                sub     sp, sp, #8
                bne     1f
                stmia   sp, {{r13, r14}}^   @ tf.r13, tf.r14 (user bank)
                b       2f
            1:  str     r13, [sp]           @ kernel trap: lr already staged
            2:  stmfd   sp!, {{r1-r12}}     @ tf.r1 .. tf.r12
                ldr     lr, [r0]
                stmfd   sp!, {{lr}}         @ tf.r0
                ldr     lr, [sp, #72]       @ spsr again
                and     lr, lr, #0x1f
                cmp     lr, #0x10
                sub     sp, sp, #4
                bne     3f
                stmia   sp, {{r13}}^        @ tf.sp (user bank)
                b       4f
            3:  add     lr, sp, #84
                str     lr, [sp]            @ interrupted kernel sp
            4:  mov     r0, sp
                bl      trap
                b       trapret
            .endm

            TRAPENTER trap_und,  0x01, 0
            TRAPENTER trap_swi,  0x40, 0
            TRAPENTER trap_pabt, 0x02, 4
            TRAPENTER trap_dabt, 0x04, 8
            TRAPENTER trap_irq,  0x80, 4

            @ Return from a trap frame. Restores r0-r12, then for a trap
            @ from user mode the banked user SP/LR, SPSR and pc; a trap
            @ from a kernel mode skips the banked reload and restores the
            @ interrupted LR from the frame instead.
            .globl  trapret
            trapret:
                add     sp, sp, #4          @ drop tf.sp
                ldmfd   sp!, {{r0-r12}}
                ldr     lr, [sp, #20]       @ tf.spsr
                and     lr, lr, #0x1f
                cmp     lr, #0x10
                bne     1f
                ldmia   sp, {{r13, r14}}^
                add     sp, sp, #20
                ldmfd   sp!, {{lr}}
                msr     spsr_cxsf, lr
                ldmfd   sp!, {{lr}}
                movs    pc, lr
            1:  ldr     lr, [sp, #20]
                msr     spsr_cxsf, lr
                ldr     lr, [sp, #4]
                add     sp, sp, #24
                ldmfd   sp!, {{pc}}^

            @ The reset and fiq vectors should never fire.
            .globl  trap_reset
            trap_reset:
                b       trap_reset
            .globl  trap_fiq
            trap_fiq:
                b       trap_fiq

            @ void swtch(struct context **old, struct context *new);
            @ Push a context, save the old stack pointer, switch stacks,
            @ pop the new context.
            .globl  swtch
            swtch:
                stmfd   sp!, {{lr}}         @ resume pc
                stmfd   sp!, {{lr}}
                stmfd   sp!, {{r4-r12}}
                str     sp, [r0]
                mov     sp, r1
                ldmfd   sp!, {{r4-r12}}
                ldmfd   sp!, {{lr}}
                ldmfd   sp!, {{pc}}

            @ void set_mode_sp(char *sp, u32 cpsr_c);
            @ Switch to the mode named by cpsr_c, install its stack
            @ pointer, and come back to supervisor mode.
            .globl  set_mode_sp
            set_mode_sp:
                mrs     r2, cpsr
                msr     cpsr_c, r1
                mov     sp, r0
                msr     cpsr_c, r2
                bx      lr
            "#
        );

        extern "C" {
            fn vectors();
            fn trapret();
        }

        extern "C" {
            #[link_name = "swtch"]
            fn swtch_raw(old: *mut *mut Context, new: *mut Context);
            #[link_name = "set_mode_sp"]
            fn set_mode_sp_raw(sp: usize, cpsr_c: usize);
        }

        /// Address of the vector blob to copy to `HVECTORS`.
        pub fn vectors_addr() -> usize {
            vectors as usize
        }

        /// Address `trapret` lives at; new contexts point their saved
        /// LR here.
        pub fn trapret_addr() -> usize {
            trapret as usize
        }

        /// Saves the current callee-save state into `*old` and resumes
        /// the context at `new`.
        ///
        /// # Safety
        ///
        /// `new` must point at a valid saved context on a live kernel
        /// stack, and `old` at a slot the owner will resume from.
        pub unsafe fn swtch(old: *mut *mut Context, new: *mut Context) {
            unsafe { swtch_raw(old, new) };
        }

        /// Installs the stack pointer for the CPU mode named by
        /// `cpsr_c`, masking IRQ+FIQ in that mode.
        ///
        /// # Safety
        ///
        /// `sp` must be the top of a valid, otherwise unused stack.
        pub unsafe fn set_mode_sp(sp: usize, cpsr_c: usize) {
            unsafe { set_mode_sp_raw(sp, cpsr_c) };
        }
    } else {
        // Host builds compile the kernel for its logic tests; nothing
        // here can actually run off-target.

        static HOST_VECTORS: [u32; 16] = [0; 16];

        pub fn vectors_addr() -> usize {
            HOST_VECTORS.as_ptr() as usize
        }

        pub extern "C" fn trapret() {
            unreachable!("trapret runs only on the target");
        }

        pub fn trapret_addr() -> usize {
            trapret as usize
        }

        pub unsafe fn swtch(_old: *mut *mut Context, _new: *mut Context) {
            unreachable!("swtch runs only on the target");
        }

        pub unsafe fn set_mode_sp(_sp: usize, _cpsr_c: usize) {
            unreachable!("set_mode_sp runs only on the target");
        }
    }
}

/// Number of words in the vector blob: eight vector slots plus their
/// literal pool.
pub const VECTORS_WORDS: usize = 16;
