//! The reset vector: the very first instruction executed after QEMU loads
//! the image. Disables interrupts, zeroes `.bss`, refuses to proceed if
//! firmware didn't actually land us at EL2, sets up the initial stack, and
//! tail-calls into [`crate::main`].

core::arch::global_asm! {
    ".section .init",
    ".global _start",
    "_start:",
    "msr DAIFSET, 0b1111", // mask all interrupts before touching anything

    // Refuse to proceed unless we are actually at EL2: a type-I hypervisor
    // has no sensible fallback if firmware handed control to the wrong
    // level.
    "mrs x1, CurrentEL",
    "lsr x1, x1, 2",
    "and x1, x1, 0b11",
    "cmp x1, 2",
    "b.ne 9f",

    // Zero .bss.
    "adrp x1, __bss_start",
    "add x1, x1, #:lo12:__bss_start",
    "adrp x2, __bss_end",
    "add x2, x2, #:lo12:__bss_end",
    "0:",
    "cmp x1, x2",
    "b.hs 1f",
    "str xzr, [x1], 8",
    "b 0b",
    "1:",

    // Install the initial stack.
    "adrp x1, __stack_top",
    "add x1, x1, #:lo12:__stack_top",
    "mov sp, x1",

    "bl {main}",
    // main() never returns.
    "2: wfe",
    "b 2b",

    "9:",
    "bl {wrong_el_handler}",
    "8: wfe",
    "b 8b",

    main = sym crate::main,
    wrong_el_handler = sym crate::wrong_el_handler,
}
