//! The exception vector table and the world-switch between EL2 and the
//! guest's EL1.
//!
//! Every guest trap lands in one of two vectors this design actually
//! handles — synchronous exceptions and the virtual-timer IRQ, both taken
//! from a lower EL in AArch64 state — saves the full trap frame onto the
//! hypervisor's stack, and calls into Rust with a pointer to it. Every
//! other vector (traps from EL2 itself, AArch32 guests, FIQ, SError) is
//! unreachable in this design and branches straight to a fatal handler.

use crate::machine;
use crate::vm::VcpuRegs;

core::arch::global_asm! {
    ".section .vectors",
    // `__exception_vectors` is defined by the linker script at this
    // section's start; VBAR_EL2 is programmed from that symbol, not one
    // defined here, so the vector table's first entry needs no local label.
    ".balign 0x800",

    // Current EL, SP_EL0 — never used; EL2 always runs on SP_EL2.
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",

    // Current EL, SPx — a trap raised by the hypervisor's own code.
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",

    // Lower EL, AArch64 — the guest. These are the two vectors this
    // hypervisor actually services.
    ".balign 0x80", "b sync_entry",
    ".balign 0x80", "b irq_entry",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",

    // Lower EL, AArch32 — unsupported; this design only launches AArch64
    // guests.
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",
    ".balign 0x80", "b fatal",

    ".balign 0x80",
    "sync_entry:",
    // Every vector entry here ends in `eret` via `vcpu_enter`, never a
    // normal return through this entry, so `sp` must be reset to the fixed
    // per-core stack top on every trap rather than reused from whatever a
    // prior trap left it at: nothing ever pops the frame this builds.
    "msr tpidr_el2, x0",
    "adrp x0, __stack_top",
    "add x0, x0, #:lo12:__stack_top",
    "mov sp, x0",
    "mrs x0, tpidr_el2",
    "sub sp, sp, #{frame_size}",
    "stp x0, x1, [sp, #0]",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "stp x8, x9, [sp, #64]",
    "stp x10, x11, [sp, #80]",
    "stp x12, x13, [sp, #96]",
    "stp x14, x15, [sp, #112]",
    "stp x16, x17, [sp, #128]",
    "stp x18, x19, [sp, #144]",
    "stp x20, x21, [sp, #160]",
    "stp x22, x23, [sp, #176]",
    "stp x24, x25, [sp, #192]",
    "stp x26, x27, [sp, #208]",
    "stp x28, x29, [sp, #224]",
    "str x30, [sp, #240]",
    "mrs x0, elr_el2",
    "mrs x1, spsr_el2",
    "mrs x2, sp_el1",
    "stp x0, x1, [sp, #{off_elr}]",
    "str x2, [sp, #{off_sp_el1}]",
    "mov x0, sp",
    "bl {handle_sync}",
    "brk #0", // handle_sync never returns

    "irq_entry:",
    // Same reasoning as `sync_entry`: reset `sp` before anything else.
    "msr tpidr_el2, x0",
    "adrp x0, __stack_top",
    "add x0, x0, #:lo12:__stack_top",
    "mov sp, x0",
    "mrs x0, tpidr_el2",
    "sub sp, sp, #{frame_size}",
    "stp x0, x1, [sp, #0]",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "stp x8, x9, [sp, #64]",
    "stp x10, x11, [sp, #80]",
    "stp x12, x13, [sp, #96]",
    "stp x14, x15, [sp, #112]",
    "stp x16, x17, [sp, #128]",
    "stp x18, x19, [sp, #144]",
    "stp x20, x21, [sp, #160]",
    "stp x22, x23, [sp, #176]",
    "stp x24, x25, [sp, #192]",
    "stp x26, x27, [sp, #208]",
    "stp x28, x29, [sp, #224]",
    "str x30, [sp, #240]",
    "mrs x0, elr_el2",
    "mrs x1, spsr_el2",
    "mrs x2, sp_el1",
    "stp x0, x1, [sp, #{off_elr}]",
    "str x2, [sp, #{off_sp_el1}]",
    "mov x0, sp",
    "bl {handle_irq}",
    "brk #0", // handle_irq never returns

    "fatal:",
    "bl {handle_fatal}",
    "9: wfe",
    "b 9b",

    // Loads a full `VcpuRegs` frame pointed to by x0 and `eret`s into it.
    // x0 itself must be loaded last, since it holds the frame pointer
    // throughout.
    ".global vcpu_enter",
    "vcpu_enter:",
    "ldr x1, [x0, #{off_elr}]",
    "msr elr_el2, x1",
    "ldr x1, [x0, #{off_spsr}]",
    "msr spsr_el2, x1",
    "ldr x1, [x0, #{off_sp_el1}]",
    "msr sp_el1, x1",
    "ldp x2, x3, [x0, #16]",
    "ldp x4, x5, [x0, #32]",
    "ldp x6, x7, [x0, #48]",
    "ldp x8, x9, [x0, #64]",
    "ldp x10, x11, [x0, #80]",
    "ldp x12, x13, [x0, #96]",
    "ldp x14, x15, [x0, #112]",
    "ldp x16, x17, [x0, #128]",
    "ldp x18, x19, [x0, #144]",
    "ldp x20, x21, [x0, #160]",
    "ldp x22, x23, [x0, #176]",
    "ldp x24, x25, [x0, #192]",
    "ldp x26, x27, [x0, #208]",
    "ldp x28, x29, [x0, #224]",
    "ldr x30, [x0, #240]",
    // Loaded last since x0 holds the frame pointer up to this point; `ldp`
    // without writeback reads the base address before writing the
    // destination registers, so `Xt1 == Xn` here is well-defined.
    "ldp x0, x1, [x0, #0]",
    "eret",

    frame_size = const VcpuRegs::FRAME_SIZE,
    off_elr = const VcpuRegs::OFFSET_ELR_EL2,
    off_spsr = const VcpuRegs::OFFSET_SPSR_EL2,
    off_sp_el1 = const VcpuRegs::OFFSET_SP_EL1,
    handle_sync = sym handle_guest_sync,
    handle_irq = sym handle_guest_irq,
    handle_fatal = sym handle_fatal_trap,
}

/// Loads `regs` into the current hardware registers and `eret`s into the
/// guest. Never returns: control only comes back to the hypervisor
/// through the next trap, which starts over at a vector entry, not here.
///
/// # Safety
/// Must be called at EL2 with a fully-initialized `regs` (a valid
/// `elr_el2`/`spsr_el2` at minimum) and with stage-2 translation already
/// covering whatever the guest touches.
pub unsafe fn vcpu_run(regs: &VcpuRegs) -> ! {
    extern "C" {
        fn vcpu_enter(regs: *const VcpuRegs) -> !;
    }
    // SAFETY: forwarded from the caller.
    unsafe { vcpu_enter(core::ptr::from_ref(regs)) }
}

/// Called by the vector entry with a pointer to the just-saved trap frame
/// for a synchronous exception taken from the guest. Classifies and
/// handles it, then either resumes the same vCPU or halts.
extern "C" fn handle_guest_sync(frame: *mut VcpuRegs) -> ! {
    // SAFETY: `frame` points at the frame the vector entry just built on
    // its own stack; exclusively owned for the duration of this call.
    let regs = unsafe { &mut *frame };
    crate::dispatch_guest_trap(regs);
    // SAFETY: `regs` was just updated in place by `dispatch_guest_trap`.
    unsafe { vcpu_run(regs) }
}

/// Called by the vector entry on the virtual-timer IRQ. Runs the
/// scheduler's rendezvous point and resumes whichever vCPU it selects.
extern "C" fn handle_guest_irq(frame: *mut VcpuRegs) -> ! {
    // SAFETY: as in `handle_guest_sync`.
    let regs = unsafe { &mut *frame };
    crate::dispatch_timer_tick(regs);
    // SAFETY: `regs` is replaced in place with the next vCPU's context.
    unsafe { vcpu_run(regs) }
}

/// Called for every vector this design never expects to take. No frame
/// pointer is passed: these traps are unrecoverable hypervisor bugs or
/// unsupported configurations, not guest-induced conditions to inspect.
extern "C" fn handle_fatal_trap() -> ! {
    crate::dispatch_fatal_trap();
    machine::qemu_shutdown(false)
}
