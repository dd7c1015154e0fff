//! Small machine-level helpers that don't belong to a single register or
//! subsystem: the fatal-halt primitive and the boot-time EL check.

use crate::regs;

/// Spins forever in a low-power wait state. The sole "exit" from a fatal
/// hypervisor condition per the design's error-handling rules: there is no
/// recovery path at EL2.
#[inline]
pub fn hang() -> ! {
    loop {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: `wfe` only affects the core's power state; a pending
        // event (including none at all, forever) simply resumes the loop.
        unsafe {
            core::arch::asm!("wfe", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}

/// Halts by asking QEMU to exit, with `success` mapped to the usual
/// shell convention (`0` on success, `1` otherwise).
///
/// This hypervisor's only target is QEMU's `virt` machine (spec.md §1), so
/// every fatal halt prefers this over spinning forever: it gives the
/// `qemu-tests` integration harness a real process exit instead of a
/// timeout-and-kill for every fatal scenario (E3, E5). On a host build
/// (unit tests never reach this — `main.rs` is `test = false`) this falls
/// back to [`hang`].
#[inline]
pub fn qemu_shutdown(success: bool) -> ! {
    #[cfg(target_arch = "aarch64")]
    {
        use qemu_exit::QEMUExit;
        qemu_exit::AArch64::new().exit(u32::from(!success))
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = success;
        hang()
    }
}

/// Returns the exception level execution is currently running at (0-3).
///
/// # Safety
/// Only meaningful when called from `aarch64` code; see [`regs::current_el`].
#[inline]
#[must_use]
pub unsafe fn current_el() -> u8 {
    // SAFETY: forwarded from the caller.
    unsafe { regs::current_el() }
}
