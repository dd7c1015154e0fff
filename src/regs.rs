//! Typed `unsafe` wrappers around the EL2 system registers this hypervisor
//! touches, plus the barrier/TLB-invalidate intrinsics the design notes
//! require around every translation-table or control-register update.
//!
//! Each wrapper is a single `mrs`/`msr` pair — no wrapper combines multiple
//! registers or adds retry logic. Callers are responsible for issuing the
//! barriers named in the module-level doc comment of whichever caller reads
//! or writes a translation table.

#![allow(clippy::missing_safety_doc, reason = "safety is documented at the module level")]

/// Declares a pair of `unsafe fn` wrappers, `read_$name`/`write_$name`, for
/// the named system register.
///
/// # Safety (applies to every generated function)
/// The caller must know that writing this register at this point in
/// execution is architecturally valid (e.g. not from a context where the
/// register is inaccessible, and with any barriers the caller's protocol
/// requires already issued or about to be issued).
macro_rules! sysreg {
    ($reg:ident, $read:ident, $write:ident) => {
        /// Reads the named system register.
        #[inline]
        #[must_use]
        pub unsafe fn $read() -> u64 {
            #[cfg(target_arch = "aarch64")]
            {
                let value: u64;
                // SAFETY: forwarded from the caller of this function.
                unsafe {
                    core::arch::asm!(
                        concat!("mrs {value}, ", stringify!($reg)),
                        value = out(reg) value,
                        options(nomem, nostack, preserves_flags),
                    );
                }
                value
            }
            #[cfg(not(target_arch = "aarch64"))]
            {
                unreachable!("system register access is only meaningful on aarch64")
            }
        }

        /// Writes the named system register.
        #[inline]
        pub unsafe fn $write(value: u64) {
            #[cfg(target_arch = "aarch64")]
            {
                // SAFETY: forwarded from the caller of this function.
                unsafe {
                    core::arch::asm!(
                        concat!("msr ", stringify!($reg), ", {value}"),
                        value = in(reg) value,
                        options(nomem, nostack, preserves_flags),
                    );
                }
            }
            #[cfg(not(target_arch = "aarch64"))]
            {
                let _ = value;
                unreachable!("system register access is only meaningful on aarch64")
            }
        }
    };
}

sysreg!(sctlr_el2, read_sctlr_el2, write_sctlr_el2);
sysreg!(hcr_el2, read_hcr_el2, write_hcr_el2);
sysreg!(cptr_el2, read_cptr_el2, write_cptr_el2);
sysreg!(vbar_el2, read_vbar_el2, write_vbar_el2);
sysreg!(tcr_el2, read_tcr_el2, write_tcr_el2);
sysreg!(ttbr0_el2, read_ttbr0_el2, write_ttbr0_el2);
sysreg!(vttbr_el2, read_vttbr_el2, write_vttbr_el2);
sysreg!(vtcr_el2, read_vtcr_el2, write_vtcr_el2);
sysreg!(mair_el2, read_mair_el2, write_mair_el2);
sysreg!(esr_el2, read_esr_el2, write_esr_el2);
sysreg!(far_el2, read_far_el2, write_far_el2);
sysreg!(cnthctl_el2, read_cnthctl_el2, write_cnthctl_el2);
sysreg!(cntfrq_el0, read_cntfrq_el0, write_cntfrq_el0);
sysreg!(cntv_tval_el0, read_cntv_tval_el0, write_cntv_tval_el0);
sysreg!(cntv_ctl_el0, read_cntv_ctl_el0, write_cntv_ctl_el0);

/// Reads `CurrentEL`, shifted down to a plain exception-level number (0-3).
///
/// # Safety
/// None beyond the general requirement that this only be called on
/// `aarch64` hardware; `CurrentEL` has no side effects.
#[inline]
#[must_use]
pub unsafe fn current_el() -> u8 {
    #[cfg(target_arch = "aarch64")]
    {
        let current_el: u64;
        // SAFETY: reading `CurrentEL` has no side effects.
        unsafe {
            core::arch::asm!(
                "mrs {value}, CurrentEL",
                value = out(reg) current_el,
                options(nomem, nostack, preserves_flags),
            );
        }
        #[expect(clippy::cast_possible_truncation, reason = "CurrentEL is a 2-bit field")]
        {
            ((current_el >> 2) & 0b11) as u8
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        unreachable!("CurrentEL is only meaningful on aarch64")
    }
}

/// Issues a full system data synchronisation barrier (`dsb sy`).
///
/// # Safety
/// Must be issued after any translation-table or system-control-register
/// write before code that depends on the write having taken effect.
#[inline]
pub unsafe fn dsb_sy() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `dsb sy` has no effect beyond ordering memory accesses.
    unsafe {
        core::arch::asm!("dsb sy", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {}
}

/// Issues an instruction synchronisation barrier (`isb`).
///
/// # Safety
/// Must be issued after any system-control-register write (`SCTLR_EL2`,
/// `TCR_EL2`, `TTBR0_EL2`, ...) before executing code that relies on the new
/// configuration.
#[inline]
pub unsafe fn isb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `isb` has no effect beyond instruction-stream ordering.
    unsafe {
        core::arch::asm!("isb", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {}
}

/// Invalidates all stage-1 and stage-2 TLB entries for the current VMID,
/// at EL1 and EL0 (`tlbi vmalle1`), followed by the barriers required
/// before the invalidation is guaranteed visible.
///
/// # Safety
/// Must be called after any stage-2 table mutation that is visible to the
/// guest, per the design's ordering contract.
#[inline]
pub unsafe fn tlbi_vmalle1() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: TLB maintenance instructions have no effect beyond discarding
    // cached translations; correctness relies only on the barriers below.
    unsafe {
        core::arch::asm!(
            "tlbi vmalle1",
            "dsb sy",
            "isb",
            options(nomem, nostack, preserves_flags),
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {}
}
