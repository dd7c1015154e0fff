//! Synchronous-exception classification and dispatch.
//!
//! The vector entry in the binary crate saves the trap frame, reads
//! `ESR_EL2`/`FAR_EL2`, and calls [`dispatch`] with the decoded syndrome.
//! This module owns the EC table from the design: HVC advances past the
//! call, data aborts are delegated to the MMIO emulator, and everything
//! else not explicitly handled is fatal.

use core::fmt::Write as _;

use bitfield_struct::bitfield;
use macros::AsBits;

use crate::mmio;
use crate::uart::Uart;
use crate::vm::VcpuRegs;

/// `ESR_EL2` exception class values this design names explicitly, plus
/// `Other` as a catch-all for every EC this design does not special-case.
/// Carrying the full value (rather than collapsing straight to `Other`)
/// lets [`trap_dump`] print a precise class name for any trap, not only
/// the ones this hypervisor understands.
#[derive(AsBits, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ExceptionClass {
    Unknown = 0x00,
    TrappedWfiWfe = 0x01,
    SvcAArch64 = 0x15,
    HvcAArch64 = 0x16,
    SmcAArch64 = 0x17,
    TrappedMsrMrsSystem = 0x18,
    InstructionAbortLowerEl = 0x20,
    InstructionAbortSameEl = 0x21,
    DataAbortLowerEl = 0x24,
    DataAbortSameEl = 0x25,
    Other = 0x3F,
}

impl ExceptionClass {
    /// Maps a raw 6-bit EC field to a known variant, or `Other` if this
    /// design doesn't name it. Unlike the derived `AsBits::from_bits`
    /// (which panics on an unrecognised value, appropriate for a field
    /// that must always hold one of its defined values), this always
    /// succeeds — an exception's EC can legitimately be any of the 64
    /// architected values, most of which this hypervisor treats uniformly
    /// as fatal.
    #[must_use]
    pub const fn from_ec(ec: u8) -> Self {
        match ec {
            0x00 => Self::Unknown,
            0x01 => Self::TrappedWfiWfe,
            0x15 => Self::SvcAArch64,
            0x16 => Self::HvcAArch64,
            0x17 => Self::SmcAArch64,
            0x18 => Self::TrappedMsrMrsSystem,
            0x20 => Self::InstructionAbortLowerEl,
            0x21 => Self::InstructionAbortSameEl,
            0x24 => Self::DataAbortLowerEl,
            0x25 => Self::DataAbortSameEl,
            _ => Self::Other,
        }
    }

    /// A human-readable name, used by [`trap_dump`] for every class, not
    /// only the ones this design handles.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::TrappedWfiWfe => "WFI/WFE",
            Self::SvcAArch64 => "SVC (AArch64)",
            Self::HvcAArch64 => "HVC (AArch64)",
            Self::SmcAArch64 => "SMC (AArch64)",
            Self::TrappedMsrMrsSystem => "MSR/MRS (sysreg)",
            Self::InstructionAbortLowerEl => "Instruction Abort (lower EL)",
            Self::InstructionAbortSameEl => "Instruction Abort (EL1)",
            Self::DataAbortLowerEl => "Data Abort (lower EL)",
            Self::DataAbortSameEl => "Data Abort (EL1)",
            Self::Other => "Unhandled/Unknown EC",
        }
    }
}

#[bitfield(u64)]
pub struct ExceptionSyndrome {
    #[bits(25)]
    pub iss: u32,
    #[bits(1)]
    _instruction_length: bool,
    #[bits(6)]
    ec_raw: u8,
    #[bits(32)]
    _res0: u32,
}

impl ExceptionSyndrome {
    #[must_use]
    pub const fn exception_class(&self) -> ExceptionClass {
        ExceptionClass::from_ec(self.ec_raw())
    }

    /// Destination register index for a data/instruction abort with a
    /// valid instruction syndrome (`ISV == 1`): `Rt = ISS[9:5]`.
    #[must_use]
    pub const fn abort_rt(&self) -> u8 {
        ((self.iss() >> 5) & 0x1F) as u8
    }

    /// Write/not-read bit for a data abort: `WnR = ISS[6]`.
    #[must_use]
    pub const fn abort_wnr(&self) -> bool {
        (self.iss() >> 6) & 1 != 0
    }
}

/// Outcome of [`dispatch`]: either the trap was handled and the vCPU
/// should resume, or it was not and the hypervisor must halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Resume,
    Fatal,
}

/// Classifies and handles a synchronous exception taken from EL1, per the
/// design's dispatch table. `esr`/`far` are the raw register values read
/// by the caller immediately after the trap (their own `mrs` is left to
/// the caller so this function stays host-testable).
pub fn dispatch(regs: &mut VcpuRegs, uart: &mut Uart<'_>, esr: u64, far: u64) -> Outcome {
    let syndrome = ExceptionSyndrome::from(esr);

    match syndrome.exception_class() {
        ExceptionClass::HvcAArch64 => {
            // Guest `hvc #0`: log once (scenario E1 expects a single HVC
            // trap line alongside the guest's own UART output), then resume
            // at the instruction after the call, with x0..x30 untouched.
            let _ = writeln!(uart, "icevmm: HVC from guest (x0={:#x})", regs.x[0]);
            regs.elr_el2 += 4;
            Outcome::Resume
        }
        ExceptionClass::DataAbortLowerEl => {
            if far == crate::UART_BASE {
                mmio::emulate_uart_access(regs, uart, &syndrome);
                Outcome::Resume
            } else {
                trap_dump(uart, syndrome, esr, regs.elr_el2, Some(far));
                Outcome::Fatal
            }
        }
        // The design explicitly rejects falling through to MMIO emulation
        // for instruction aborts, even when `far` happens to equal the
        // UART page: only data aborts are MMIO here.
        ExceptionClass::InstructionAbortLowerEl | ExceptionClass::InstructionAbortSameEl => {
            trap_dump(uart, syndrome, esr, regs.elr_el2, Some(far));
            Outcome::Fatal
        }
        ExceptionClass::DataAbortSameEl => {
            trap_dump(uart, syndrome, esr, regs.elr_el2, Some(far));
            Outcome::Fatal
        }
        ExceptionClass::TrappedMsrMrsSystem | ExceptionClass::TrappedWfiWfe => {
            trap_dump(uart, syndrome, esr, regs.elr_el2, None);
            Outcome::Fatal
        }
        _ => {
            trap_dump(uart, syndrome, esr, regs.elr_el2, None);
            Outcome::Fatal
        }
    }
}

/// Emits a human-readable decode of a trap to the UART: reason, EC, ISS,
/// `ELR_EL2`, and (for aborts) `FAR_EL2`.
fn trap_dump(uart: &mut Uart<'_>, syndrome: ExceptionSyndrome, esr: u64, elr: u64, far: Option<u64>) {
    let _ = writeln!(uart, "  reason: {}", syndrome.exception_class().describe());
    let _ = writeln!(uart, "  EC: {:#x}", syndrome.ec_raw());
    let _ = writeln!(uart, "  ISS: {:#x}", syndrome.iss());
    let _ = writeln!(uart, "  ESR_EL2: {esr:#x}");
    let _ = writeln!(uart, "  ELR_EL2: {elr:#x}");
    if let Some(far) = far {
        let _ = writeln!(uart, "  FAR_EL2: {far:#x}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esr_with(ec: u8, iss: u32) -> u64 {
        (u64::from(ec) << 26) | u64::from(iss & 0x01FF_FFFF)
    }

    #[test]
    fn hvc_advances_elr_and_resumes() {
        let mut regs = VcpuRegs::zeroed();
        regs.elr_el2 = 0x4000_1000;
        let mut sink = std::vec::Vec::new();
        let mut uart = crate::uart::Uart::test_sink(&mut sink);

        let outcome = dispatch(&mut regs, &mut uart, esr_with(0x16, 0), 0);
        assert_eq!(outcome, Outcome::Resume);
        assert_eq!(regs.elr_el2, 0x4000_1004);

        drop(uart);
        let logged = std::string::String::from_utf8(sink).unwrap();
        assert!(logged.contains("HVC"), "HVC trap should log once: {logged:?}");
    }

    #[test]
    fn hvc_leaves_general_purpose_registers_untouched() {
        let mut regs = VcpuRegs::zeroed();
        for (i, slot) in regs.x.iter_mut().enumerate() {
            *slot = u64::try_from(i).unwrap() + 1;
        }
        let before = regs.x;
        let mut sink = std::vec::Vec::new();
        let mut uart = crate::uart::Uart::test_sink(&mut sink);

        dispatch(&mut regs, &mut uart, esr_with(0x16, 0), 0);

        assert_eq!(regs.x, before);
    }

    #[test]
    fn data_abort_to_unmapped_address_is_fatal() {
        let mut regs = VcpuRegs::zeroed();
        let mut sink = std::vec::Vec::new();
        let mut uart = crate::uart::Uart::test_sink(&mut sink);

        let outcome = dispatch(&mut regs, &mut uart, esr_with(0x24, 0), 0x0A00_0000);
        assert_eq!(outcome, Outcome::Fatal);
    }

    #[test]
    fn unknown_ec_decodes_as_other_and_is_fatal() {
        assert_eq!(ExceptionClass::from_ec(0x3B), ExceptionClass::Other);
        let mut regs = VcpuRegs::zeroed();
        let mut sink = std::vec::Vec::new();
        let mut uart = crate::uart::Uart::test_sink(&mut sink);
        assert_eq!(dispatch(&mut regs, &mut uart, esr_with(0x3B, 0), 0), Outcome::Fatal);
    }
}
