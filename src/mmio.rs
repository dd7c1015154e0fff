//! Emulation for the single memory-mapped device this hypervisor exposes
//! to its guest: a PL011 UART data register at `UART_BASE`.
//!
//! The trap dispatcher only calls here once it has already confirmed
//! `FAR_EL2 == UART_BASE`; this module's job is purely the transfer-width
//! and direction decode plus the side effect, not the address check.

use crate::exception::ExceptionSyndrome;
use crate::uart::Uart;
use crate::vm::VcpuRegs;

/// Emulates a guest load or store to the UART data register, using the
/// already-decoded instruction syndrome to find the destination register
/// and direction. Advances `elr_el2` past the trapping instruction so the
/// guest resumes normally.
pub fn emulate_uart_access(regs: &mut VcpuRegs, uart: &mut Uart<'_>, syndrome: &ExceptionSyndrome) {
    let rt = usize::from(syndrome.abort_rt());

    if syndrome.abort_wnr() {
        // Store: the low byte of the source register goes to the UART.
        // Rt == 31 denotes the zero register (XZR) in the instruction
        // encoding, not an index into `x`; this design treats that as a
        // write of the byte 0.
        let byte = if rt == 31 { 0 } else { regs.x[rt] as u8 };
        uart.write_byte(byte);
    } else if rt != 31 {
        // Load: the guest reads a fixed zero. This UART model has no
        // readable receive path.
        regs.x[rt] = 0;
    }

    regs.elr_el2 += 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syndrome_for(rt: u8, wnr: bool) -> ExceptionSyndrome {
        let iss: u32 = (u32::from(rt) << 5) | (u32::from(wnr) << 6);
        ExceptionSyndrome::from((0x24_u64 << 26) | u64::from(iss))
    }

    #[test]
    fn write_sends_low_byte_to_uart_and_advances_elr() {
        let mut regs = VcpuRegs::zeroed();
        regs.x[2] = 0x47; // 'G'
        regs.elr_el2 = 0x4000_1000;
        let mut sink = std::vec::Vec::new();
        let mut uart = Uart::test_sink(&mut sink);

        emulate_uart_access(&mut regs, &mut uart, &syndrome_for(2, true));

        drop(uart);
        assert_eq!(sink, [0x47]);
        assert_eq!(regs.elr_el2, 0x4000_1004);
    }

    #[test]
    fn read_sets_destination_register_to_zero() {
        let mut regs = VcpuRegs::zeroed();
        regs.x[3] = 0xDEAD_BEEF;
        let mut sink = std::vec::Vec::new();
        let mut uart = Uart::test_sink(&mut sink);

        emulate_uart_access(&mut regs, &mut uart, &syndrome_for(3, false));

        assert_eq!(regs.x[3], 0);
    }

    #[test]
    fn only_the_low_byte_of_a_wider_register_is_sent() {
        let mut regs = VcpuRegs::zeroed();
        regs.x[4] = 0xFFFF_FF41; // 'A' in the low byte
        let mut sink = std::vec::Vec::new();
        let mut uart = Uart::test_sink(&mut sink);

        emulate_uart_access(&mut regs, &mut uart, &syndrome_for(4, true));

        drop(uart);
        assert_eq!(sink, [0x41]);
    }
}
