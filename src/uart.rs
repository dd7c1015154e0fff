//! Driver for the single PL011 UART this hypervisor uses both for its own
//! console and, emulated, as the guest's only MMIO device.
//!
//! Grounded on the same `tock_registers` register-block pattern used
//! elsewhere in this design's lineage, trimmed to the subset QEMU's `virt`
//! machine model actually backs (data register and flag register; the
//! interrupt-status register this hardware also exposes is not read here,
//! since this design never enables UART interrupts).

use core::fmt::{self, Write};
use core::hint;
use core::ptr::NonNull;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{Aliased, ReadOnly};
use tock_registers::{register_bitfields, register_structs};

register_bitfields! {
    u32,
    DR [
        DATA OFFSET(0) NUMBITS(8) [],
    ],
    FR [
        /// Transmit FIFO full.
        TXFF OFFSET(5) NUMBITS(1) [
            Nonfull = 0,
            Full = 1,
        ],
    ],
}

register_structs! {
    UartRegisters {
        (0x00 => dr: Aliased<u32, DR::Register, DR::Register>),
        (0x04 => _unused0),
        (0x18 => fr: ReadOnly<u32, FR::Register>),
        (0x1C => @END),
    }
}

/// The underlying byte sink this wrapper drives: either the real
/// memory-mapped registers, or (for host unit tests) a plain byte buffer.
/// Both sides expose an identical `write_byte`, so every other module
/// writes through `Uart` without caring which backend is live.
enum Backend<'a> {
    Hardware(&'a mut UartRegisters),
    #[cfg(test)]
    Sink(&'a mut std::vec::Vec<u8>),
}

/// A driver for a single PL011 instance, or a test double standing in for
/// one.
pub struct Uart<'a> {
    backend: Backend<'a>,
}

impl<'a> Uart<'a> {
    /// Wraps the memory-mapped UART at `base_address`.
    ///
    /// # Safety
    /// * `base_address` must point to a valid, live PL011 register block.
    /// * The registers must not be accessed through any other reference
    ///   while this wrapper exists.
    #[must_use]
    pub unsafe fn new(base_address: NonNull<u8>) -> Self {
        let ptr = base_address.cast::<UartRegisters>();
        debug_assert!(ptr.as_ptr().is_aligned());
        Self {
            // SAFETY: forwarded from the caller.
            backend: Backend::Hardware(unsafe { &mut *ptr.as_ptr() }),
        }
    }

    /// A `Uart` backed by an in-memory buffer, for unit tests that need to
    /// observe what was written without real hardware.
    #[cfg(test)]
    #[must_use]
    pub fn test_sink(sink: &'a mut std::vec::Vec<u8>) -> Self {
        Self {
            backend: Backend::Sink(sink),
        }
    }

    /// Writes a single byte, blocking while the transmit FIFO is full. `\n`
    /// is expanded to `\r\n`, the one translation this device surface
    /// performs; every other byte (including guest MMIO writes routed
    /// through here) passes through unmodified.
    pub fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.write_raw_byte(b'\r');
        }
        self.write_raw_byte(byte);
    }

    fn write_raw_byte(&mut self, byte: u8) {
        match &mut self.backend {
            Backend::Hardware(registers) => {
                while registers.fr.matches_any(&[FR::TXFF::Full]) {
                    hint::spin_loop();
                }
                registers.dr.write(DR::DATA.val(byte.into()));
            }
            #[cfg(test)]
            Backend::Sink(buf) => buf.push(byte),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_byte(byte);
        }
    }
}

impl Write for Uart<'_> {
    fn write_str(&mut self, string: &str) -> fmt::Result {
        self.write_bytes(string.as_bytes());
        Ok(())
    }
}
