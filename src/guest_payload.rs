//! The guest payload embedded in the image: the "hello HVC" scenario from
//! this design's end-to-end test matrix.
//!
//! Hand-assembled AArch64 machine code (no guest toolchain runs as part of
//! building this hypervisor) implementing:
//!
//! ```text
//! mov  w2, #0x47        ; 'G'
//! mov  x1, #0x09000000
//! strb w2, [x1]
//! hvc  #0
//! b    .
//! ```

/// The guest's machine code, placed at `_guest_bin_start` by the linker
/// script and copied to `GUEST_NORMAL_BASE` before the first `vcpu_run`.
#[link_section = ".guest_payload"]
#[used]
static GUEST_PAYLOAD: [u32; 5] = [
    0x5280_08E2, // movz w2, #0x47
    0xD2A1_2001, // movz x1, #0x0900, lsl #16
    0x3900_0022, // strb w2, [x1]
    0xD400_0002, // hvc #0
    0x1400_0000, // b .
];

/// Byte length of the embedded payload.
pub const GUEST_PAYLOAD_LEN: usize = core::mem::size_of_val(&GUEST_PAYLOAD);

/// Copies the embedded payload to `dest`, which must be at least
/// [`GUEST_PAYLOAD_LEN`] bytes and writable (normal guest RAM already
/// identity-mapped in the hypervisor's own stage-1 table).
///
/// # Safety
/// `dest` must point to at least `GUEST_PAYLOAD_LEN` bytes of valid,
/// writable, hypervisor-accessible memory, exclusively owned for the
/// duration of this call.
pub unsafe fn install(dest: *mut u8) {
    // SAFETY: forwarded from the caller; `GUEST_PAYLOAD` is a valid source
    // of exactly `GUEST_PAYLOAD_LEN` bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(GUEST_PAYLOAD.as_ptr().cast::<u8>(), dest, GUEST_PAYLOAD_LEN);
    }
}
