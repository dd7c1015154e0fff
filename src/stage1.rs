//! Stage-1 (hypervisor VA → PA) MMU bring-up.
//!
//! Identity-maps the first 3 GiB of physical address space with three
//! 1 GiB block descriptors at L1, programs `MAIR_EL2`/`TCR_EL2`, and
//! enables the MMU with caches on. No L2/L3 tables are needed: the entire
//! hypervisor's own address space is covered by L1 blocks.

use crate::regs;

/// `MAIR_EL2` attribute index 0: device-nGnRE.
const MAIR_ATTR0_DEVICE: u64 = 0x04;
/// `MAIR_EL2` attribute index 1: normal, write-back, inner/outer cacheable.
const MAIR_ATTR1_NORMAL: u64 = 0xFF;

/// `TCR_EL2`: `T0SZ = 25` (39-bit input address), 4 KiB granule (TG0 = 0b00),
/// inner-shareable (SH0 = 0b11), write-back inner/outer cacheable
/// (ORGN0/IRGN0 = 0b01), `PS = 0b010` (40-bit physical).
const TCR_EL2_VALUE: u64 = {
    let t0sz: u64 = 25;
    let irgn0_wb: u64 = 0b01 << 8;
    let orgn0_wb: u64 = 0b01 << 10;
    let sh0_inner: u64 = 0b11 << 12;
    let ps_40bit: u64 = 0b010 << 16;
    t0sz | irgn0_wb | orgn0_wb | sh0_inner | ps_40bit
};

/// Bits of an L1 block descriptor shared by every block this hypervisor
/// installs: valid, block (not table — bit 1 clear at L1), access flag.
const BLOCK_VALID_AF: u64 = 0b01 | (1 << 10);

/// Builds the L1 block descriptor for 1 GiB block index `block`, with
/// `mem_attr_index` selecting the `MAIR_EL2` entry and `shareability` the
/// stage-1 `SH` field (`0b11` inner-shareable for both attribute classes
/// this design uses).
const fn block_descriptor(block: u64, mem_attr_index: u64, shareability: u64) -> u64 {
    let output_address = block << 30;
    let attr_indx = mem_attr_index << 2;
    let sh = shareability << 8;
    output_address | sh | attr_indx | BLOCK_VALID_AF
}

/// Physical base address of the hypervisor's own image on QEMU `virt`.
/// Falls inside block 1, satisfying the invariant that the hypervisor
/// always executes from a mapped, normal-memory identity mapping.
pub const HYPERVISOR_IMAGE_BASE: u64 = 0x4000_0000;

const _: () = assert!(HYPERVISOR_IMAGE_BASE >= (1 << 30) && HYPERVISOR_IMAGE_BASE < (2 << 30));

/// A page-aligned, three-entry L1 table: block 0 (device, covers the UART
/// at `0x09000000`), blocks 1 and 2 (normal write-back, covering the
/// hypervisor's own image and guest RAM).
#[repr(C, align(4096))]
struct Stage1Table([u64; 512]);

const _: () = assert!(core::mem::size_of::<Stage1Table>() == crate::PAGE_SIZE);

static mut STAGE1_TABLE: Stage1Table = Stage1Table([0; 512]);

/// Brings up the hypervisor's own stage-1 translation and enables the
/// MMU, instruction cache, and data cache.
///
/// # Safety
/// Must be called exactly once, at EL2, before any code relies on the
/// identity mapping or on caching being enabled. Must not be called
/// concurrently with any other access to the static L1 table.
pub unsafe fn stage1_init() {
    // SAFETY: single-core, single call site; no other code touches
    // `STAGE1_TABLE` before this function installs it.
    let table = unsafe { &mut *core::ptr::addr_of_mut!(STAGE1_TABLE) };
    table.0[0] = block_descriptor(0, 0, 0b11);
    table.0[1] = block_descriptor(1, 1, 0b11);
    table.0[2] = block_descriptor(2, 1, 0b11);

    let table_pa = core::ptr::addr_of!(STAGE1_TABLE) as u64;

    // SAFETY: EL2-only system registers, programmed before the MMU is
    // enabled; barriers issued per the design's ordering contract.
    unsafe {
        regs::write_mair_el2((MAIR_ATTR1_NORMAL << 8) | MAIR_ATTR0_DEVICE);
        regs::write_tcr_el2(TCR_EL2_VALUE);
        regs::write_ttbr0_el2(table_pa);
        regs::dsb_sy();
        regs::isb();

        let sctlr = regs::read_sctlr_el2();
        // M (MMU enable, bit 0), C (data cache, bit 2), I (instruction
        // cache, bit 12).
        regs::write_sctlr_el2(sctlr | 0b1 | (1 << 2) | (1 << 12));
        regs::isb();
    }
}
