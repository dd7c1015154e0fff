//! The VM and vCPU data model: the structures a VM is built from, and
//! `create_guest_vm`, which wires up the single supported guest.

use crate::stage2::PageAttr;
use crate::{GUEST_NORMAL_BASE, PAGE_SIZE, UART_BASE};

/// Upper bound on vCPUs per VM. Matches the scheduler's run-queue capacity
/// (`MAX_SCHED_VCPUS` in this design's prototype ancestor); `create_guest_vm`
/// only ever populates the first slot; a caller wanting the multi-vCPU
/// scheduler-fairness scenario populates more via [`Vm::add_vcpu`].
pub const MAX_VCPUS: usize = 8;

/// Upper bound on memory regions per VM.
pub const MAX_MEM_REGS: usize = 16;

/// A contiguous guest memory region: guest-physical base, host-physical
/// base, size, and the stage-2 attributes to map it with.
///
/// Invariant (enforced by [`Vm::add_region`]): regions for a given VM are
/// non-overlapping in IPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub ipa: u64,
    pub pa: u64,
    pub size: u64,
    pub attr: PageAttr,
}

impl MemRegion {
    /// True if `[self.ipa, self.ipa + self.size)` and `[other.ipa, other.ipa
    /// + other.size)` share any address.
    #[must_use]
    fn overlaps(&self, other: &Self) -> bool {
        self.ipa < other.ipa + other.size && other.ipa < self.ipa + self.size
    }
}

/// A vCPU's full register context: the 31 general-purpose registers, the
/// exception link register, the saved program status, and the guest-EL1
/// stack pointer.
///
/// This is simultaneously the trap frame written by the exception vector
/// entry and the launch state consumed by `vcpu_run`; the field order here
/// is the single source of truth the save/restore assembly in the binary
/// crate is written against. `#[repr(C)]` with only `u64` fields gives a
/// predictable, padding-free layout: field `i` sits at byte offset `8*i`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuRegs {
    pub x: [u64; 31],
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub sp_el1: u64,
}

/// Byte offset of field `x[i]` within [`VcpuRegs`], for the save/restore
/// assembly to reference. Exists so that assembly and this struct cannot
/// silently drift: a change to `VcpuRegs`'s field order breaks this
/// constant's documented values, not just the assembly's assumptions.
impl VcpuRegs {
    pub const OFFSET_X: usize = 0;
    pub const OFFSET_ELR_EL2: usize = 31 * 8;
    pub const OFFSET_SPSR_EL2: usize = 32 * 8;
    pub const OFFSET_SP_EL1: usize = 33 * 8;
    /// Total size of the trap frame, in bytes. The vector entry reserves
    /// exactly this much per-core stack space for each nested exception.
    pub const FRAME_SIZE: usize = 34 * 8;

    /// All-zero register state; `elr_el2`/`spsr_el2`/`sp_el1` must be set
    /// before this is ever passed to `vcpu_run`.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 31],
            elr_el2: 0,
            spsr_el2: 0,
            sp_el1: 0,
        }
    }
}

const _: () = assert!(core::mem::size_of::<VcpuRegs>() == VcpuRegs::FRAME_SIZE);
const _: () = assert!(core::mem::offset_of!(VcpuRegs, elr_el2) == VcpuRegs::OFFSET_ELR_EL2);
const _: () = assert!(core::mem::offset_of!(VcpuRegs, spsr_el2) == VcpuRegs::OFFSET_SPSR_EL2);
const _: () = assert!(core::mem::offset_of!(VcpuRegs, sp_el1) == VcpuRegs::OFFSET_SP_EL1);

/// `SPSR_EL2` value used for every vCPU this design launches: EL1h (using
/// `SP_EL1`), all DAIF interrupts masked. The canonical value per this
/// design's resolution of its SPSR ambiguity; `0x5` (no interrupt mask)
/// appears in an earlier revision and is not used here.
pub const SPSR_EL1H_MASKED: u64 = 0x3C5;

/// A vCPU's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Running,
    Runnable,
    Blocked,
}

/// A single virtual CPU.
#[derive(Debug, Clone, Copy)]
pub struct Vcpu {
    pub vcpu_id: u32,
    pub regs: VcpuRegs,
    pub state: VcpuState,
}

impl Vcpu {
    #[must_use]
    pub const fn new(vcpu_id: u32) -> Self {
        Self {
            vcpu_id,
            regs: VcpuRegs::zeroed(),
            state: VcpuState::Blocked,
        }
    }
}

/// A virtual machine: its identity, its vCPUs, and its declared memory
/// regions. The VM exclusively owns both; stage-2 page tables are
/// constructed from `mem_regs` but owned separately (this design supports
/// a single VM instance with one global stage-2 root).
pub struct Vm {
    pub vmid: u32,
    vcpus: [Option<Vcpu>; MAX_VCPUS],
    num_vcpus: usize,
    mem_regs: [Option<MemRegion>; MAX_MEM_REGS],
    num_mem_regs: usize,
}

impl Vm {
    #[must_use]
    pub const fn new(vmid: u32) -> Self {
        Self {
            vmid,
            vcpus: [None; MAX_VCPUS],
            num_vcpus: 0,
            mem_regs: [None; MAX_MEM_REGS],
            num_mem_regs: 0,
        }
    }

    /// Appends `vcpu`. Panics if the VM already has `MAX_VCPUS` vCPUs.
    pub fn add_vcpu(&mut self, vcpu: Vcpu) -> &mut Vcpu {
        assert!(self.num_vcpus < MAX_VCPUS, "VM vCPU table is full");
        self.vcpus[self.num_vcpus] = Some(vcpu);
        let slot = self.vcpus[self.num_vcpus].as_mut().expect("just inserted");
        self.num_vcpus += 1;
        slot
    }

    #[must_use]
    pub fn vcpus(&self) -> &[Option<Vcpu>] {
        &self.vcpus[..self.num_vcpus]
    }

    #[must_use]
    pub fn vcpus_mut(&mut self) -> &mut [Option<Vcpu>] {
        &mut self.vcpus[..self.num_vcpus]
    }

    /// Declares a new, non-overlapping memory region. Panics if it overlaps
    /// an existing region or the region table is full — both are
    /// programming errors in this single-VM design, not guest-induced
    /// conditions.
    pub fn add_region(&mut self, region: MemRegion) {
        assert!(self.num_mem_regs < MAX_MEM_REGS, "VM region table is full");
        for existing in self.mem_regs[..self.num_mem_regs].iter().flatten() {
            assert!(
                !existing.overlaps(&region),
                "memory regions declared for a VM must not overlap in IPA"
            );
        }
        self.mem_regs[self.num_mem_regs] = Some(region);
        self.num_mem_regs += 1;
    }

    #[must_use]
    pub fn regions(&self) -> &[Option<MemRegion>] {
        &self.mem_regs[..self.num_mem_regs]
    }
}

/// Builds the single guest VM this hypervisor supports:
///
/// * a device region mapping one 4 KiB page at IPA `UART_BASE` to PA
///   `UART_BASE` with device attributes (the emulated UART page), and
/// * a normal-memory region at IPA `GUEST_NORMAL_BASE` of `normal_size`
///   bytes, backed by `normal_pa` (pages the caller has already drawn from
///   the page allocator).
///
/// The primary vCPU is seeded with `elr_el2 = GUEST_NORMAL_BASE`,
/// `spsr_el2 = SPSR_EL1H_MASKED`, and `sp_el1` at the top of the normal
/// region (a default the guest is free to overwrite; this design does not
/// mandate guest stack-pointer initialisation).
#[must_use]
pub fn create_guest_vm(vmid: u32, normal_pa: u64, normal_size: u64) -> Vm {
    assert_eq!(normal_size % PAGE_SIZE as u64, 0);

    let mut vm = Vm::new(vmid);
    vm.add_region(MemRegion {
        ipa: UART_BASE,
        pa: UART_BASE,
        size: PAGE_SIZE as u64,
        attr: PageAttr::DEVICE_RW,
    });
    vm.add_region(MemRegion {
        ipa: GUEST_NORMAL_BASE,
        pa: normal_pa,
        size: normal_size,
        attr: PageAttr::NORMAL_RW,
    });

    let mut primary = Vcpu::new(0);
    primary.regs.elr_el2 = GUEST_NORMAL_BASE;
    primary.regs.spsr_el2 = SPSR_EL1H_MASKED;
    primary.regs.sp_el1 = GUEST_NORMAL_BASE + normal_size;
    primary.state = VcpuState::Runnable;
    vm.add_vcpu(primary);

    vm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_guest_vm_has_uart_and_normal_regions() {
        let vm = create_guest_vm(0, 0x5000_0000, 0x10_0000);
        let regions: std::vec::Vec<_> = vm.regions().iter().flatten().copied().collect();
        assert_eq!(regions.len(), 2);
        assert!(regions.iter().any(|r| r.ipa == UART_BASE && r.attr == PageAttr::DEVICE_RW));
        assert!(regions
            .iter()
            .any(|r| r.ipa == GUEST_NORMAL_BASE && r.attr == PageAttr::NORMAL_RW));
    }

    #[test]
    fn create_guest_vm_seeds_primary_vcpu() {
        let vm = create_guest_vm(0, 0x5000_0000, 0x10_0000);
        let vcpu = vm.vcpus()[0].expect("primary vcpu present");
        assert_eq!(vcpu.regs.elr_el2, GUEST_NORMAL_BASE);
        assert_eq!(vcpu.regs.spsr_el2, SPSR_EL1H_MASKED);
        assert_eq!(vcpu.regs.sp_el1, GUEST_NORMAL_BASE + 0x10_0000);
        assert_eq!(vcpu.state, VcpuState::Runnable);
    }

    #[test]
    #[should_panic(expected = "must not overlap")]
    fn overlapping_regions_panic() {
        let mut vm = Vm::new(0);
        vm.add_region(MemRegion {
            ipa: 0x1000,
            pa: 0x1000,
            size: 0x2000,
            attr: PageAttr::NORMAL_RW,
        });
        vm.add_region(MemRegion {
            ipa: 0x2000,
            pa: 0x9000,
            size: 0x1000,
            attr: PageAttr::NORMAL_RW,
        });
    }

    #[test]
    fn trap_frame_layout_matches_assembly_offsets() {
        let mut regs = VcpuRegs::zeroed();
        for i in 0..31 {
            regs.x[i] = u64::try_from(i).unwrap() + 1;
        }
        regs.elr_el2 = 0xAAAA;
        regs.spsr_el2 = 0xBBBB;
        regs.sp_el1 = 0xCCCC;

        // Simulate what the vector entry's save path does: treat the
        // struct as a flat byte buffer and read back through the
        // documented offsets.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (&regs as *const VcpuRegs).cast::<u8>(),
                VcpuRegs::FRAME_SIZE,
            )
        };
        for i in 0..31 {
            let offset = VcpuRegs::OFFSET_X + i * 8;
            let value = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            assert_eq!(value, regs.x[i]);
        }
        let read_u64 = |offset: usize| {
            u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
        };
        assert_eq!(read_u64(VcpuRegs::OFFSET_ELR_EL2), 0xAAAA);
        assert_eq!(read_u64(VcpuRegs::OFFSET_SPSR_EL2), 0xBBBB);
        assert_eq!(read_u64(VcpuRegs::OFFSET_SP_EL1), 0xCCCC);
    }
}
