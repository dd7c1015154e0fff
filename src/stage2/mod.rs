//! The stage-2 (guest IPA → host PA) translation tree and its walker.
//!
//! A tree of up to three levels (L1, L2, L3) of 512 entries each, 8 bytes
//! per entry. `s2_map` lazily allocates intermediate L2/L3 tables as it
//! walks, installing a `Table` descriptor the first time a path is
//! traversed and reusing it on every subsequent call — a `TABLE`
//! descriptor, once installed, is never rewritten.

pub mod entry;

use core::ptr::NonNull;

use crate::pagealloc::{OutOfMemory, PageAllocator};
use crate::PAGE_SIZE;

pub use entry::{PageAttr, Stage2Descriptor};

/// One level of the stage-2 tree: 512 64-bit entries, page-aligned so a
/// pointer to one is itself a valid table base address for `VTTBR_EL2` or
/// a parent entry's `ppn`.
#[repr(C, align(4096))]
struct Table([u64; 512]);

const _: () = assert!(core::mem::size_of::<Table>() == PAGE_SIZE);

/// Extracts the (l1, l2, l3) index triple from a 4 KiB-aligned IPA.
#[must_use]
fn indices(ipa: u64) -> (usize, usize, usize) {
    let l1 = usize::try_from((ipa >> 30) & 0x1FF).expect("masked to 9 bits");
    let l2 = usize::try_from((ipa >> 21) & 0x1FF).expect("masked to 9 bits");
    let l3 = usize::try_from((ipa >> 12) & 0x1FF).expect("masked to 9 bits");
    (l1, l2, l3)
}

/// Reconstructs a table pointer from a physical address. Valid once the
/// hypervisor's stage-1 identity map is active (PA == VA for this range);
/// in unit tests, `pa` is itself a host-heap address handed back by
/// [`PageAllocator`], so the same reconstruction is valid there too.
fn table_ptr(pa: u64) -> NonNull<Table> {
    let addr = usize::try_from(pa).expect("physical addresses fit in usize on this target");
    debug_assert_eq!(addr % PAGE_SIZE, 0, "table pointers are always page-aligned");
    // SAFETY: `addr` is nonzero (page zero is never handed out as a table:
    // the allocator's arena is anchored above the hypervisor image).
    unsafe { NonNull::new_unchecked(core::ptr::without_provenance_mut(addr)) }
}

/// Error returned when the walker needs a new table page and the
/// allocator is exhausted. Fatal at every real call site.
pub type WalkError = OutOfMemory;

/// The stage-2 translation tree for a single VM.
pub struct Stage2Table {
    root: NonNull<Table>,
}

impl Stage2Table {
    /// Allocates a fresh, all-invalid L1 root from `allocator`.
    ///
    /// # Safety
    /// `allocator` must remain valid and its pages must not be reused for
    /// anything else for the lifetime of this `Stage2Table`.
    pub unsafe fn new(allocator: &PageAllocator) -> Result<Self, WalkError> {
        // SAFETY: forwarded from the caller; the returned page is
        // immediately claimed as this table's exclusive root.
        let page = unsafe { allocator.alloc_page() }?;
        Ok(Self {
            root: page.cast(),
        })
    }

    /// The physical base address of the L1 root, suitable for programming
    /// into `VTTBR_EL2`.
    #[must_use]
    pub fn root_pa(&self) -> u64 {
        self.root.as_ptr() as u64
    }

    /// Returns a mutable reference to the table at `pa`, descending one
    /// walk level.
    fn table_mut(ptr: NonNull<Table>) -> &'static mut Table {
        // SAFETY: every `Table` this module hands pointers to was either
        // the root (exclusively owned by `self`) or allocated by this same
        // walker and reachable only through this tree; stage-2 tables are
        // never aliased outside of it.
        unsafe { &mut *ptr.as_ptr() }
    }

    /// Walks (allocating as needed) to the L3 slot for `ipa`, installing
    /// `Page(pa, attr)` there. Idempotent: calling this twice with the same
    /// arguments leaves the tree in the same state and allocates no new
    /// table pages on the second call.
    ///
    /// # Panics
    /// Panics if `ipa` or `pa` is not 4 KiB aligned; this is a programming
    /// error at every call site in this codebase, not a guest-induced
    /// condition.
    pub fn s2_map(
        &mut self,
        allocator: &PageAllocator,
        ipa: u64,
        pa: u64,
        attr: PageAttr,
    ) -> Result<(), WalkError> {
        assert_eq!(ipa % PAGE_SIZE as u64, 0, "ipa must be 4 KiB aligned");
        assert_eq!(pa % PAGE_SIZE as u64, 0, "pa must be 4 KiB aligned");

        let (l1, l2, l3) = indices(ipa);

        let l2_table = Self::descend(allocator, self.root, l1)?;
        let l3_table = Self::descend(allocator, l2_table, l2)?;

        let table = Self::table_mut(l3_table);
        table.0[l3] = Stage2Descriptor::Page(pa, attr).encode();
        Ok(())
    }

    /// Looks up the descriptor currently installed for `ipa`'s L3 slot,
    /// without allocating. Used by tests and by the dispatcher's "is this
    /// address actually mapped" checks.
    #[must_use]
    pub fn lookup(&self, ipa: u64) -> Stage2Descriptor {
        let (l1, l2, l3) = indices(ipa);

        let l1_table = Self::table_mut(self.root);
        let Stage2Descriptor::Table(l2_pa) = Stage2Descriptor::decode_table_level(l1_table.0[l1])
        else {
            return Stage2Descriptor::Invalid;
        };

        let l2_table = Self::table_mut(table_ptr(l2_pa));
        let Stage2Descriptor::Table(l3_pa) = Stage2Descriptor::decode_table_level(l2_table.0[l2])
        else {
            return Stage2Descriptor::Invalid;
        };

        let l3_table = Self::table_mut(table_ptr(l3_pa));
        Stage2Descriptor::decode_page_level(l3_table.0[l3])
    }

    /// Programs `MAIR_EL2`-equivalent attribute indices into `VTCR_EL2`'s
    /// companion `MAIR_EL2` (shared with stage-1: index 0 device, index 1
    /// normal write-back), the virtualization translation control
    /// register, and the virtualization translation table base, then maps
    /// every declared region of `vm` at 4 KiB granularity.
    ///
    /// # Safety
    /// Must run at EL2, after stage-1 bring-up, exactly once per VM.
    pub unsafe fn s2_mmu_init(
        &mut self,
        allocator: &PageAllocator,
        vm: &crate::vm::Vm,
    ) -> Result<(), WalkError> {
        // VTCR_EL2: T0SZ = 24 (40-bit IPA), 4 KiB granule (TG0 = 0b00),
        // start level such that a 3-level walk covers the IPA span
        // (SL0 = 0b01), inner-shareable, write-back inner/outer, PS = 40-bit.
        const VTCR_EL2_VALUE: u64 = {
            let t0sz: u64 = 24;
            let sl0: u64 = 0b01 << 6;
            let irgn0_wb: u64 = 0b01 << 8;
            let orgn0_wb: u64 = 0b01 << 10;
            let sh0_inner: u64 = 0b11 << 12;
            let ps_40bit: u64 = 0b010 << 16;
            t0sz | sl0 | irgn0_wb | orgn0_wb | sh0_inner | ps_40bit
        };

        // SAFETY: forwarded from the caller; EL2-only system registers,
        // barriers issued per the design's ordering contract.
        unsafe {
            crate::regs::write_mair_el2(0xFF_04);
            crate::regs::write_vtcr_el2(VTCR_EL2_VALUE);
            crate::regs::write_vttbr_el2(self.root_pa());
            crate::regs::dsb_sy();
            crate::regs::isb();
        }

        for region in vm.regions().iter().flatten() {
            let mut offset = 0;
            while offset < region.size {
                self.s2_map(allocator, region.ipa + offset, region.pa + offset, region.attr)?;
                offset += PAGE_SIZE as u64;
            }
        }

        // SAFETY: forwarded from the caller.
        unsafe { crate::regs::tlbi_vmalle1() };
        Ok(())
    }

    /// Follows (or installs) the `Table` descriptor at `table[index]`,
    /// returning a pointer to the next-level table.
    fn descend(
        allocator: &PageAllocator,
        table: NonNull<Table>,
        index: usize,
    ) -> Result<NonNull<Table>, WalkError> {
        let entry = Self::table_mut(table).0[index];
        match Stage2Descriptor::decode_table_level(entry) {
            Stage2Descriptor::Table(pa) => Ok(table_ptr(pa)),
            Stage2Descriptor::Invalid => {
                // SAFETY: the allocator outlives this tree (see `new`).
                let page = unsafe { allocator.alloc_page() }?;
                let pa = page.as_ptr() as u64;
                Self::table_mut(table).0[index] = Stage2Descriptor::Table(pa).encode();
                Ok(page.cast())
            }
            Stage2Descriptor::Page(..) => {
                unreachable!("L1/L2 entries are never installed as Page descriptors")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Arena {
        layout: Layout,
        ptr: *mut u8,
    }

    impl Arena {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout has nonzero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { layout, ptr }
        }

        fn allocator(&self) -> PageAllocator {
            let mut allocator = PageAllocator::empty();
            // SAFETY: arena is exclusively owned by the test for its
            // duration.
            unsafe { allocator.init(self.ptr as usize, self.layout.size()) };
            allocator
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            // SAFETY: matches the allocation in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn round_trip_maps_back_to_the_same_pa_and_attr() {
        let arena = Arena::new(16);
        let allocator = arena.allocator();
        // SAFETY: allocator outlives the table within this test.
        let mut table = unsafe { Stage2Table::new(&allocator) }.unwrap();

        let ipa = 0x0900_0000_u64;
        let pa = 0x2000_u64 + (arena.ptr as u64 & !0xFFF); // any aligned pa works for the walker
        table.s2_map(&allocator, ipa, pa, PageAttr::DEVICE_RW).unwrap();

        assert_eq!(table.lookup(ipa), Stage2Descriptor::Page(pa, PageAttr::DEVICE_RW));
    }

    #[test]
    fn idempotent_remap_allocates_no_new_tables() {
        let arena = Arena::new(16);
        let allocator = arena.allocator();
        // SAFETY: allocator outlives the table within this test.
        let mut table = unsafe { Stage2Table::new(&allocator) }.unwrap();

        let ipa = 0x4000_1000_u64;
        let pa = 0x4000_1000_u64;
        table.s2_map(&allocator, ipa, pa, PageAttr::NORMAL_RW).unwrap();

        // SAFETY: test-only probe of the allocator's own cursor.
        let cursor_after_first = unsafe { allocator.alloc_page() }.unwrap().as_ptr() as u64;

        table.s2_map(&allocator, ipa, pa, PageAttr::NORMAL_RW).unwrap();
        table.s2_map(&allocator, ipa, pa, PageAttr::NORMAL_RW).unwrap();

        // SAFETY: test-only probe of the allocator's own cursor.
        let cursor_after_remaps = unsafe { allocator.alloc_page() }.unwrap().as_ptr() as u64;
        assert_eq!(
            cursor_after_remaps - cursor_after_first,
            PAGE_SIZE as u64,
            "remapping an already-mapped ipa must not consume arena pages"
        );
        assert_eq!(table.lookup(ipa), Stage2Descriptor::Page(pa, PageAttr::NORMAL_RW));
    }

    #[test]
    fn table_descriptor_pointer_never_changes_across_remaps() {
        let arena = Arena::new(16);
        let allocator = arena.allocator();
        // SAFETY: allocator outlives the table within this test.
        let mut table = unsafe { Stage2Table::new(&allocator) }.unwrap();

        let ipa_a = 0x4000_0000_u64;
        let ipa_b = 0x4000_1000_u64; // shares L1/L2 with ipa_a, differs at L3

        table.s2_map(&allocator, ipa_a, 0x1000, PageAttr::NORMAL_RW).unwrap();
        let l1_table = Stage2Table::table_mut(table.root);
        let (l1, l2, _) = indices(ipa_a);
        let l2_pa_first = match Stage2Descriptor::decode_table_level(l1_table.0[l1]) {
            Stage2Descriptor::Table(pa) => pa,
            other => panic!("expected a table descriptor, got {other:?}"),
        };

        table.s2_map(&allocator, ipa_b, 0x2000, PageAttr::NORMAL_RW).unwrap();
        let l1_table = Stage2Table::table_mut(table.root);
        let l2_pa_second = match Stage2Descriptor::decode_table_level(l1_table.0[l1]) {
            Stage2Descriptor::Table(pa) => pa,
            other => panic!("expected a table descriptor, got {other:?}"),
        };
        assert_eq!(l2_pa_first, l2_pa_second);

        let l2_table = Stage2Table::table_mut(table_ptr(l2_pa_first));
        assert_ne!(
            Stage2Descriptor::decode_table_level(l2_table.0[l2]),
            Stage2Descriptor::Invalid
        );
    }

    /// `s2_mmu_init`'s register programming only runs meaningfully on real
    /// EL2 hardware; its region-mapping loop is the same `s2_map` already
    /// covered by `round_trip_maps_back_to_the_same_pa_and_attr` and
    /// `distinct_pages_in_the_same_l1_l2_region_coexist` above, applied
    /// region-by-region instead of page-by-page.
    #[test]
    fn declared_regions_map_page_by_page_like_mmu_init_does() {
        let arena = Arena::new(64);
        let allocator = arena.allocator();
        // SAFETY: allocator outlives the table within this test.
        let mut table = unsafe { Stage2Table::new(&allocator) }.unwrap();

        let normal_pa = arena.ptr as u64 & !0xFFF;
        let vm = crate::vm::create_guest_vm(0, normal_pa, 2 * PAGE_SIZE as u64);
        for region in vm.regions().iter().flatten() {
            let mut offset = 0;
            while offset < region.size {
                table
                    .s2_map(&allocator, region.ipa + offset, region.pa + offset, region.attr)
                    .unwrap();
                offset += PAGE_SIZE as u64;
            }
        }

        assert_eq!(
            table.lookup(crate::UART_BASE),
            Stage2Descriptor::Page(crate::UART_BASE, PageAttr::DEVICE_RW)
        );
        assert_eq!(
            table.lookup(crate::GUEST_NORMAL_BASE),
            Stage2Descriptor::Page(normal_pa, PageAttr::NORMAL_RW)
        );
    }

    #[test]
    fn distinct_pages_in_the_same_l1_l2_region_coexist() {
        let arena = Arena::new(16);
        let allocator = arena.allocator();
        // SAFETY: allocator outlives the table within this test.
        let mut table = unsafe { Stage2Table::new(&allocator) }.unwrap();

        table
            .s2_map(&allocator, 0x4000_0000, 0x5000_0000, PageAttr::NORMAL_RW)
            .unwrap();
        table
            .s2_map(&allocator, 0x4000_1000, 0x5000_1000, PageAttr::NORMAL_RW)
            .unwrap();

        assert_eq!(
            table.lookup(0x4000_0000),
            Stage2Descriptor::Page(0x5000_0000, PageAttr::NORMAL_RW)
        );
        assert_eq!(
            table.lookup(0x4000_1000),
            Stage2Descriptor::Page(0x5000_1000, PageAttr::NORMAL_RW)
        );
    }
}
