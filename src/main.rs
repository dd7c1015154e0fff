//! The `icevmm` binary: the reset vector (`boot.rs`), the exception vector
//! table and world-switch (`worldswitch.rs`), the embedded guest payload
//! (`guest_payload.rs`), and the boot sequence that wires together the
//! portable virtualization runtime exposed by the `icevmm` library crate.
//!
//! Split from the library for one reason: `boot.rs` and `worldswitch.rs`
//! are raw AArch64 `global_asm!` that only assembles for an `aarch64`
//! target. The library crate is compiled for the host target too (so its
//! `#[cfg(test)]` modules can run under a plain `cargo test`); folding
//! these two modules into it would break that. This binary's own `[[bin]]`
//! entry is marked `test = false` in `Cargo.toml` for the same reason.

#![no_std]
#![no_main]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic)]
#![feature(strict_provenance)]

use core::fmt::Write as _;
use core::panic::PanicInfo;
use core::ptr::{addr_of, without_provenance_mut};

use icevmm::scheduler::Scheduler;
use icevmm::stage2::Stage2Table;
use icevmm::sync::{InitCell, SpinLock};
use icevmm::uart::Uart;
use icevmm::vm::{VcpuRegs, Vm};
use icevmm::{exception, guest_payload, machine, pagealloc, regs, stage1, timer, vm};
use icevmm::{GUEST_NORMAL_BASE, PAGE_SIZE, UART_BASE};

mod boot;
mod worldswitch;

/// Linker-provided symbols consumed by this crate only (not the library):
/// the end of `.bss`, the top of the reserved hypervisor stack, and the
/// guest payload's bounds. `boot.rs`'s own copy of `__bss_start`/
/// `__bss_end` lives entirely in assembly and isn't repeated here.
mod symbols {
    extern "C" {
        pub static __stack_top: u8;
        pub static __exception_vectors: u8;
        pub static _guest_bin_start: u8;
        pub static _guest_bin_end: u8;
    }
}

/// Logs a message to the UART, then halts. The one error path this
/// hypervisor has: every fatal hypervisor condition (a boot precondition
/// violated, an unhandled trap) ends here, never in `panic!` (reserved for
/// genuine Rust-level invariant violations such as a failed
/// `debug_assert!`).
macro_rules! fatal {
    ($($arg:tt)*) => {{
        println!($($arg)*);
        machine::qemu_shutdown(false)
    }};
}

#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        let mut uart = unsafe { $crate::boot_uart() };
        let _ = writeln!(&mut uart, $($arg)*);
    }};
}

/// Wraps the UART at its fixed physical base. Cheap and stateless to
/// construct (a `Uart` is just a typed pointer), so every log site builds
/// its own rather than contending a shared static: the hypervisor never
/// logs from more than one place at a time (single core, interrupts
/// masked whenever a log site runs).
///
/// # Safety
/// Must only be called from code that is not concurrently accessing the
/// UART through another `Uart` value (true throughout this design: only
/// one hardware thread, and stage-1 has identity-mapped `UART_BASE` by the
/// time anything past early boot logs).
unsafe fn boot_uart() -> Uart<'static> {
    // SAFETY: `UART_BASE` is QEMU `virt`'s fixed PL011 register block;
    // forwarded from the caller for the no-concurrent-access requirement.
    unsafe { Uart::new(core::ptr::NonNull::new_unchecked(without_provenance_mut(UART_BASE as usize))) }
}

/// `HCR_EL2`: `RW` (bit 31, EL1 is AArch64), `VM` (bit 0, stage-2 on),
/// `IMO` (bit 4, virtual-timer/physical IRQs routed to EL2).
const HCR_EL2_VALUE: u64 = (1 << 31) | 1 | (1 << 4);

/// Byte length of guest RAM backing the embedded payload and its stack.
const GUEST_NORMAL_SIZE: u64 = 2 * 1024 * 1024;

/// Physical base of QEMU `virt`'s RAM, and the span this hypervisor treats
/// as available for the page allocator's arena. Mirrors `linker.ld`'s
/// `MEMORY` block; kept here rather than derived from a linker symbol
/// since nothing marks the end of usable RAM.
const RAM_BASE: u64 = 0x4000_0000;
const RAM_SIZE: u64 = 512 * 1024 * 1024;

/// The process-wide hypervisor state: the page allocator, the stage-2
/// tree, the VM (and, inside it, the vCPU table the scheduler's run queue
/// points into), and the scheduler itself. Built once in `main`, behind
/// `InitCell` + `SpinLock` per the design notes — a true lock is never
/// contended (single core, interrupts masked throughout), but this keeps
/// the access discipline in the type system rather than resting on a
/// `static mut`.
struct HypervisorState {
    allocator: pagealloc::PageAllocator,
    stage2: Stage2Table,
    vm: Vm,
    scheduler: Scheduler,
}

static HYPERVISOR: InitCell<SpinLock<HypervisorState>> = InitCell::new();

/// Called directly from `boot.rs` when `CurrentEL != 2`: logs a banner and
/// returns. `boot.rs`'s own `wfe` loop is the halt; this function's only
/// job is the diagnostic (scenario E5: "boot at wrong EL aborts").
#[no_mangle]
pub extern "C" fn wrong_el_handler() -> ! {
    println!("icevmm: fatal: not running at EL2, cannot continue");
    machine::qemu_shutdown(false)
}

/// The hypervisor's entire boot sequence. Called once, from `boot.rs`,
/// with interrupts masked, `.bss` zeroed, and the initial stack installed.
/// Never returns: the last step hands off into the guest (or, on fatal
/// error, halts via `machine::qemu_shutdown`).
#[no_mangle]
pub extern "C" fn main() -> ! {
    // Install the vector base first: every later step can trap, and a
    // trap with no vector base programmed is unrecoverable.
    // SAFETY: `__exception_vectors` is the linker-placed, 2 KiB-aligned
    // table `worldswitch.rs` defines; EL2 has not yet run any guest code
    // that could race this write.
    unsafe { regs::write_vbar_el2(addr_of!(symbols::__exception_vectors) as u64) };

    println!("icevmm: booting at EL2");

    // SAFETY: called exactly once, before any code depends on the
    // identity mapping or on caches being enabled.
    unsafe { stage1::stage1_init() };
    println!("icevmm: stage-1 MMU enabled");

    // SAFETY: taking the address of a linker-provided extern static, never
    // dereferenced.
    let stack_top = unsafe { addr_of!(symbols::__stack_top) } as usize;
    let arena_bound = usize::try_from(RAM_BASE + RAM_SIZE).expect("fits in usize on this target");
    let mut allocator = pagealloc::PageAllocator::empty();
    // SAFETY: `[stack_top, RAM_BASE + RAM_SIZE)` is reserved for the
    // allocator's arena alone: nothing else in this image is placed above
    // the hypervisor's own stack.
    unsafe { allocator.init(stack_top, arena_bound - stack_top) };

    let normal_pa = alloc_guest_ram(&allocator, GUEST_NORMAL_SIZE);
    install_guest_payload(normal_pa);

    let vm = vm::create_guest_vm(0, normal_pa, GUEST_NORMAL_SIZE);
    println!("icevmm: guest VM constructed, entry = {GUEST_NORMAL_BASE:#x}");

    // SAFETY: called once, after stage-1 bring-up.
    let mut stage2_table = match unsafe { Stage2Table::new(&allocator) } {
        Ok(table) => table,
        Err(pagealloc::OutOfMemory) => fatal!("icevmm: fatal: out of memory building stage-2 root"),
    };
    // SAFETY: runs at EL2, after stage-1, exactly once for this VM.
    if unsafe { stage2_table.s2_mmu_init(&allocator, &vm) }.is_err() {
        fatal!("icevmm: fatal: out of memory populating stage-2 tables");
    }
    println!("icevmm: stage-2 MMU enabled");

    // SAFETY: runs after the exception vector base is installed above.
    unsafe { timer::timer_init() };

    // SAFETY: EL2-only control registers, programmed once at boot before
    // any guest runs.
    unsafe {
        regs::write_hcr_el2(HCR_EL2_VALUE);
        regs::write_cptr_el2(0);
    }

    // SAFETY: `main` runs once; nothing has read `HYPERVISOR` yet.
    unsafe {
        HYPERVISOR.set(SpinLock::new(HypervisorState {
            allocator,
            stage2: stage2_table,
            vm,
            scheduler: Scheduler::new(),
        }));
    }

    let initial = {
        let mut state = HYPERVISOR.lock();
        let HypervisorState { scheduler, vm, .. } = &mut *state;
        scheduler.sched_init();
        for vcpu in vm.vcpus_mut().iter_mut().flatten() {
            // SAFETY: `vcpu` lives inside `vm`, which lives inside
            // `HYPERVISOR`'s `InitCell` for the remaining lifetime of the
            // hypervisor, and is never moved again.
            unsafe { scheduler.sched_add_vcpu(vcpu) };
        }
        scheduler.sched(&VcpuRegs::zeroed())
    };

    println!("icevmm: scheduler starting, first vcpu = {}", initial.vcpu_id);
    // SAFETY: the initial vCPU's `elr_el2`/`spsr_el2`/`sp_el1` were seeded
    // by `create_guest_vm`, and stage-2 translation for its regions is
    // already installed.
    unsafe { worldswitch::vcpu_run(&initial.regs) }
}

/// Draws `size` bytes (a whole number of 4 KiB pages) from `allocator` and
/// returns the physical base address of the first page. The bump
/// allocator's cursor only ever advances by exactly one page per call, so
/// consecutive calls are always contiguous — this is the one place that
/// invariant is relied on, to get a single contiguous backing region for
/// the guest's normal memory out of a page-at-a-time allocator.
fn alloc_guest_ram(allocator: &pagealloc::PageAllocator, size: u64) -> u64 {
    assert_eq!(size % PAGE_SIZE as u64, 0, "guest RAM size must be page-aligned");
    let mut base = None;
    for _ in 0..(size / PAGE_SIZE as u64) {
        // SAFETY: the allocator is exclusively used from this single boot
        // path at this point; nothing else has started running yet.
        let page = match unsafe { allocator.alloc_page() } {
            Ok(page) => page,
            Err(pagealloc::OutOfMemory) => fatal!("icevmm: fatal: out of memory allocating guest RAM"),
        };
        base.get_or_insert(page.as_ptr() as u64);
    }
    base.expect("size is nonzero")
}

/// Copies the embedded guest payload into guest RAM at `normal_pa`
/// (identity-mapped by stage-1, so the hypervisor can write through it
/// directly as a host pointer).
fn install_guest_payload(normal_pa: u64) {
    // SAFETY: reading the bounds of a linker-delimited section; no
    // pointer is dereferenced here, only its address taken.
    let guest_bin_len =
        unsafe { addr_of!(symbols::_guest_bin_end) as usize - addr_of!(symbols::_guest_bin_start) as usize };
    debug_assert_eq!(
        guest_bin_len,
        guest_payload::GUEST_PAYLOAD_LEN,
        "embedded guest payload and its linker-delimited section must agree on size"
    );
    assert!(guest_bin_len as u64 <= GUEST_NORMAL_SIZE, "guest payload must fit in guest RAM");
    // SAFETY: `normal_pa` was just drawn fresh from the page allocator
    // and is at least `GUEST_NORMAL_SIZE` (hence `GUEST_PAYLOAD_LEN`)
    // bytes, identity-mapped and writable under stage-1.
    unsafe { guest_payload::install(without_provenance_mut(normal_pa as usize)) };
}

/// Called by the vector entry with the just-saved trap frame for a
/// synchronous exception taken from the guest. Classifies it, applies any
/// handled-locally fixup (HVC, UART MMIO) in place, or halts.
fn dispatch_guest_trap(regs: &mut VcpuRegs) {
    // SAFETY: called from the synchronous vector entry immediately after
    // the trap, before anything else can overwrite these registers.
    let (esr, far) = unsafe { (regs::read_esr_el2(), regs::read_far_el2()) };
    // SAFETY: no other code accesses the UART concurrently (single core).
    let mut uart = unsafe { boot_uart() };
    match exception::dispatch(regs, &mut uart, esr, far) {
        exception::Outcome::Resume => {}
        exception::Outcome::Fatal => machine::qemu_shutdown(false),
    }
}

/// Called by the vector entry on the virtual-timer IRQ. Rearms the
/// timer, then runs the scheduler's rendezvous point, overwriting `regs`
/// in place with whichever vCPU's context should run next.
fn dispatch_timer_tick(regs: &mut VcpuRegs) {
    // SAFETY: EL2 IRQ context; rearming before reacting to the tick keeps
    // a slow scheduler pass from missing the window and double-firing.
    unsafe { timer::timer_rearm() };

    let mut state = HYPERVISOR.lock();
    let dispatch = state.scheduler.sched(regs);
    *regs = dispatch.regs;
}

/// Called for a vector this design never expects to take at all (a trap
/// raised by the hypervisor's own EL2 code, an AArch32 guest, FIQ,
/// SError). No register frame is available — these are unrecoverable
/// hypervisor bugs, not guest-induced conditions to inspect.
fn dispatch_fatal_trap() {
    // SAFETY: reading has no side effects and is always architecturally
    // valid, whatever trap reached here.
    let (esr, far) = unsafe { (regs::read_esr_el2(), regs::read_far_el2()) };
    println!("icevmm: fatal: unexpected hypervisor-level trap");
    println!("  ESR_EL2: {esr:#x}");
    println!("  FAR_EL2: {far:#x}");
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("icevmm: PANIC: {info}");
    machine::qemu_shutdown(false)
}

// `main.rs` itself has nothing host-testable: every function here either
// touches EL2 system registers or the real UART/MMIO, and this binary
// target is `test = false` in Cargo.toml so a plain `cargo test` never
// builds it. Its logic (the boot sequence's ordering, the dispatch glue)
// is exercised end-to-end by `tests/qemu.rs` under the `qemu-tests`
// feature; the portable pieces it calls into (the allocator, the walker,
// the scheduler, the trap dispatcher) have their own unit tests in the
// library crate.
