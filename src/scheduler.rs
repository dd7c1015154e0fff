//! The round-robin vCPU scheduler.
//!
//! Single hardware thread, cooperative except for asynchronous preemption
//! by the virtual timer. `sched` is the one rendezvous point called both
//! from the timer's EL2 IRQ handler and from the boot path to launch the
//! first vCPU; it never itself performs the `eret` — it hands the chosen
//! vCPU's register context back to the caller, which owns the world-switch.

use crate::vm::{Vcpu, VcpuRegs, VcpuState};

/// Upper bound on concurrently scheduled vCPUs, matching [`crate::vm::MAX_VCPUS`].
pub const MAX_SCHED_VCPUS: usize = crate::vm::MAX_VCPUS;

/// The result of a call to [`Scheduler::sched`]: the register context the
/// caller should load and `eret` into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub vcpu_id: u32,
    pub regs: VcpuRegs,
}

/// A strict round-robin run queue over a fixed set of vCPU slots.
pub struct Scheduler {
    queue: [Option<*mut Vcpu>; MAX_SCHED_VCPUS],
    count: usize,
    /// Index into `queue` of the vCPU most recently dispatched, or `None`
    /// if `sched` has never been called.
    current: Option<usize>,
}

impl Scheduler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: [None; MAX_SCHED_VCPUS],
            count: 0,
            current: None,
        }
    }

    /// Resets the run queue to empty. Called once at boot.
    pub fn sched_init(&mut self) {
        self.queue = [None; MAX_SCHED_VCPUS];
        self.count = 0;
        self.current = None;
    }

    /// Appends `vcpu` to the run queue and marks it runnable.
    ///
    /// # Safety
    /// `vcpu` must remain valid and must not be moved for as long as it
    /// stays in this scheduler's queue.
    ///
    /// # Panics
    /// Panics if the queue is already at [`MAX_SCHED_VCPUS`] capacity.
    pub unsafe fn sched_add_vcpu(&mut self, vcpu: &mut Vcpu) {
        assert!(self.count < MAX_SCHED_VCPUS, "scheduler run queue is full");
        vcpu.state = VcpuState::Runnable;
        self.queue[self.count] = Some(vcpu);
        self.count += 1;
    }

    /// The rendezvous point: saves the outgoing vCPU's context (if one was
    /// running), advances round-robin to the next runnable vCPU, and
    /// returns its context for the caller to load.
    ///
    /// `regs` is the trap frame just saved by the vector entry — the
    /// state the previously-running vCPU was in at the moment of
    /// preemption.
    ///
    /// # Panics
    /// Panics if the run queue is empty; `sched` is never called before at
    /// least one vCPU has been added.
    pub fn sched(&mut self, regs: &VcpuRegs) -> Dispatch {
        assert!(self.count > 0, "sched called with an empty run queue");

        if let Some(index) = self.current {
            // SAFETY: every stored pointer is valid for the scheduler's
            // lifetime per `sched_add_vcpu`'s contract.
            let current = unsafe { &mut *self.queue[index].expect("index within count") };
            if current.state == VcpuState::Running {
                current.regs = *regs;
                current.state = VcpuState::Runnable;
            }
        }

        let next_index = match self.current {
            Some(index) => (index + 1) % self.count,
            None => 0,
        };
        self.current = Some(next_index);

        // SAFETY: as above.
        let next = unsafe { &mut *self.queue[next_index].expect("index within count") };
        next.state = VcpuState::Running;
        Dispatch {
            vcpu_id: next.vcpu_id,
            regs: next.regs,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_vcpu_keeps_running_itself() {
        let mut a = Vcpu::new(0);
        let mut scheduler = Scheduler::new();
        scheduler.sched_init();
        // SAFETY: `a` outlives the scheduler within this test.
        unsafe { scheduler.sched_add_vcpu(&mut a) };

        let first = scheduler.sched(&VcpuRegs::zeroed());
        assert_eq!(first.vcpu_id, 0);
        let second = scheduler.sched(&first.regs);
        assert_eq!(second.vcpu_id, 0);
    }

    #[test]
    fn two_vcpus_alternate_in_round_robin_order() {
        let mut a = Vcpu::new(0);
        let mut b = Vcpu::new(1);
        let mut scheduler = Scheduler::new();
        scheduler.sched_init();
        // SAFETY: both outlive the scheduler within this test.
        unsafe {
            scheduler.sched_add_vcpu(&mut a);
            scheduler.sched_add_vcpu(&mut b);
        }

        let mut observed = std::vec::Vec::new();
        let mut regs = VcpuRegs::zeroed();
        for _ in 0..6 {
            let dispatch = scheduler.sched(&regs);
            observed.push(dispatch.vcpu_id);
            regs = dispatch.regs;
        }
        assert_eq!(observed, [0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn preemption_preserves_register_context() {
        let mut a = Vcpu::new(0);
        let mut b = Vcpu::new(1);
        let mut scheduler = Scheduler::new();
        scheduler.sched_init();
        // SAFETY: both outlive the scheduler within this test.
        unsafe {
            scheduler.sched_add_vcpu(&mut a);
            scheduler.sched_add_vcpu(&mut b);
        }

        let first = scheduler.sched(&VcpuRegs::zeroed());
        assert_eq!(first.vcpu_id, 0);

        let mut preempted = first.regs;
        preempted.x[5] = 0xDEAD_BEEF;
        let _second = scheduler.sched(&preempted); // switches to b, saving a's state

        // a's next quantum: one full round trip through b.
        let back_to_a = scheduler.sched(&VcpuRegs::zeroed());
        assert_eq!(back_to_a.vcpu_id, 0);
        assert_eq!(back_to_a.regs.x[5], 0xDEAD_BEEF);
    }
}
