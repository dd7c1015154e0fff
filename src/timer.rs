//! The architected virtual timer, programmed for a fixed 10 ms tick that
//! drives scheduler preemption.

use crate::regs;

/// Tick period, in Hz-divisor terms: the timer fires once per
/// `CNTFRQ_EL0 / TICK_DIVISOR` counter cycles, i.e. every 10 ms.
const TICK_DIVISOR: u64 = 100;

/// Reads the counter frequency, programs the virtual timer's countdown for
/// one tick, and enables it. The virtual timer interrupt itself is routed
/// to EL2 by the `HCR_EL2.IMO` bit, set during stage-1 bring-up; this
/// function only arms the countdown.
///
/// # Safety
/// Must run at EL2, after the exception vector base is installed (the
/// first tick must have somewhere to trap to).
pub unsafe fn timer_init() {
    // SAFETY: forwarded from the caller; EL2-only system registers.
    unsafe {
        let freq = regs::read_cntfrq_el0();
        regs::write_cntv_tval_el0(freq / TICK_DIVISOR);
        regs::write_cntv_ctl_el0(1);
    }
}

/// Re-arms the countdown for the next tick. Called from the timer's IRQ
/// handler: reaching zero leaves `CNTV_TVAL_EL0` free-running negative and
/// the interrupt asserted until the next value is written, so every tick
/// must reprogram the countdown or the same IRQ fires continuously.
///
/// # Safety
/// Must run at EL2.
pub unsafe fn timer_rearm() {
    // SAFETY: forwarded from the caller; EL2-only system registers.
    unsafe {
        let freq = regs::read_cntfrq_el0();
        regs::write_cntv_tval_el0(tick_countdown(freq));
    }
}

/// Computes the countdown value `timer_init` programs, for a given counter
/// frequency. Exposed separately so the arithmetic can be exercised on a
/// host target without touching any system register.
#[must_use]
pub const fn tick_countdown(cntfrq: u64) -> u64 {
    cntfrq / TICK_DIVISOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_is_one_hundredth_of_the_counter_frequency() {
        assert_eq!(tick_countdown(1_000_000), 10_000);
        assert_eq!(tick_countdown(62_500_000), 625_000);
    }
}
