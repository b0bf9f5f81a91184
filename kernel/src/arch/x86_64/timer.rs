//! Local APIC timer tick
//!
//! Each core runs its own periodic timer; every tick enters the scheduler
//! through the stub in `idt.rs`. The initial count targets roughly 100 Hz
//! on QEMU's bus clock (calibration against the PIT is deliberately
//! skipped; the tick only has to be periodic, not precise).

use core::sync::atomic::{AtomicU64, Ordering};

use super::apic;

/// Initial count for the divide-by-16 APIC timer.
const TIMER_INITIAL_COUNT: u32 = 0x0060_0000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Start the periodic tick on the calling core.
pub fn init() {
    apic::start_timer(TIMER_INITIAL_COUNT);
}

pub fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot, summed over all cores.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
