//! EL1 physical timer
//!
//! Programmed from the architected counter frequency for a 100 Hz tick.
//! Each expiry re-arms the downcounter and enters the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use cortex_a::registers::{CNTFRQ_EL0, CNTP_CTL_EL0, CNTP_TVAL_EL0};
use tock_registers::interfaces::{Readable, Writeable};

/// Scheduler tick rate.
const TICK_HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

fn reload() {
    let interval = CNTFRQ_EL0.get() / TICK_HZ;
    CNTP_TVAL_EL0.set(interval);
}

/// Arm the periodic tick on the calling core.
pub fn init() {
    reload();
    CNTP_CTL_EL0.write(CNTP_CTL_EL0::ENABLE::SET + CNTP_CTL_EL0::IMASK::CLEAR);
}

/// Re-arm after an expiry and count the tick.
pub fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    reload();
}

/// Ticks since boot, summed over all cores.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
