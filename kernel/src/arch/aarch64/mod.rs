//! AArch64 architecture backend
//!
//! The UEFI-style loader enters `_start` at EL1 with the MMU on: the
//! kernel image, all of DRAM and the peripheral window (GIC, PL011) are
//! linear-mapped in the high half through TTBR1, and x0 carries a
//! pointer to the boot record. TTBR0 is free for per-process user spaces
//! once boot hands the loader tables back.

pub mod boot;
pub mod context;
pub mod gic;
pub mod mmu;
pub mod serial;
pub mod smp;
pub mod timer;

use cortex_a::registers::{DAIF, TPIDR_EL1};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

/// Bring the boot core's CPU state up: exception vectors, the interrupt
/// controller and the EL1 physical timer. Interrupts stay masked until
/// the caller enables them.
pub fn init() {
    boot::install_vectors();
    gic::init();
    timer::init();
}

/// Stop this core for good.
pub fn halt() -> ! {
    loop {
        DAIF.modify(DAIF::I::Masked + DAIF::F::Masked);
        cortex_a::asm::wfe();
    }
}

/// Per-core idle loop: wait for interrupts, forever.
pub fn idle_loop() -> ! {
    loop {
        DAIF.modify(DAIF::I::Unmasked);
        cortex_a::asm::wfi();
    }
}

/// Run `f` with IRQs masked, restoring the previous mask state.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_masked = DAIF.is_set(DAIF::I);
    DAIF.modify(DAIF::I::Masked);
    let result = f();
    if !was_masked {
        DAIF.modify(DAIF::I::Unmasked);
    }
    result
}

/// Point TPIDR_EL1 at this core's `CoreBase`; the register survives every
/// TTBR switch, giving O(1) access from any kernel entry.
pub fn set_core_base(ptr: u64) {
    TPIDR_EL1.set(ptr);
}

pub fn core_base() -> u64 {
    TPIDR_EL1.get()
}

/// Kick the secondary cores through PSCI (see [`smp`]).
pub fn start_secondary_cores() {
    smp::start_cores();
}
