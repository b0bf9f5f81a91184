//! x86_64 architecture backend

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod mmu;
pub mod serial;
pub mod smp;
pub mod syscall;
pub mod timer;

use x86_64::registers::model_specific::{GsBase, KernelGsBase};

/// Bring the boot core's CPU state up: descriptor tables, syscall MSRs,
/// local APIC and its timer. Interrupts stay off until the caller enables
/// them.
pub fn init() {
    gdt::init(0);
    idt::init();
    syscall::init();
    apic::init();
    timer::init();
}

/// Stop this core for good.
pub fn halt() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Per-core idle loop: sleep until the next interrupt, forever. The
/// scheduler resumes a real thread from the timer tick.
pub fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Point GS at this core's `CoreBase`.
///
/// In-kernel convention: GS base holds the CoreBase pointer, the swapped
/// slot holds the user value; every entry from ring 3 runs `swapgs` so the
/// first kernel instruction already sees kernel state.
pub fn set_core_base(ptr: u64) {
    GsBase::write(::x86_64::VirtAddr::new(ptr));
    KernelGsBase::write(::x86_64::VirtAddr::new(0));
}

/// This core's `CoreBase` pointer, O(1) from any kernel entry.
pub fn core_base() -> u64 {
    GsBase::read().as_u64()
}

/// Kick the application processors (see [`smp`]).
pub fn start_secondary_cores() {
    smp::start_cores();
}
