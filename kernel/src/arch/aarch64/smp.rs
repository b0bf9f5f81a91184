//! Secondary-core bring-up via PSCI
//!
//! Each core is started with PSCI `CPU_ON` (SMC conduit), entering
//! `secondary_start` with its core id in the context register. The entry
//! shim adopts the per-core kernel stack and falls into [`ap_main`].

use core::arch::global_asm;

use crate::sched::percpu::{self, MAX_CORES};

/// PSCI 0.2 CPU_ON function id (SMC64).
const PSCI_CPU_ON: u64 = 0xC400_0003;

/// PSCI success return.
const PSCI_SUCCESS: i64 = 0;

global_asm!(
    ".global secondary_start",
    "secondary_start:",
    // x0 = core id (CPU_ON context argument).
    "mov x19, x0",
    "adrp x1, secondary_stack_ptr",
    "add x1, x1, :lo12:secondary_stack_ptr",
    "ldr x1, [x1]",
    "mov sp, x1",
    "mov x0, x19",
    "b {ap_main}",
    ap_main = sym ap_main,
);

extern "C" {
    fn secondary_start();
}

/// Stack handed to the next starting core; rewritten before each CPU_ON.
#[no_mangle]
#[allow(non_upper_case_globals)]
static mut secondary_stack_ptr: u64 = 0;

fn psci_cpu_on(target_mpidr: u64, entry: u64, context: u64) -> i64 {
    let result: i64;
    // SAFETY: SMC into the PSCI firmware interface; registers per the
    // SMC64 calling convention.
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") PSCI_CPU_ON => result,
            in("x1") target_mpidr,
            in("x2") entry,
            in("x3") context,
        );
    }
    result
}

fn busy_wait(loops: u64) {
    for _ in 0..loops {
        core::hint::spin_loop();
    }
}

/// Start every secondary core (MPIDR affinity 0 = core index on the QEMU
/// virt machine).
pub fn start_cores() {
    for core_id in 1..MAX_CORES {
        // SAFETY: rewritten strictly before the matching CPU_ON; the
        // target core reads it exactly once from its entry shim.
        unsafe {
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!(secondary_stack_ptr),
                percpu::kernel_stack_top_for(core_id),
            );
        }

        let entry = secondary_start as usize as u64;
        let ret = psci_cpu_on(core_id as u64, entry, core_id as u64);
        if ret != PSCI_SUCCESS {
            // Fewer cores than MAX_CORES; stop asking.
            break;
        }

        let target = percpu::online_count() + 1;
        let mut spins = 0;
        while percpu::online_count() < target && spins < 64 {
            busy_wait(1_000_000);
            spins += 1;
        }
    }
    println!("[SMP] {} core(s) online", percpu::online_count() + 1);
}

/// First Rust code on a fresh core: per-core state, vectors, interrupt
/// controller and timer, then halt until scheduled.
extern "C" fn ap_main(core_id: u64) -> ! {
    percpu::init_core(core_id as usize);
    super::boot::install_vectors();
    super::gic::enable_cpu_interface();
    super::gic::enable_intid(super::gic::TIMER_INTID);
    super::timer::init();
    percpu::mark_online();
    super::idle_loop();
}
