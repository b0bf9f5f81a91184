//! Boot sequencing
//!
//! One path from a fresh machine to a scheduled user process: physical
//! memory, kernel heap, filesystem, CPU state, secondary cores, then the
//! first process. The scheduler flag flips last; the next timer tick on
//! any core performs the first context switch.

use crate::{bootinfo::BootInfo, sched::percpu};

/// The architecture entry shims land here with the translated boot info.
pub fn kernel_main(info: BootInfo) -> ! {
    crate::bootinfo::init(info);
    println!("Hello world from Vesper!");

    crate::klog::init();

    crate::mm::frame::init();
    crate::mm::paging::init();
    crate::mm::heap::init();

    crate::fs::init();

    percpu::init_core(0);
    crate::arch::init();
    println!("[BOOT] architecture initialised");

    crate::arch::start_secondary_cores();

    match crate::process::lifecycle::task_init() {
        Ok(()) => {}
        Err(e) => {
            println!("[BOOT] no usable /init: {}", e);
            log::error!("boot halted: init process unavailable");
            crate::arch::halt();
        }
    }

    crate::sched::enable();
    println!("[BOOT] scheduler enabled");

    // This core idles until the tick hands it work.
    crate::arch::idle_loop();
}
