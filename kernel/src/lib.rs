//! Vesper kernel library
//!
//! A small multi-architecture microkernel: physical frames behind a
//! bitmap, per-process address spaces with copy-on-write fork, an
//! intrusive free-list heap, a tar-fed RAMFS, an ELF loader, a FIFO
//! round-robin scheduler and argument-stack IPC. User processes talk to
//! each other only through kernel-mediated messages.
//!
//! The crate builds for bare x86_64 and AArch64; on the host it links the
//! system allocator so the unit tests run under the standard harness.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod bootstrap;
pub mod elf;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;

/// The kernel heap, global allocator on bare metal.
#[cfg_attr(target_os = "none", global_allocator)]
pub static HEAP: mm::heap::LockedKernelHeap = mm::heap::LockedKernelHeap::new();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Serialises unit tests that touch module-global kernel state (mount
/// table, service table, ready queue, log buffer). On the target these
/// structures are guarded by boot ordering and the task lock; the host
/// test harness runs threads instead.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) static GLOBAL_STATE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn lock_global_state_for_test() -> std::sync::MutexGuard<'static, ()> {
    GLOBAL_STATE_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared fixture for tests that drive the paging and process machinery:
/// a synthetic physical arena resolved through the boot record, with the
/// global frame allocator initialised over it.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support {
    use crate::{
        bootinfo::{self, MemoryMapEntry, MEMORY_TYPE_CONVENTIONAL},
        mm::{frame::FRAME_ALLOCATOR, PAGE_SIZE},
    };

    /// Provide 512 synthetic frames at "phys" 0x1000, backed by a leaked
    /// host allocation so `phys_to_virt` resolves exactly as on the
    /// target. Idempotent; callers hold the global test lock.
    pub(crate) fn setup_phys_arena() {
        static SETUP: std::sync::Once = std::sync::Once::new();
        SETUP.call_once(|| {
            let words = alloc::vec![0u64; 513 * PAGE_SIZE / 8].leak();
            let base = words.as_ptr() as u64;

            let map = bootinfo::store_memory_map(
                [MemoryMapEntry {
                    kind: MEMORY_TYPE_CONVENTIONAL,
                    physical_start: PAGE_SIZE as u64,
                    number_of_pages: 512,
                }]
                .into_iter(),
            );
            bootinfo::init(bootinfo::BootInfo {
                physical_memory_offset: base,
                framebuffer: None,
                memory_map: map,
                initrd: None,
                acpi_rsdp: None,
            });

            let mut pfa = FRAME_ALLOCATOR.lock();
            pfa.init_from_map(map, bootinfo::phys_to_virt)
                .expect("synthetic map init");
            pfa.enable_refcounts(bootinfo::phys_to_virt)
                .expect("refcount storage fits");
        });
    }
}

/// Heap allocation failure is unrecoverable in a kernel; report and stop.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
