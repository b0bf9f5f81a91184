//! Per-core scheduler state
//!
//! Each core owns one [`CoreBase`], reachable in O(1) from any kernel entry
//! through an architecture register that survives `swapgs`/TTBR switches
//! (GS base on x86_64, TPIDR_EL1 on AArch64). The first three fields are
//! read and written from assembly; their offsets are part of the syscall
//! entry contract.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::process::Thread;

/// Maximum cores the kernel brings up.
pub const MAX_CORES: usize = 8;

/// Bytes per per-core kernel stack.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Byte offset of `kernel_stack_top` inside [`CoreBase`] (assembly ABI).
pub const CORE_BASE_KSTACK_OFFSET: usize = 8;

/// Byte offset of `saved_user_stack` inside [`CoreBase`] (assembly ABI).
pub const CORE_BASE_USTACK_OFFSET: usize = 16;

/// Per-core scratch structure.
#[repr(C)]
pub struct CoreBase {
    /// This core's id (index into [`CORE_BASES`]).
    core_id: AtomicU64,
    /// Top of this core's kernel stack; syscall entry loads RSP from here.
    kernel_stack_top: AtomicU64,
    /// Stash for the preempted user stack pointer across syscall entry.
    saved_user_stack: AtomicU64,
    /// Timer ticks that landed while this core had no thread to run.
    idle_ticks: AtomicU64,
    /// Thread currently running on this core; `None` while idle.
    current: Mutex<Option<Arc<Thread>>>,
}

impl CoreBase {
    const fn new() -> Self {
        Self {
            core_id: AtomicU64::new(0),
            kernel_stack_top: AtomicU64::new(0),
            saved_user_stack: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id.load(Ordering::Relaxed) as usize
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_top.load(Ordering::Relaxed)
    }

    /// Record a timer tick that found the core without a thread.
    pub fn note_idle_tick(&self) {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Ticks this core has spent idle since boot.
    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    /// Thread currently on this core, if any.
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }

    /// Take the current thread off the core.
    pub fn take_current(&self) -> Option<Arc<Thread>> {
        self.current.lock().take()
    }

    pub fn set_current(&self, thread: Option<Arc<Thread>>) {
        *self.current.lock() = thread;
    }
}

/// All core bases; index = core id.
pub static CORE_BASES: [CoreBase; MAX_CORES] = [const { CoreBase::new() }; MAX_CORES];

#[repr(C, align(16))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

static mut KERNEL_STACKS: [KernelStack; MAX_CORES] =
    [const { KernelStack([0; KERNEL_STACK_SIZE]) }; MAX_CORES];

/// Top of the kernel stack reserved for `core_id` (used both by core
/// bring-up and by the AP trampoline patcher).
pub fn kernel_stack_top_for(core_id: usize) -> u64 {
    // SAFETY: address computation only; each core uses just its own slot.
    unsafe {
        core::ptr::addr_of_mut!(KERNEL_STACKS[core_id])
            .add(1)
            .cast::<u8>() as u64
    }
}

/// Wire up `CORE_BASES[core_id]` for the calling core and point the
/// architecture's per-core register at it. Called once per core during
/// bring-up, before interrupts are enabled there.
pub fn init_core(core_id: usize) -> &'static CoreBase {
    let base = &CORE_BASES[core_id];
    base.core_id.store(core_id as u64, Ordering::Relaxed);
    base.kernel_stack_top
        .store(kernel_stack_top_for(core_id), Ordering::Relaxed);

    crate::arch::set_core_base(base as *const CoreBase as u64);
    base
}

/// The calling core's base.
pub fn current_core() -> &'static CoreBase {
    #[cfg(target_os = "none")]
    {
        let ptr = crate::arch::core_base() as *const CoreBase;
        // SAFETY: set_core_base stored a pointer into the static CORE_BASES
        // array during core bring-up.
        unsafe { &*ptr }
    }
    #[cfg(not(target_os = "none"))]
    {
        &CORE_BASES[0]
    }
}

/// How many cores finished bring-up.
pub static ONLINE_CORES: AtomicU64 = AtomicU64::new(0);

pub fn mark_online() {
    ONLINE_CORES.fetch_add(1, Ordering::SeqCst);
}

pub fn online_count() -> usize {
    ONLINE_CORES.load(Ordering::SeqCst) as usize
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn core_base_offsets_match_the_assembly_contract() {
        assert_eq!(
            core::mem::offset_of!(CoreBase, kernel_stack_top),
            CORE_BASE_KSTACK_OFFSET,
            "syscall entry loads RSP from this slot"
        );
        assert_eq!(
            core::mem::offset_of!(CoreBase, saved_user_stack),
            CORE_BASE_USTACK_OFFSET,
            "syscall entry parks the user RSP in this slot"
        );
    }

    #[test]
    fn per_core_stacks_do_not_overlap() {
        let mut tops: alloc::vec::Vec<u64> =
            (0..MAX_CORES).map(kernel_stack_top_for).collect();
        tops.sort_unstable();
        for pair in tops.windows(2) {
            assert!(
                pair[1] - pair[0] >= KERNEL_STACK_SIZE as u64,
                "adjacent stacks must be a full stack apart"
            );
        }
    }
}
