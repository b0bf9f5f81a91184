//! Scheduling
//!
//! One global FIFO ready queue, rotated by the per-core timer tick. All
//! scheduler state (queue, process list, service table, per-process thread
//! lists, address-space switches) is guarded by the single task lock; lock
//! holders run with interrupts disabled so a tick can never preempt a
//! critical section on its own core.

pub mod percpu;
pub mod queue;
pub mod scheduler;

pub use scheduler::{enable, is_enabled, task_switch};

use spin::Mutex;

/// The global task lock.
///
/// Acquire through [`with_task_lock`] outside interrupt context; interrupt
/// and syscall paths (which already run with interrupts off) may lock it
/// directly.
pub static TASK_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` under the task lock with interrupts disabled on this core.
pub fn with_task_lock<R>(f: impl FnOnce() -> R) -> R {
    crate::arch::without_interrupts(|| {
        let _guard = TASK_LOCK.lock();
        f()
    })
}
