//! Process management
//!
//! Processes form a tree: children are owned through the global table and
//! point back at their parent by id only, so no reference cycles arise.
//! The table, pid counter and every process's thread list are guarded by
//! the scheduler's task lock.

pub mod lifecycle;
pub mod pcb;
pub mod thread;

pub use pcb::Process;
pub use thread::Thread;

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread ID type (unique within a process)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All live processes, keyed by pid.
pub static PROCESS_TABLE: Mutex<BTreeMap<u64, Arc<Process>>> = Mutex::new(BTreeMap::new());

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Draw the next pid from the monotonic counter.
pub fn alloc_pid() -> ProcessId {
    ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

/// Look a process up by pid.
pub fn lookup(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&pid.0).cloned()
}

/// Register a process in the table.
pub fn insert(proc: Arc<Process>) {
    PROCESS_TABLE.lock().insert(proc.pid.0, proc);
}

/// Drop a process from the table, returning its last strong reference set.
pub fn remove(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().remove(&pid.0)
}

/// Snapshot of every live process (for SIGNAL fan-out).
pub fn all() -> alloc::vec::Vec<Arc<Process>> {
    PROCESS_TABLE.lock().values().cloned().collect()
}
