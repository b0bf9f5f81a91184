//! Process control block

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{thread::Thread, ProcessId, ThreadId};
use crate::{elf::ImageRecord, mm::paging::AddressSpace};

/// One process: an address space, an image, and a list of threads.
pub struct Process {
    /// Process ID
    pub pid: ProcessId,
    /// Parent pid; `None` only for the first process.
    pub parent: Option<ProcessId>,
    /// Root page table of the process's address space. Replaced by exec.
    pub space: Mutex<AddressSpace>,
    /// Loaded executable, shared with forked children until exec.
    pub image: Mutex<Option<Arc<ImageRecord>>>,
    /// Registered IPC entry point; 0 when the process never registered.
    pub ipc_entry: AtomicU64,
    /// Live threads. Guarded by the task lock like the scheduler state.
    pub threads: Mutex<Vec<Arc<Thread>>>,
    /// Child pids; every child's `parent` points back here.
    pub children: Mutex<Vec<ProcessId>>,
    next_tid: AtomicU64,
}

impl Process {
    pub fn new(pid: ProcessId, parent: Option<ProcessId>, space: AddressSpace) -> Self {
        Self {
            pid,
            parent,
            space: Mutex::new(space),
            image: Mutex::new(None),
            ipc_entry: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            next_tid: AtomicU64::new(1),
        }
    }

    /// Next thread id within this process.
    pub fn alloc_tid(&self) -> ThreadId {
        ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed))
    }

    /// Restart thread numbering at 1 (exec path).
    pub fn reset_tids(&self) {
        self.next_tid.store(1, Ordering::Relaxed);
    }

    pub fn add_thread(&self, thread: Arc<Thread>) {
        self.threads.lock().push(thread);
    }

    pub fn remove_thread(&self, tid: ThreadId) {
        self.threads.lock().retain(|t| t.tid() != tid);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Registered IPC handler entry point, if any.
    pub fn ipc_entry_point(&self) -> Option<u64> {
        match self.ipc_entry.load(Ordering::Acquire) {
            0 => None,
            entry => Some(entry),
        }
    }

    pub fn set_ipc_entry(&self, entry: u64) {
        self.ipc_entry.store(entry, Ordering::Release);
    }

    pub fn add_child(&self, pid: ProcessId) {
        self.children.lock().push(pid);
    }

    pub fn remove_child(&self, pid: ProcessId) {
        self.children.lock().retain(|c| *c != pid);
    }
}
