//! Thread control block

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use super::{ProcessId, ThreadId};
use crate::{arch::Context, ipc::ArgStack};

/// Pages mapped for each user stack.
pub const USER_STACK_PAGES: usize = 16;

/// Top of the first thread's stack; later stacks step down from here.
pub const USER_STACK_TOP_BASE: u64 = 0x0000_7FFF_FF00_0000;

/// Address-space distance between two threads' stacks (keeps an unmapped
/// gap between them).
pub const USER_STACK_STRIDE: u64 = 0x20_0000;

/// Stack top virtual address for a given thread id.
pub const fn stack_top_for(tid: u64) -> u64 {
    USER_STACK_TOP_BASE - (tid - 1) * USER_STACK_STRIDE
}

/// One schedulable thread.
///
/// Every live thread is in exactly one place: running on some core, queued
/// in the ready queue, or marked exiting and awaiting reap by the next
/// scheduler tick.
pub struct Thread {
    /// Thread id; rewritten only by exec when it renumbers the survivor.
    tid: AtomicU64,
    /// Owning process.
    pub pid: ProcessId,
    /// Set by `task_exit`; the scheduler reaps the thread on its next pass.
    pub exiting: AtomicBool,
    /// Handler threads receive a moved argument stack from their caller.
    pub is_ipc_handler: bool,
    /// Highest address of the thread's user stack mapping; rewritten only
    /// by exec when it rebuilds the survivor's stack.
    user_stack_top: AtomicU64,
    /// Saved interrupt frame; live only while the thread is off-core.
    pub context: Mutex<Context>,
    /// The thread's IPC argument stack (kernel-owned buffers).
    pub ipc_args: Mutex<ArgStack>,
}

impl Thread {
    pub fn new(
        tid: ThreadId,
        pid: ProcessId,
        is_ipc_handler: bool,
        user_stack_top: u64,
        context: Context,
    ) -> Self {
        Self {
            tid: AtomicU64::new(tid.0),
            pid,
            exiting: AtomicBool::new(false),
            is_ipc_handler,
            user_stack_top: AtomicU64::new(user_stack_top),
            context: Mutex::new(context),
            ipc_args: Mutex::new(ArgStack::new()),
        }
    }

    pub fn tid(&self) -> ThreadId {
        ThreadId(self.tid.load(Ordering::Relaxed))
    }

    pub fn stack_top(&self) -> u64 {
        self.user_stack_top.load(Ordering::Relaxed)
    }

    pub fn set_stack_top(&self, top: u64) {
        self.user_stack_top.store(top, Ordering::Relaxed);
    }

    /// Renumber the thread (exec resets the survivor to tid 1).
    pub fn set_tid(&self, tid: ThreadId) {
        self.tid.store(tid.0, Ordering::Relaxed);
    }

    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }
}
