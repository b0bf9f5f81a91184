//! The global ready queue
//!
//! Strict first-in first-out: the scheduler pops from the head and appends
//! preempted threads at the tail, so each timer tick rotates exactly one
//! thread.

use alloc::{collections::VecDeque, sync::Arc};

use spin::Mutex;

use crate::process::{Thread, ThreadId};

pub static READY_QUEUE: Mutex<VecDeque<Arc<Thread>>> = Mutex::new(VecDeque::new());

/// Append a runnable thread at the tail.
pub fn enqueue(thread: Arc<Thread>) {
    READY_QUEUE.lock().push_back(thread);
}

/// Pop the head of the queue.
pub fn pop() -> Option<Arc<Thread>> {
    READY_QUEUE.lock().pop_front()
}

pub fn is_empty() -> bool {
    READY_QUEUE.lock().is_empty()
}

/// Drop a specific thread from the queue (thread deletion path).
pub fn remove(pid: crate::process::ProcessId, tid: ThreadId) {
    READY_QUEUE
        .lock()
        .retain(|t| !(t.pid == pid && t.tid() == tid));
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{arch::Context, process::ProcessId};

    fn thread(pid: u64, tid: u64) -> Arc<Thread> {
        Arc::new(Thread::new(
            ThreadId(tid),
            ProcessId(pid),
            false,
            0,
            Context::default(),
        ))
    }

    #[test]
    fn fifo_order_is_preserved() {
        let _guard = crate::lock_global_state_for_test();
        READY_QUEUE.lock().clear();
        enqueue(thread(1, 1));
        enqueue(thread(1, 2));
        enqueue(thread(2, 1));

        assert_eq!(pop().expect("head").tid(), ThreadId(1));
        assert_eq!(pop().expect("second").tid(), ThreadId(2));
        assert_eq!(pop().expect("third").pid, ProcessId(2));
        assert!(pop().is_none());
    }

    #[test]
    fn remove_targets_one_thread() {
        let _guard = crate::lock_global_state_for_test();
        READY_QUEUE.lock().clear();
        enqueue(thread(1, 1));
        enqueue(thread(1, 2));
        remove(ProcessId(1), ThreadId(1));

        assert_eq!(READY_QUEUE.lock().len(), 1);
        assert_eq!(pop().expect("survivor").tid(), ThreadId(2));
    }
}
