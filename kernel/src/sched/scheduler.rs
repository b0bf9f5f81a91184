//! The context-switch path
//!
//! `task_switch` runs on every timer tick and explicit yield, and is the
//! only place that mutates any core's current thread. It reaps exiting
//! threads, rotates the preempted thread to the queue tail, installs the
//! next thread's address space, and rewrites the interrupt frame so the
//! return-from-interrupt lands in the chosen thread.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{percpu, queue, TASK_LOCK};
use crate::{arch::Context, mm::paging, process};

/// Off until boot sequencing flips it; the first tick afterwards performs
/// the first context switch.
static SCHED_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    SCHED_ENABLED.store(true, Ordering::Release);
}

pub fn is_enabled() -> bool {
    SCHED_ENABLED.load(Ordering::Acquire)
}

/// Rotate the calling core to the next runnable thread.
///
/// Must run with interrupts disabled on this core (interrupt/syscall
/// entries guarantee that). `frame` is the preempted context; on return it
/// holds the context to resume.
pub fn task_switch(frame: &mut Context) {
    let core = percpu::current_core();
    // A tick that lands with no thread on core is idle time.
    if core.current_thread().is_none() {
        core.note_idle_tick();
    }

    if !is_enabled() {
        return;
    }
    let _guard = TASK_LOCK.lock();

    let mut current = core.take_current();

    // Reap an exiting thread before anything else; its process may die
    // with it, so step onto the kernel tables first.
    if current.as_ref().is_some_and(|t| t.is_exiting()) {
        paging::kernel_space().make_current();
        let dead = current.take().expect("checked above");
        crate::process::lifecycle::reap_thread(&dead);
    }

    if let Some(thread) = current.take() {
        if queue::is_empty() {
            // Nothing else to run; keep the current thread on core with
            // its live frame untouched.
            core.set_current(Some(thread));
            return;
        }
        *thread.context.lock() = *frame;
        queue::enqueue(thread);
    }

    match queue::pop() {
        Some(next) => {
            if let Some(proc) = process::lookup(next.pid) {
                proc.space.lock().make_current();
            }
            *frame = *next.context.lock();
            core.set_current(Some(next));
        }
        None => {
            // Idle fall-back: a synthetic frame resuming the per-core halt
            // loop on the kernel stack.
            paging::kernel_space().make_current();
            *frame = Context::idle(crate::arch::idle_loop as usize as u64, core.kernel_stack_top());
            core.set_current(None);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        process::{ProcessId, Thread, ThreadId},
        sched::percpu::CORE_BASES,
    };

    #[test]
    fn ticks_without_a_thread_count_as_idle() {
        let _guard = crate::lock_global_state_for_test();
        CORE_BASES[0].set_current(None);
        let before = CORE_BASES[0].idle_ticks();

        let mut frame = Context::default();
        task_switch(&mut frame);
        assert_eq!(
            CORE_BASES[0].idle_ticks(),
            before + 1,
            "an idle core accrues one idle tick per switch attempt"
        );

        let thread = Arc::new(Thread::new(
            ThreadId(1),
            ProcessId(1),
            false,
            0,
            Context::default(),
        ));
        CORE_BASES[0].set_current(Some(thread));
        task_switch(&mut frame);
        assert_eq!(
            CORE_BASES[0].idle_ticks(),
            before + 1,
            "a busy core does not accrue idle ticks"
        );

        CORE_BASES[0].set_current(None);
    }
}
