//! Process and thread lifecycle
//!
//! Creation, fork with copy-on-write, exec, and teardown. Everything here
//! that touches the process table, thread lists or ready queue runs under
//! the task lock; `reap_thread` is the exception in that it is called from
//! `task_switch`, which already holds it.

use alloc::sync::Arc;

use super::{pcb::Process, thread, thread::Thread, ProcessId, ThreadId};
use crate::{
    arch::Context,
    elf,
    error::{KernelError, KernelResult},
    ipc::registry,
    mm::{
        frame::FRAME_ALLOCATOR,
        paging::{self, AddressSpace},
        PageFlags, PhysAddr, VirtAddr, PAGE_SIZE,
    },
    sched::{queue, with_task_lock},
};

/// Map a fresh user stack for `tid` into `space` and return its top.
fn map_user_stack(space: &AddressSpace, tid: ThreadId) -> KernelResult<u64> {
    let top = thread::stack_top_for(tid.0);
    let bottom = top - (thread::USER_STACK_PAGES * PAGE_SIZE) as u64;
    let first = {
        FRAME_ALLOCATOR
            .lock()
            .alloc(thread::USER_STACK_PAGES)?
    };
    for page in 0..thread::USER_STACK_PAGES {
        let frame = PhysAddr::new(first.as_u64() + (page * PAGE_SIZE) as u64);
        let va = VirtAddr::new(bottom + (page * PAGE_SIZE) as u64);
        space.map(va, frame, PageFlags::USER | PageFlags::WRITE)?;
    }
    Ok(top)
}

/// Drop a thread's stack mapping from `space`.
fn unmap_user_stack(space: &AddressSpace, stack_top: u64) {
    let bottom = stack_top - (thread::USER_STACK_PAGES * PAGE_SIZE) as u64;
    for page in 0..thread::USER_STACK_PAGES {
        let _ = space.unmap(VirtAddr::new(bottom + (page * PAGE_SIZE) as u64));
    }
}

/// Create a thread in `proc` entering user mode at `entry`.
///
/// The new thread gets a fixed-size user stack, an interrupt frame with
/// user segments and interrupts enabled, and the first three argument
/// registers from `args`. It is appended to the process's thread list and
/// the ready queue. Caller holds the task lock.
pub fn spawn_thread(
    proc: &Arc<Process>,
    entry: u64,
    is_ipc_handler: bool,
    args: [u64; 3],
) -> KernelResult<Arc<Thread>> {
    let tid = proc.alloc_tid();
    let space = *proc.space.lock();
    let stack_top = map_user_stack(&space, tid)?;

    let mut context = Context::new_user(entry, stack_top);
    context.set_args(args);

    let thread = Arc::new(Thread::new(tid, proc.pid, is_ipc_handler, stack_top, context));
    proc.add_thread(thread.clone());
    queue::enqueue(thread.clone());
    Ok(thread)
}

/// Tear one thread down: out of the ready queue, out of its process, user
/// stack unmapped. The last thread takes the whole process with it.
/// Runs under the task lock (from `task_switch` or exec).
pub fn reap_thread(thread: &Arc<Thread>) {
    queue::remove(thread.pid, thread.tid());

    let Some(proc) = super::lookup(thread.pid) else {
        return;
    };
    proc.remove_thread(thread.tid());
    unmap_user_stack(&proc.space.lock(), thread.stack_top());

    // The argument stack is kernel-owned; dropping the thread's last
    // reference frees it exactly once, whether it was pushed locally or
    // moved in from a METHOD caller.

    if proc.thread_count() == 0 {
        delete_process(&proc);
    }
}

/// Destroy `proc`: every thread, every descendant process, then the user
/// half of the address space (refcounts dropped leaf by leaf, tables
/// freed, root last). Runs under the task lock.
pub fn delete_process(proc: &Arc<Process>) {
    // Descendants first, so no child ever outlives its parent.
    let children: alloc::vec::Vec<ProcessId> = proc.children.lock().clone();
    for child_pid in children {
        if let Some(child) = super::lookup(child_pid) {
            delete_process(&child);
        }
    }

    let threads: alloc::vec::Vec<Arc<Thread>> = proc.threads.lock().drain(..).collect();
    for t in threads {
        queue::remove(t.pid, t.tid());
        unmap_user_stack(&proc.space.lock(), t.stack_top());
    }

    registry::forget_process(proc.pid);
    if let Some(parent) = proc.parent.and_then(super::lookup) {
        parent.remove_child(proc.pid);
    }
    super::remove(proc.pid);

    let space = *proc.space.lock();
    space.teardown_user();
    space.release_root();
}

/// Load `/init` into a fresh address space and queue its first thread.
/// The scheduler-enabled flag stays off; the caller flips it when the rest
/// of boot is done.
pub fn task_init() -> KernelResult<()> {
    let mut handle = crate::fs::find_node("/init")?;

    let space = AddressSpace::new(paging::kernel_space())?;
    let image = elf::load(&mut handle, &space)?;
    let entry = image.entry;

    let proc = Arc::new(Process::new(super::alloc_pid(), None, space));
    *proc.image.lock() = Some(image);
    super::insert(proc.clone());

    with_task_lock(|| spawn_thread(&proc, entry, false, [0, 0, 0]))?;
    println!("[TASK] /init loaded, pid {}", proc.pid);
    Ok(())
}

/// Fork the process owning `parent_thread`.
///
/// The child gets a new root with the shared kernel half, a copy-on-write
/// mirror of the user half, the parent's image record, and a single
/// thread (id 1) carrying the same saved context so both sides resume
/// from the same point. Returns the child pid.
pub fn task_fork(parent_thread: &Arc<Thread>) -> KernelResult<ProcessId> {
    let parent = super::lookup(parent_thread.pid).ok_or(KernelError::NotFound)?;

    let child_space = AddressSpace::new(paging::kernel_space())?;
    with_task_lock(|| -> KernelResult<()> {
        parent.space.lock().fork_cow_into(&child_space)
    })?;

    let child = Arc::new(Process::new(
        super::alloc_pid(),
        Some(parent.pid),
        child_space,
    ));
    *child.image.lock() = parent.image.lock().clone();

    // Mirror the forking thread: id 1, same saved context, stack mapping
    // inherited as COW above, fresh empty argument stack.
    let tid = child.alloc_tid();
    let context = *parent_thread.context.lock();
    let mirror = Arc::new(Thread::new(
        tid,
        child.pid,
        false,
        parent_thread.stack_top(),
        context,
    ));
    child.add_thread(mirror.clone());

    let pid = child.pid;
    with_task_lock(|| {
        parent.add_child(pid);
        super::insert(child);
        queue::enqueue(mirror);
    });
    Ok(pid)
}

/// Replace the process image of `thread`'s process with the executable at
/// `path`.
///
/// Fails `NotFound` / `InvalidElf` before any state is touched. On the
/// good path: every sibling thread dies, tids restart at 1, the thread's
/// IPC arguments are dropped, the old user space is torn down, and the
/// thread's frame is rebuilt to enter the new image.
pub fn task_exec(thread: &Arc<Thread>, path: &str) -> KernelResult<()> {
    let proc = super::lookup(thread.pid).ok_or(KernelError::NotFound)?;

    // Validate up front so the bad paths leave the process intact.
    let mut handle = crate::fs::find_node(path)?;
    {
        let mut header_bytes = [0u8; core::mem::size_of::<elf::Elf64Header>()];
        handle.seek(0)?;
        handle
            .read(&mut header_bytes)
            .map_err(|_| KernelError::InvalidElf)?;
        elf::parse_header(&header_bytes)?;
    }

    with_task_lock(|| -> KernelResult<()> {
        // Every other thread in the process dies now.
        let siblings: alloc::vec::Vec<Arc<Thread>> = proc
            .threads
            .lock()
            .iter()
            .filter(|t| t.tid() != thread.tid())
            .cloned()
            .collect();
        for t in siblings {
            queue::remove(t.pid, t.tid());
            proc.remove_thread(t.tid());
            unmap_user_stack(&proc.space.lock(), t.stack_top());
        }

        proc.reset_tids();
        thread.set_tid(proc.alloc_tid());
        thread.ipc_args.lock().clear();

        let old_space = *proc.space.lock();
        // The stack frames go with the rest of the user half.
        old_space.teardown_user();

        let new_space = AddressSpace::new(paging::kernel_space())?;
        let image = elf::load(&mut handle, &new_space)?;

        let stack_top = map_user_stack(&new_space, thread.tid())?;
        thread.set_stack_top(stack_top);
        *thread.context.lock() = Context::new_user(image.entry, stack_top);

        *proc.image.lock() = Some(image);
        *proc.space.lock() = new_space;
        new_space.make_current();
        // Sweep tables the mirror-copy created in the old tree, then drop
        // its root.
        old_space.teardown_user();
        old_space.release_root();
        Ok(())
    })
}

/// Mark the current thread exiting and give up the core; the scheduler
/// pass triggered here reaps it.
pub fn task_exit(frame: &mut Context) {
    if let Some(thread) = crate::sched::percpu::current_core().current_thread() {
        thread.mark_exiting();
    }
    crate::sched::task_switch(frame);
}
