//! IPC syscall operations
//!
//! PUSH/PEEK/POP manipulate the calling thread's argument stack; METHOD,
//! SIGNAL and TARGETED_SIGNAL create handler threads in the receiving
//! processes. None of these block the caller: a method call returns as
//! soon as the handler thread is queued, and a request/response pair is
//! simply two METHODs.

use alloc::{sync::Arc, vec::Vec};
use core::mem;

use super::{
    registry, IpcArg, MethodPayload, SignalPayload, SyscallParam, TargetedSignalPayload,
    PARAM_TYPE_ARRAY, PARAM_TYPE_PRIMITIVE,
};
use crate::{
    arch::Context,
    error::{KernelError, KernelResult},
    process::{lifecycle, Process, ProcessId, Thread},
    sched::{percpu, queue, with_task_lock},
    syscall,
};

/// Largest Array argument accepted from user space.
pub const IPC_ARRAY_MAX: usize = 64 * 1024;

fn current_thread() -> KernelResult<Arc<Thread>> {
    percpu::current_core()
        .current_thread()
        .ok_or(KernelError::InvalidArgument)
}

fn current_process() -> KernelResult<(Arc<Process>, Arc<Thread>)> {
    let thread = current_thread()?;
    let proc = crate::process::lookup(thread.pid).ok_or(KernelError::NotFound)?;
    Ok((proc, thread))
}

/// PUSH: append the user-supplied parameter to the caller's stack.
///
/// Array payloads are copied into a kernel-owned buffer; a pointer into
/// the kernel half is rejected outright and the stack stays unmodified.
pub fn sys_push(param_ptr: u64) -> KernelResult<i64> {
    let thread = current_thread()?;
    let param: SyscallParam = syscall::read_user(param_ptr)?;

    let arg = match param.kind {
        PARAM_TYPE_PRIMITIVE => IpcArg::Primitive(param.payload),
        PARAM_TYPE_ARRAY => {
            let len = param.size as usize;
            if len > IPC_ARRAY_MAX {
                return Err(KernelError::InvalidArgument);
            }
            IpcArg::Array(syscall::copy_from_user(param.payload, len)?)
        }
        _ => return Err(KernelError::InvalidArgument),
    };

    thread.ipc_args.lock().push(arg);
    Ok(0)
}

fn peek_or_pop(param_ptr: u64, remove: bool) -> KernelResult<i64> {
    let thread = current_thread()?;
    let out: SyscallParam = syscall::read_user(param_ptr)?;

    let mut args = thread.ipc_args.lock();
    let top = args.last().ok_or(KernelError::NotFound)?;

    let written = match top {
        IpcArg::Primitive(value) => SyscallParam {
            kind: PARAM_TYPE_PRIMITIVE,
            size: mem::size_of::<u64>() as u64,
            payload: *value,
        },
        IpcArg::Array(bytes) => {
            // The caller's out pointer, when non-null, receives the bytes;
            // the kernel refuses to copy into its own half.
            if out.payload != 0 {
                syscall::copy_to_user(out.payload, bytes)?;
            }
            SyscallParam {
                kind: PARAM_TYPE_ARRAY,
                size: bytes.len() as u64,
                payload: out.payload,
            }
        }
    };
    syscall::write_user(param_ptr, &written)?;

    if remove {
        args.pop();
    }
    Ok(0)
}

/// PEEK: report the top of the stack without consuming it.
pub fn sys_peek(param_ptr: u64) -> KernelResult<i64> {
    peek_or_pop(param_ptr, false)
}

/// POP: report and remove the top of the stack.
pub fn sys_pop(param_ptr: u64) -> KernelResult<i64> {
    peek_or_pop(param_ptr, true)
}

/// Spawn one handler thread in `target` and hand it `args`. Caller holds
/// the task lock.
fn spawn_handler(
    target: &Arc<Process>,
    entry: u64,
    iid: u64,
    sid_or_mid: u64,
    caller: ProcessId,
    args: super::ArgStack,
) -> KernelResult<Arc<Thread>> {
    let handler = lifecycle::spawn_thread(target, entry, true, [iid, sid_or_mid, caller.0])?;
    *handler.ipc_args.lock() = args;
    Ok(handler)
}

/// METHOD: pid 0 is handled in-kernel; any other target gets a handler
/// thread whose argument stack is *moved* from the caller. Returns
/// immediately, the handler runs asynchronously.
pub fn sys_method(payload_ptr: u64, _frame: &mut Context) -> KernelResult<i64> {
    let (proc, thread) = current_process()?;
    let payload: MethodPayload = syscall::read_user(payload_ptr)?;

    if payload.target_pid == 0 {
        return Ok(registry::kernel_call(
            payload.iid,
            payload.mid,
            &proc,
            &thread,
        ));
    }

    let target =
        crate::process::lookup(ProcessId(payload.target_pid)).ok_or(KernelError::NotFound)?;
    let entry = target.ipc_entry_point().ok_or(KernelError::NotFound)?;

    with_task_lock(|| -> KernelResult<i64> {
        // Move the stack only after the handler exists, so a failed spawn
        // leaves the caller's arguments in place.
        let handler = lifecycle::spawn_thread(&target, entry, true, [
            payload.iid,
            payload.mid,
            proc.pid.0,
        ])?;
        let moved = mem::take(&mut *thread.ipc_args.lock());
        *handler.ipc_args.lock() = moved;
        Ok(0)
    })
}

/// Fan a signal out to the given receivers. On any failure every handler
/// spawned so far is unwound and the caller's stack is left untouched.
fn fan_out(
    sender: &Arc<Process>,
    thread: &Arc<Thread>,
    receivers: &[(Arc<Process>, u64)],
    iid: u64,
    sid: u64,
) -> KernelResult<i64> {
    with_task_lock(|| -> KernelResult<i64> {
        let mut spawned: Vec<(Arc<Process>, Arc<Thread>)> = Vec::new();
        for (target, entry) in receivers {
            // Each recipient gets its own deep copy of the argument stack.
            let args = thread.ipc_args.lock().clone();
            match spawn_handler(target, *entry, iid, sid, sender.pid, args) {
                Ok(handler) => spawned.push((target.clone(), handler)),
                Err(e) => {
                    for (target, handler) in spawned {
                        queue::remove(handler.pid, handler.tid());
                        target.remove_thread(handler.tid());
                    }
                    return Err(e);
                }
            }
        }
        thread.ipc_args.lock().clear();
        Ok(0)
    })
}

/// SIGNAL: one handler thread per registered process except the sender.
pub fn sys_signal(payload_ptr: u64) -> KernelResult<i64> {
    let (proc, thread) = current_process()?;
    let payload: SignalPayload = syscall::read_user(payload_ptr)?;

    let receivers: Vec<(Arc<Process>, u64)> = crate::process::all()
        .into_iter()
        .filter(|p| p.pid != proc.pid)
        .filter_map(|p| p.ipc_entry_point().map(|entry| (p, entry)))
        .collect();

    fan_out(&proc, &thread, &receivers, payload.iid, payload.sid)
}

/// TARGETED_SIGNAL: as SIGNAL, but to exactly one process.
pub fn sys_targeted_signal(payload_ptr: u64) -> KernelResult<i64> {
    let (proc, thread) = current_process()?;
    let payload: TargetedSignalPayload = syscall::read_user(payload_ptr)?;

    let target =
        crate::process::lookup(ProcessId(payload.target_pid)).ok_or(KernelError::NotFound)?;
    let entry = target.ipc_entry_point().ok_or(KernelError::NotFound)?;

    fan_out(&proc, &thread, &[(target, entry)], payload.iid, payload.sid)
}
