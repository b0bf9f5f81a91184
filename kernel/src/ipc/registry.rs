//! Name services and the in-kernel IPC interfaces
//!
//! Methods sent to pid 0 are handled here instead of spawning a handler
//! thread. Three interfaces exist: the local name service resolves
//! interface and method names to numeric ids, the global name service maps
//! service names to pids (and registers the caller's IPC entry point), and
//! Stdio bridges to the serial debug sink.
//!
//! The service table keeps exactly one row per registered process, keyed
//! by pid; re-registering overwrites the row in place.

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};

use spin::Mutex;

use super::IpcArg;
use crate::process::{Process, ProcessId, Thread};

/// Interface ids of the in-kernel services.
pub const IID_LOCAL_NAME_SERVICE: u64 = 0;
pub const IID_GLOBAL_NAME_SERVICE: u64 = 1;
pub const IID_STDIO: u64 = 2;

/// LocalNameService method ids.
pub const LNS_FIND_INTERFACE: u64 = 0;
pub const LNS_FIND_METHOD: u64 = 1;

/// GlobalNameService method ids.
pub const GNS_FIND_DESTINATION: u64 = 0;
pub const GNS_REGISTER_DESTINATION: u64 = 1;
pub const GNS_UNREGISTER_DESTINATION: u64 = 2;

/// Stdio method ids.
pub const STDIO_READ: u64 = 0;
pub const STDIO_WRITE: u64 = 1;
pub const STDIO_FLUSH: u64 = 2;

struct ServiceRecord {
    name: String,
    entry: u64,
}

/// Service table: pid -> (name, ipc entry point).
static SERVICES: Mutex<BTreeMap<u64, ServiceRecord>> = Mutex::new(BTreeMap::new());

/// Pid registered under `name`, if any.
pub fn find_destination(name: &str) -> Option<ProcessId> {
    SERVICES
        .lock()
        .iter()
        .find(|(_, rec)| rec.name == name)
        .map(|(pid, _)| ProcessId(*pid))
}

/// Register (or re-register) `proc` under `name` with the given handler
/// entry point. A pid already present keeps its single row, overwritten.
pub fn register_destination(proc: &Arc<Process>, name: &str, entry: u64) {
    SERVICES.lock().insert(
        proc.pid.0,
        ServiceRecord {
            name: String::from(name),
            entry,
        },
    );
    proc.set_ipc_entry(entry);
}

/// Remove any row carrying `name`. Returns whether a row was removed; the
/// unregistered process also loses its IPC entry point.
pub fn unregister_destination(name: &str) -> bool {
    let removed: Vec<u64> = {
        let mut services = SERVICES.lock();
        let pids: Vec<u64> = services
            .iter()
            .filter(|(_, rec)| rec.name == name)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &pids {
            services.remove(pid);
        }
        pids
    };
    for pid in &removed {
        if let Some(proc) = crate::process::lookup(ProcessId(*pid)) {
            proc.set_ipc_entry(0);
        }
    }
    !removed.is_empty()
}

/// Drop the row of a process that is being destroyed.
pub fn forget_process(pid: ProcessId) {
    SERVICES.lock().remove(&pid.0);
}

fn pop_array(thread: &Arc<Thread>) -> Option<Vec<u8>> {
    let mut args = thread.ipc_args.lock();
    match args.pop() {
        Some(IpcArg::Array(bytes)) => Some(bytes),
        Some(other) => {
            // Put a mismatched argument back; the caller sees a failure
            // without losing state.
            args.push(other);
            None
        }
        None => None,
    }
}

fn pop_primitive(thread: &Arc<Thread>) -> Option<u64> {
    let mut args = thread.ipc_args.lock();
    match args.pop() {
        Some(IpcArg::Primitive(v)) => Some(v),
        Some(other) => {
            args.push(other);
            None
        }
        None => None,
    }
}

/// Handle a METHOD addressed to pid 0. Consumes the caller's arguments and
/// returns the value for the caller's result register.
pub fn kernel_call(iid: u64, mid: u64, proc: &Arc<Process>, thread: &Arc<Thread>) -> i64 {
    match (iid, mid) {
        (IID_LOCAL_NAME_SERVICE, LNS_FIND_INTERFACE) => {
            let Some(name) = pop_array(thread) else {
                return -1;
            };
            match core::str::from_utf8(&name) {
                Ok("LocalNameService") => IID_LOCAL_NAME_SERVICE as i64,
                Ok("GlobalNameService") => IID_GLOBAL_NAME_SERVICE as i64,
                Ok("Stdio") => IID_STDIO as i64,
                _ => -1,
            }
        }
        (IID_LOCAL_NAME_SERVICE, LNS_FIND_METHOD) => {
            // Args pushed as Primitive(iid), Array(name): the name is on top.
            let Some(name) = pop_array(thread) else {
                return -1;
            };
            let Some(target_iid) = pop_primitive(thread) else {
                return -1;
            };
            find_method(target_iid, &name)
        }
        (IID_GLOBAL_NAME_SERVICE, GNS_FIND_DESTINATION) => {
            let Some(name) = pop_array(thread) else {
                return -1;
            };
            match core::str::from_utf8(&name).ok().and_then(find_destination) {
                Some(pid) => pid.0 as i64,
                None => -1,
            }
        }
        (IID_GLOBAL_NAME_SERVICE, GNS_REGISTER_DESTINATION) => {
            // Args pushed as Array(name), Primitive(entry): entry on top.
            let Some(entry) = pop_primitive(thread) else {
                return -1;
            };
            let Some(name) = pop_array(thread) else {
                return -1;
            };
            let Ok(name) = core::str::from_utf8(&name) else {
                return -1;
            };
            register_destination(proc, name, entry);
            proc.pid.0 as i64
        }
        (IID_GLOBAL_NAME_SERVICE, GNS_UNREGISTER_DESTINATION) => {
            let Some(name) = pop_array(thread) else {
                return -1;
            };
            match core::str::from_utf8(&name) {
                Ok(name) if unregister_destination(name) => 0,
                _ => -1,
            }
        }
        (IID_STDIO, STDIO_READ) => -1,
        (IID_STDIO, STDIO_WRITE) => {
            let Some(bytes) = pop_array(thread) else {
                return -1;
            };
            for chunk in bytes.utf8_chunks() {
                print!("{}", chunk.valid());
            }
            0
        }
        (IID_STDIO, STDIO_FLUSH) => 0,
        _ => -1,
    }
}

/// Method-name lookup for the local name service.
fn find_method(iid: u64, name: &[u8]) -> i64 {
    let Ok(name) = core::str::from_utf8(name) else {
        return -1;
    };
    let table: &[(&str, u64)] = match iid {
        IID_LOCAL_NAME_SERVICE => &[
            ("FindInterface", LNS_FIND_INTERFACE),
            ("FindMethod", LNS_FIND_METHOD),
        ],
        IID_GLOBAL_NAME_SERVICE => &[
            ("FindDestination", GNS_FIND_DESTINATION),
            ("RegisterDestination", GNS_REGISTER_DESTINATION),
            ("UnregisterDestination", GNS_UNREGISTER_DESTINATION),
        ],
        IID_STDIO => &[
            ("Read", STDIO_READ),
            ("Write", STDIO_WRITE),
            ("Flush", STDIO_FLUSH),
        ],
        _ => return -1,
    };
    table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, mid)| *mid as i64)
        .unwrap_or(-1)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{
        arch::Context,
        mm::{paging::AddressSpace, PhysAddr},
        process::{ProcessId, ThreadId},
    };

    fn fresh_tables() {
        SERVICES.lock().clear();
        crate::process::PROCESS_TABLE.lock().clear();
    }

    fn proc_with_thread(pid: u64) -> (Arc<Process>, Arc<Thread>) {
        let proc = Arc::new(Process::new(
            ProcessId(pid),
            None,
            AddressSpace::from_root(PhysAddr::new(0)),
        ));
        crate::process::insert(proc.clone());
        let thread = Arc::new(Thread::new(
            ThreadId(1),
            ProcessId(pid),
            false,
            0,
            Context::default(),
        ));
        (proc, thread)
    }

    #[test]
    fn register_then_find_returns_the_pid() {
        let _guard = crate::lock_global_state_for_test();
        fresh_tables();
        let (proc, thread) = proc_with_thread(7);

        thread
            .ipc_args
            .lock()
            .push(IpcArg::Array(Vec::from(&b"svc"[..])));
        thread.ipc_args.lock().push(IpcArg::Primitive(0x5000));

        let ret = kernel_call(
            IID_GLOBAL_NAME_SERVICE,
            GNS_REGISTER_DESTINATION,
            &proc,
            &thread,
        );
        assert_eq!(ret, 7, "registration returns the caller pid");
        assert_eq!(proc.ipc_entry_point(), Some(0x5000));

        let (other, other_thread) = proc_with_thread(9);
        other_thread
            .ipc_args
            .lock()
            .push(IpcArg::Array(Vec::from(&b"svc"[..])));
        let found = kernel_call(
            IID_GLOBAL_NAME_SERVICE,
            GNS_FIND_DESTINATION,
            &other,
            &other_thread,
        );
        assert_eq!(found, 7);
    }

    #[test]
    fn reregistration_keeps_one_row_per_pid() {
        let _guard = crate::lock_global_state_for_test();
        fresh_tables();
        let (proc, _) = proc_with_thread(3);
        register_destination(&proc, "first", 0x1000);
        register_destination(&proc, "second", 0x2000);

        assert_eq!(SERVICES.lock().len(), 1, "one row per registered process");
        assert!(find_destination("first").is_none());
        assert_eq!(find_destination("second"), Some(ProcessId(3)));
        assert_eq!(proc.ipc_entry_point(), Some(0x2000));
    }

    #[test]
    fn unregister_removes_row_and_entry_point() {
        let _guard = crate::lock_global_state_for_test();
        fresh_tables();
        let (proc, _) = proc_with_thread(4);
        register_destination(&proc, "svc", 0x1234);

        assert!(unregister_destination("svc"));
        assert!(find_destination("svc").is_none());
        assert_eq!(proc.ipc_entry_point(), None);
        assert!(!unregister_destination("svc"), "second removal finds nothing");
    }

    #[test]
    fn local_name_service_resolves_names() {
        let _guard = crate::lock_global_state_for_test();
        fresh_tables();
        let (proc, thread) = proc_with_thread(5);

        thread
            .ipc_args
            .lock()
            .push(IpcArg::Array(Vec::from(&b"Stdio"[..])));
        assert_eq!(
            kernel_call(IID_LOCAL_NAME_SERVICE, LNS_FIND_INTERFACE, &proc, &thread),
            IID_STDIO as i64
        );

        thread.ipc_args.lock().push(IpcArg::Primitive(IID_STDIO));
        thread
            .ipc_args
            .lock()
            .push(IpcArg::Array(Vec::from(&b"Write"[..])));
        assert_eq!(
            kernel_call(IID_LOCAL_NAME_SERVICE, LNS_FIND_METHOD, &proc, &thread),
            STDIO_WRITE as i64
        );

        thread
            .ipc_args
            .lock()
            .push(IpcArg::Array(Vec::from(&b"NoSuch"[..])));
        assert_eq!(
            kernel_call(IID_LOCAL_NAME_SERVICE, LNS_FIND_INTERFACE, &proc, &thread),
            -1
        );
    }

    #[test]
    fn stdio_read_is_unimplemented() {
        let _guard = crate::lock_global_state_for_test();
        fresh_tables();
        let (proc, thread) = proc_with_thread(6);
        assert_eq!(kernel_call(IID_STDIO, STDIO_READ, &proc, &thread), -1);
        assert_eq!(kernel_call(IID_STDIO, STDIO_FLUSH, &proc, &thread), 0);
    }
}
