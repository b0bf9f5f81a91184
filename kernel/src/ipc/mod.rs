//! Inter-process communication
//!
//! Every thread owns an ordered sequence of typed arguments, its IPC
//! argument stack. The kernel owns the memory behind every `Array`
//! argument it holds; user buffers are copied in on PUSH and copied out on
//! PEEK/POP. Method and signal dispatch never blocks the caller: the
//! receiving side runs as a freshly created handler thread in the target
//! process.

pub mod dispatch;
pub mod registry;

use alloc::vec::Vec;

/// One argument on an IPC stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcArg {
    /// A bare 64-bit value.
    Primitive(u64),
    /// A byte buffer owned by the kernel.
    Array(Vec<u8>),
}

/// A thread's argument stack, last-in first-out.
pub type ArgStack = Vec<IpcArg>;

/// Wire representation of a PUSH/PEEK/POP parameter.
///
/// `payload` is the primitive value when `kind` is
/// [`PARAM_TYPE_PRIMITIVE`], and a user pointer when `kind` is
/// [`PARAM_TYPE_ARRAY`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyscallParam {
    pub kind: u32,
    pub size: u64,
    pub payload: u64,
}

/// `SyscallParam::kind` for arrays.
pub const PARAM_TYPE_ARRAY: u32 = 0;
/// `SyscallParam::kind` for primitives.
pub const PARAM_TYPE_PRIMITIVE: u32 = 1;

/// METHOD payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MethodPayload {
    pub target_pid: u64,
    pub iid: u64,
    pub mid: u64,
}

/// SIGNAL payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalPayload {
    pub iid: u64,
    pub sid: u64,
}

/// TARGETED_SIGNAL payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TargetedSignalPayload {
    pub target_pid: u64,
    pub iid: u64,
    pub sid: u64,
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn arg_stack_is_lifo_and_clone_is_deep() {
        let mut stack = ArgStack::new();
        stack.push(IpcArg::Primitive(7));
        stack.push(IpcArg::Array(alloc::vec![1, 2, 3]));

        let copy = stack.clone();
        assert_eq!(copy.len(), 2);

        match stack.pop().expect("top of stack") {
            IpcArg::Array(mut bytes) => {
                bytes[0] = 0xFF;
            }
            other => panic!("expected the array on top, got {:?}", other),
        }
        // The clone must hold its own buffer, untouched by the mutation.
        assert_eq!(copy[1], IpcArg::Array(alloc::vec![1, 2, 3]));
        assert_eq!(stack.pop(), Some(IpcArg::Primitive(7)));
        assert!(stack.is_empty());
    }

    #[test]
    fn wire_param_layout_matches_the_abi() {
        assert_eq!(core::mem::size_of::<SyscallParam>(), 24);
        assert_eq!(core::mem::offset_of!(SyscallParam, kind), 0);
        assert_eq!(core::mem::offset_of!(SyscallParam, size), 8);
        assert_eq!(core::mem::offset_of!(SyscallParam, payload), 16);
    }
}
