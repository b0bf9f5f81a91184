//! Syscall entry and user-memory access
//!
//! User processes reach the kernel exclusively through the fast syscall
//! instruction. One register carries the syscall code, a second a pointer
//! to the code-specific payload; the result lands in the architecture's
//! first return register. All seven codes delegate to the IPC core.

use crate::{
    arch::Context,
    error::{KernelError, KernelResult},
    ipc::dispatch,
    mm::VirtAddr,
};

/// Syscall codes (part of the external ABI).
pub const SYS_EXIT: u64 = 0;
pub const SYS_METHOD: u64 = 1;
pub const SYS_SIGNAL: u64 = 2;
pub const SYS_TARGETED_SIGNAL: u64 = 3;
pub const SYS_PUSH: u64 = 4;
pub const SYS_PEEK: u64 = 5;
pub const SYS_POP: u64 = 6;

/// Validate that `[ptr, ptr + len)` is a plausible user range: non-null,
/// non-wrapping, and entirely below the kernel half.
pub fn check_user_range(ptr: u64, len: u64) -> KernelResult<()> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let end = ptr.checked_add(len).ok_or(KernelError::OutOfRange)?;
    if VirtAddr::new(ptr).is_kernel_half()
        || (len > 0 && VirtAddr::new(end - 1).is_kernel_half())
    {
        return Err(KernelError::PermissionDenied);
    }
    Ok(())
}

/// Copy `len` bytes in from user memory.
pub fn copy_from_user(ptr: u64, len: usize) -> KernelResult<alloc::vec::Vec<u8>> {
    check_user_range(ptr, len as u64)?;
    let mut buf = alloc::vec![0u8; len];
    // SAFETY: the range was validated to sit in the user half of the
    // current address space; a bad user pointer faults on the user page,
    // not on kernel state.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), len);
    }
    Ok(buf)
}

/// Copy bytes out to user memory.
pub fn copy_to_user(ptr: u64, data: &[u8]) -> KernelResult<()> {
    check_user_range(ptr, data.len() as u64)?;
    // SAFETY: as in `copy_from_user`.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
    }
    Ok(())
}

/// Read a plain `repr(C)` value from user memory.
pub fn read_user<T: Copy>(ptr: u64) -> KernelResult<T> {
    check_user_range(ptr, core::mem::size_of::<T>() as u64)?;
    // SAFETY: range validated; T is plain data readable at any alignment.
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

/// Write a plain `repr(C)` value to user memory.
pub fn write_user<T: Copy>(ptr: u64, value: &T) -> KernelResult<()> {
    check_user_range(ptr, core::mem::size_of::<T>() as u64)?;
    // SAFETY: range validated; T is plain data writable at any alignment.
    unsafe {
        core::ptr::write_unaligned(ptr as *mut T, *value);
    }
    Ok(())
}

/// Entry point called by the architecture syscall shim with the synthetic
/// interrupt frame. Reads the code and payload registers, dispatches, and
/// deposits the result — except for EXIT, which hands the frame to the
/// scheduler and never reports back.
pub fn handle(frame: &mut Context) {
    let code = frame.syscall_code();
    let payload = frame.syscall_payload();

    if code == SYS_EXIT {
        crate::process::lifecycle::task_exit(frame);
        return;
    }

    let result = match code {
        SYS_METHOD => dispatch::sys_method(payload, frame),
        SYS_SIGNAL => dispatch::sys_signal(payload),
        SYS_TARGETED_SIGNAL => dispatch::sys_targeted_signal(payload),
        SYS_PUSH => dispatch::sys_push(payload),
        SYS_PEEK => dispatch::sys_peek(payload),
        SYS_POP => dispatch::sys_pop(payload),
        _ => Err(KernelError::Unsupported),
    };

    frame.set_return(match result {
        Ok(v) => v,
        Err(e) => e.code(),
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::KERNEL_BASE;

    #[test]
    fn kernel_half_pointers_are_rejected() {
        assert_eq!(
            check_user_range(KERNEL_BASE, 8),
            Err(KernelError::PermissionDenied)
        );
        assert_eq!(
            check_user_range(KERNEL_BASE - 4, 8),
            Err(KernelError::PermissionDenied),
            "a range crossing into the kernel half must fail"
        );
        assert_eq!(check_user_range(0, 8), Err(KernelError::InvalidArgument));
        assert_eq!(
            check_user_range(u64::MAX - 2, 8),
            Err(KernelError::OutOfRange)
        );
    }

    #[test]
    fn user_half_ranges_pass() {
        check_user_range(0x1000, 4096).expect("ordinary user range");
        check_user_range(KERNEL_BASE - 8, 8).expect("range ending at the boundary");
    }
}
