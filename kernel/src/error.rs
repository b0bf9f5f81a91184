//! Kernel-wide error types
//!
//! Every fallible kernel entry point reports one of these kinds. The syscall
//! layer maps them onto the negative half of the return register via
//! [`KernelError::code`]; zero and positive values are reserved for success
//! and identifiers.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frames / heap space left to satisfy the request
    OutOfMemory,
    /// An address or cursor fell outside the structure it indexes
    OutOfRange,
    /// Path, process, service or method lookup failed
    NotFound,
    /// A caller-supplied value was malformed
    InvalidArgument,
    /// The file is not a loadable ELF executable
    InvalidElf,
    /// A user pointer reached into the kernel half of the address space
    PermissionDenied,
    /// The resource is already present (mount prefix, service name)
    AlreadyExists,
    /// The operation exists in the interface but is not provided here
    Unsupported,
}

impl KernelError {
    /// Stable ABI error code, always negative.
    pub const fn code(self) -> i64 {
        match self {
            Self::OutOfMemory => -1,
            Self::OutOfRange => -2,
            Self::NotFound => -3,
            Self::InvalidArgument => -4,
            Self::InvalidElf => -5,
            Self::PermissionDenied => -6,
            Self::AlreadyExists => -7,
            Self::Unsupported => -8,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::OutOfRange => write!(f, "address or index out of range"),
            Self::NotFound => write!(f, "not found"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidElf => write!(f, "not a valid ELF executable"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Unsupported => write!(f, "operation not supported"),
        }
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_negative_and_distinct() {
        let all = [
            KernelError::OutOfMemory,
            KernelError::OutOfRange,
            KernelError::NotFound,
            KernelError::InvalidArgument,
            KernelError::InvalidElf,
            KernelError::PermissionDenied,
            KernelError::AlreadyExists,
            KernelError::Unsupported,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0, "code for {:?} must be negative", a);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code(), "codes for {:?} and {:?} collide", a, b);
            }
        }
    }
}
