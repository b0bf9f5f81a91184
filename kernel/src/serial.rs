//! Generic serial interface for all architectures
//!
//! The serial port is the kernel's debug sink: boot progress lines and
//! `Stdio.Write` bytes end up here. x86_64 drives COM1 through the
//! `uart_16550` crate, AArch64 the QEMU virt PL011. The host test build
//! forwards to standard output.

use core::fmt;

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::serial::_print(args);

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::serial::_print(args);

    #[cfg(not(target_os = "none"))]
    std::print!("{}", args);
}
