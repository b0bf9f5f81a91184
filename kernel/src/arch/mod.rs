//! Architecture abstraction
//!
//! The core sees one neutral surface: an `InterruptFrame` type aliased as
//! [`Context`], the `mmu` entry codec, interrupt control, the per-core
//! base register, and SMP bring-up. Everything behind it is per-target.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{
    context::InterruptFrame as Context, core_base, halt, idle_loop, init, mmu, set_core_base,
    start_secondary_cores,
};

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{
    context::InterruptFrame as Context, core_base, halt, idle_loop, init, mmu, set_core_base,
    start_secondary_cores,
};

/// Run `f` with interrupts masked on this core, restoring the previous
/// state afterwards. On the host test build this is a plain call.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        aarch64::without_interrupts(f)
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}
