//! Fast syscall entry
//!
//! `syscall` lands here with RCX = return RIP and R11 = RFLAGS. The stub
//! swaps GS, moves to the core's kernel stack, and synthesises an
//! `iretq`-compatible frame so the scheduler can resume a
//! syscall-preempted thread exactly like an interrupt-preempted one. The
//! return path is `iretq`, which honours whatever frame the kernel left
//! behind — including one belonging to a different thread.

use core::arch::naked_asm;

use x86_64::{
    registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star},
    registers::rflags::RFlags,
    structures::gdt::SegmentSelector,
    PrivilegeLevel,
};

use super::{context::InterruptFrame, gdt};
use crate::sched::percpu::{CORE_BASE_KSTACK_OFFSET, CORE_BASE_USTACK_OFFSET};

/// Enable SYSCALL/SYSRET and point LSTAR at the entry stub. Interrupts
/// are masked on entry via FMASK; the synthesised frame re-enables them
/// on `iretq`.
pub fn init() {
    let _ = Star::write(
        SegmentSelector::new(4, PrivilegeLevel::Ring3), // user code (0x23)
        SegmentSelector::new(3, PrivilegeLevel::Ring3), // user data (0x1B)
        SegmentSelector::new(1, PrivilegeLevel::Ring0), // kernel code (0x08)
        SegmentSelector::new(2, PrivilegeLevel::Ring0), // kernel data (0x10)
    );
    LStar::write(x86_64::VirtAddr::new(syscall_entry as usize as u64));
    SFMask::write(RFlags::INTERRUPT_FLAG);
    // SAFETY: setting SCE only enables the syscall instruction pair.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

/// The syscall stub. Stack discipline must match [`InterruptFrame`].
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    naked_asm!(
        "swapgs",
        // Park the user stack and adopt this core's kernel stack.
        "mov gs:[{ustack}], rsp",
        "mov rsp, gs:[{kstack}]",
        // Synthesise the iretq frame: SS, RSP, RFLAGS, CS, RIP.
        "push {user_ss}",
        "push qword ptr gs:[{ustack}]",
        "push r11",
        "push {user_cs}",
        "push rcx",
        // Full register file, same order as the interrupt stubs.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // The frame may now belong to a kernel (idle) context; only swap
        // GS back when returning to ring 3.
        "test qword ptr [rsp + 8], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "iretq",
        ustack = const CORE_BASE_USTACK_OFFSET,
        kstack = const CORE_BASE_KSTACK_OFFSET,
        user_ss = const gdt::USER_DATA_SELECTOR as u64,
        user_cs = const gdt::USER_CODE_SELECTOR as u64,
        handler = sym syscall_rust,
    )
}

/// Rust side of the syscall path.
extern "C" fn syscall_rust(frame: &mut InterruptFrame) {
    crate::syscall::handle(frame);
}
