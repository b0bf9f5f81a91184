//! x86_64 interrupt frames
//!
//! The layout matches the entry stubs in `idt.rs`/`syscall.rs` exactly:
//! fifteen general-purpose registers pushed by software, then the
//! five-word `iretq` frame pushed by the CPU (or synthesised by the
//! syscall shim). The scheduler resumes both interrupt-preempted and
//! syscall-preempted threads through the same `iretq`.

use super::gdt;

/// Saved CPU state, as laid out on the kernel stack by the entry stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Pushed by the CPU (or synthesised for syscalls) from here down.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// RFLAGS with the interrupt-enable bit (and the always-one bit).
const RFLAGS_IF: u64 = 0x202;

impl InterruptFrame {
    /// Frame entering user mode at `entry` with the given stack top.
    pub fn new_user(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: gdt::USER_CODE_SELECTOR as u64,
            rflags: RFLAGS_IF,
            rsp: stack_top,
            ss: gdt::USER_DATA_SELECTOR as u64,
            ..Self::default()
        }
    }

    /// Synthetic kernel frame resuming the idle loop.
    pub fn idle(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: gdt::KERNEL_CODE_SELECTOR as u64,
            rflags: RFLAGS_IF,
            rsp: stack_top,
            ss: gdt::KERNEL_DATA_SELECTOR as u64,
            ..Self::default()
        }
    }

    /// First three argument registers (handler threads receive
    /// `{iid, mid, caller_pid}` here).
    pub fn set_args(&mut self, args: [u64; 3]) {
        self.rdi = args[0];
        self.rsi = args[1];
        self.rdx = args[2];
    }

    /// The three argument registers, in [`set_args`](Self::set_args) order.
    pub fn arg_registers(&self) -> [u64; 3] {
        [self.rdi, self.rsi, self.rdx]
    }

    /// Syscall code register.
    pub fn syscall_code(&self) -> u64 {
        self.rdi
    }

    /// Syscall payload-pointer register.
    pub fn syscall_payload(&self) -> u64 {
        self.rsi
    }

    /// Deposit a syscall result in the first return register.
    pub fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    /// Whether the frame was captured in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_the_entry_stubs() {
        assert_eq!(core::mem::size_of::<InterruptFrame>(), 160);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rip), 120);
        assert_eq!(core::mem::offset_of!(InterruptFrame, cs), 128);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rsp), 144);
    }

    #[test]
    fn user_frames_run_ring3_with_interrupts_on() {
        let mut frame = InterruptFrame::new_user(0x40_1000, 0x7FFF_0000);
        assert!(frame.from_user());
        assert_eq!(frame.rflags & 0x200, 0x200, "IF must be set");
        assert_eq!(frame.instruction_pointer(), 0x40_1000);

        frame.set_args([1, 2, 3]);
        assert_eq!((frame.rdi, frame.rsi, frame.rdx), (1, 2, 3));

        frame.set_return(-3);
        assert_eq!(frame.rax as i64, -3);
    }
}
