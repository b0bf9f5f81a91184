//! IDT and interrupt entry stubs
//!
//! Exceptions that never switch contexts use the `x86-interrupt` ABI. The
//! timer tick goes through a hand-written stub instead: it must capture
//! the full general-purpose register file so the scheduler can rewrite the
//! frame and `iretq` into a different thread.

use core::arch::naked_asm;

use super::{apic, context::InterruptFrame};

/// Local APIC timer vector.
pub const TIMER_VECTOR: u8 = 0x40;

/// Spurious-interrupt vector programmed into the APIC SVR.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

#[cfg(target_os = "none")]
mod table {
    use lazy_static::lazy_static;
    use x86_64::structures::idt::{
        InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
    };

    use super::super::gdt;
    use super::{timer_entry, SPURIOUS_VECTOR, TIMER_VECTOR};
    use crate::mm::{page_fault, paging::AddressSpace};

    lazy_static! {
        pub(super) static ref IDT: InterruptDescriptorTable = {
            let mut idt = InterruptDescriptorTable::new();
            idt.breakpoint.set_handler_fn(breakpoint_handler);
            idt.general_protection_fault
                .set_handler_fn(general_protection_handler);
            idt.page_fault.set_handler_fn(page_fault_handler);
            idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
            // SAFETY: the double-fault IST slot is set up in gdt.rs.
            unsafe {
                idt.double_fault
                    .set_handler_fn(double_fault_handler)
                    .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            }
            // SAFETY: timer_entry is a naked stub ending in iretq with the
            // exact stack discipline the CPU expects.
            unsafe {
                idt[TIMER_VECTOR]
                    .set_handler_addr(x86_64::VirtAddr::new(timer_entry as usize as u64));
            }
            idt[SPURIOUS_VECTOR].set_handler_fn(spurious_handler);
            idt
        };
    }

    extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
        println!(
            "[INT] breakpoint at {:#x}",
            frame.instruction_pointer.as_u64()
        );
    }

    extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
        println!(
            "[INT] invalid opcode at {:#x}",
            frame.instruction_pointer.as_u64()
        );
        crate::arch::halt();
    }

    extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
        println!(
            "[INT] general protection fault (code {:#x}) at {:#x}",
            code,
            frame.instruction_pointer.as_u64()
        );
        crate::arch::halt();
    }

    extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
        println!(
            "[INT] double fault at {:#x}",
            frame.instruction_pointer.as_u64()
        );
        crate::arch::halt();
    }

    extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {
        // No EOI for spurious interrupts.
    }

    /// Page faults resolve through the COW path or halt the machine.
    extern "x86-interrupt" fn page_fault_handler(
        frame: InterruptStackFrame,
        error_code: PageFaultErrorCode,
    ) {
        let address = x86_64::registers::control::Cr2::read_raw();
        let info = page_fault::PageFaultInfo {
            address,
            was_write: error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
            was_user: error_code.contains(PageFaultErrorCode::USER_MODE),
            instruction_pointer: frame.instruction_pointer.as_u64(),
        };

        let space = AddressSpace::from_root(super::super::mmu::current_root());
        if page_fault::handle_page_fault(&space, &info).is_err() {
            page_fault::fatal(&info);
        }
    }
}

/// Load the IDT on the calling core.
#[cfg(target_os = "none")]
pub fn init() {
    table::IDT.load();
}

#[cfg(not(target_os = "none"))]
pub fn init() {}

/// Timer tick entry: full register save, swapgs when arriving from ring
/// 3, then into the scheduler with a pointer to the frame.
#[unsafe(naked)]
extern "C" fn timer_entry() {
    naked_asm!(
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
        // CS sits above the 15 saved registers.
        "test qword ptr [rsp + 128], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "mov rdi, rsp",
        "call {handler}",
        "test qword ptr [rsp + 128], 3",
        "jz 3f",
        "swapgs",
        "3:",
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
        "iretq",
        handler = sym timer_tick,
    )
}

/// Rust side of the timer tick.
extern "C" fn timer_tick(frame: &mut InterruptFrame) {
    super::timer::record_tick();
    crate::sched::task_switch(frame);
    apic::end_of_interrupt();
}
