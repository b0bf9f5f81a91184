//! AArch64 entry, exception vectors and boot-record handover
//!
//! The UEFI-style loader enters `_start` at EL1 with the MMU on, DRAM
//! and the peripheral window linear-mapped at the kernel-half base
//! through TTBR1, and x0 pointing at the boot record below. The vector stubs materialise an
//! [`InterruptFrame`](super::context::InterruptFrame) on the kernel stack
//! and hand it to [`exception_dispatch`] by reference; whatever the
//! scheduler leaves in it is restored before `eret`.

use core::arch::global_asm;

use cortex_a::registers::{ESR_EL1, FAR_EL1, VBAR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use super::context::InterruptFrame;
use crate::{
    bootinfo::{self, FramebufferInfo, MemoryMapEntry},
    mm::{page_fault, paging::AddressSpace, KERNEL_BASE},
};

/// Boot record passed by the loader in x0 (physical layout is part of the
/// loader contract).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBootRecord {
    pub memory_map_base: u64,
    pub memory_map_entry_size: u64,
    pub memory_map_entry_count: u64,
    pub initrd_base: u64,
    pub initrd_size: u64,
    pub framebuffer_base: u64,
    pub framebuffer_size: u64,
    pub framebuffer_width: u64,
    pub framebuffer_height: u64,
    pub framebuffer_stride: u64,
    pub acpi_table_base: u64,
}

/// UEFI memory descriptor fields the kernel consumes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawMemoryDescriptor {
    kind: u32,
    _pad: u32,
    physical_start: u64,
    virtual_start: u64,
    number_of_pages: u64,
    attribute: u64,
}

const BOOT_STACK_SIZE: usize = 64 * 1024;

#[repr(C, align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

#[no_mangle]
static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

global_asm!(
    ".section .text._start",
    ".global _start",
    "_start:",
    "mov x19, x0",
    "adrp x1, BOOT_STACK",
    "add x1, x1, :lo12:BOOT_STACK",
    "mov x2, {stack_size}",
    "add x1, x1, x2",
    "mov sp, x1",
    "mov x0, x19",
    "b {entry}",
    stack_size = const BOOT_STACK_SIZE,
    entry = sym aarch64_entry,
);

// Exception vector table: 16 slots of 128 bytes. Only EL1h and lower-EL
// AArch64 sync/IRQ are serviced; everything else funnels into the
// invalid-entry handler with its slot index.
global_asm!(
    ".macro SAVE_FRAME",
    "sub sp, sp, #272",
    "stp x0, x1, [sp, #0]",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "stp x8, x9, [sp, #64]",
    "stp x10, x11, [sp, #80]",
    "stp x12, x13, [sp, #96]",
    "stp x14, x15, [sp, #112]",
    "stp x16, x17, [sp, #128]",
    "stp x18, x19, [sp, #144]",
    "stp x20, x21, [sp, #160]",
    "stp x22, x23, [sp, #176]",
    "stp x24, x25, [sp, #192]",
    "stp x26, x27, [sp, #208]",
    "stp x28, x29, [sp, #224]",
    "str x30, [sp, #240]",
    "mrs x9, sp_el0",
    "mrs x10, elr_el1",
    "mrs x11, spsr_el1",
    "stp x9, x10, [sp, #248]",
    "str x11, [sp, #264]",
    ".endm",
    ".macro RESTORE_FRAME",
    "ldp x9, x10, [sp, #248]",
    "ldr x11, [sp, #264]",
    "msr sp_el0, x9",
    "msr elr_el1, x10",
    "msr spsr_el1, x11",
    "ldp x0, x1, [sp, #0]",
    "ldp x2, x3, [sp, #16]",
    "ldp x4, x5, [sp, #32]",
    "ldp x6, x7, [sp, #48]",
    "ldp x8, x9, [sp, #64]",
    "ldp x10, x11, [sp, #80]",
    "ldp x12, x13, [sp, #96]",
    "ldp x14, x15, [sp, #112]",
    "ldp x16, x17, [sp, #128]",
    "ldp x18, x19, [sp, #144]",
    "ldp x20, x21, [sp, #160]",
    "ldp x22, x23, [sp, #176]",
    "ldp x24, x25, [sp, #192]",
    "ldp x26, x27, [sp, #208]",
    "ldp x28, x29, [sp, #224]",
    "ldr x30, [sp, #240]",
    "add sp, sp, #272",
    ".endm",
    // Each 128-byte vector slot only branches; the shared save/dispatch/
    // restore bodies live past the table.
    ".macro VECTOR_SLOT target",
    ".balign 128",
    "b \\target",
    ".endm",
    ".balign 2048",
    ".global exception_vector_table",
    "exception_vector_table:",
    // EL1t (SP0): unused.
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    // EL1h: kernel-mode sync / IRQ.
    "VECTOR_SLOT vector_sync",
    "VECTOR_SLOT vector_irq",
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    // Lower EL, AArch64: user-mode sync / IRQ.
    "VECTOR_SLOT vector_sync",
    "VECTOR_SLOT vector_irq",
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    // Lower EL, AArch32: unsupported.
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    "VECTOR_SLOT vector_invalid",
    "vector_sync:",
    "SAVE_FRAME",
    "mov x0, sp",
    "mov x1, #0",
    "bl {dispatch}",
    "RESTORE_FRAME",
    "eret",
    "vector_irq:",
    "SAVE_FRAME",
    "mov x0, sp",
    "mov x1, #1",
    "bl {dispatch}",
    "RESTORE_FRAME",
    "eret",
    "vector_invalid:",
    "SAVE_FRAME",
    "mov x0, sp",
    "mov x1, #2",
    "bl {dispatch}",
    "RESTORE_FRAME",
    "eret",
    dispatch = sym exception_dispatch,
);

extern "C" {
    static exception_vector_table: u8;
}

/// Point VBAR_EL1 at the vector table (run on every core).
pub fn install_vectors() {
    // SAFETY: address of a static asm label.
    let table = unsafe { core::ptr::addr_of!(exception_vector_table) as u64 };
    VBAR_EL1.set(table);
}

const KIND_SYNC: u64 = 0;
const KIND_IRQ: u64 = 1;

/// ESR_EL1 exception classes the kernel understands.
const EC_SVC64: u64 = 0x15;
const EC_DATA_ABORT_LOWER: u64 = 0x24;
const EC_DATA_ABORT_SAME: u64 = 0x25;

/// Rust side of every exception vector.
extern "C" fn exception_dispatch(frame: &mut InterruptFrame, kind: u64) {
    match kind {
        KIND_IRQ => {
            let intid = super::gic::acknowledge();
            if intid == super::gic::TIMER_INTID {
                super::timer::record_tick();
                crate::sched::task_switch(frame);
            }
            if intid != super::gic::SPURIOUS_INTID {
                super::gic::end_of_interrupt(intid);
            }
        }
        KIND_SYNC => {
            let esr = ESR_EL1.get();
            let ec = (esr >> 26) & 0x3F;
            match ec {
                EC_SVC64 => crate::syscall::handle(frame),
                EC_DATA_ABORT_LOWER | EC_DATA_ABORT_SAME => {
                    let info = page_fault::PageFaultInfo {
                        address: FAR_EL1.get(),
                        // WnR: write-not-read.
                        was_write: esr & (1 << 6) != 0,
                        was_user: ec == EC_DATA_ABORT_LOWER,
                        instruction_pointer: frame.instruction_pointer(),
                    };
                    let space = AddressSpace::from_root(super::mmu::current_root());
                    if page_fault::handle_page_fault(&space, &info).is_err() {
                        page_fault::fatal(&info);
                    }
                }
                _ => {
                    println!(
                        "[INT] unhandled sync exception: esr={:#x} elr={:#x}",
                        esr,
                        frame.instruction_pointer()
                    );
                    crate::arch::halt();
                }
            }
        }
        _ => {
            println!("[INT] exception from an unsupported vector slot");
            crate::arch::halt();
        }
    }
}

/// First Rust code on the boot core: translate the loader record and fall
/// into the shared boot sequence.
extern "C" fn aarch64_entry(record: *const RawBootRecord) -> ! {
    // SAFETY: the loader contract guarantees x0 points at a live record.
    let record = unsafe { *record };

    let entry_size = record.memory_map_entry_size as usize;
    let count = record.memory_map_entry_count as usize;
    let base = record.memory_map_base;
    let memory_map = bootinfo::store_memory_map((0..count).map(|i| {
        // SAFETY: the loader's descriptor array is linear-mapped and
        // `entry_size`-strided per the boot contract.
        let raw = unsafe {
            core::ptr::read_unaligned((base + (i * entry_size) as u64) as *const RawMemoryDescriptor)
        };
        MemoryMapEntry {
            kind: raw.kind,
            physical_start: raw.physical_start,
            number_of_pages: raw.number_of_pages,
        }
    }));

    let initrd = (record.initrd_size > 0).then(|| {
        // SAFETY: the initrd stays linear-mapped for the kernel lifetime.
        unsafe {
            core::slice::from_raw_parts(
                (KERNEL_BASE + record.initrd_base) as *const u8,
                record.initrd_size as usize,
            )
        }
    });

    let framebuffer = (record.framebuffer_size > 0).then_some(FramebufferInfo {
        base: record.framebuffer_base,
        size: record.framebuffer_size as usize,
        width: record.framebuffer_width as usize,
        height: record.framebuffer_height as usize,
        stride: record.framebuffer_stride as usize,
    });

    let info = bootinfo::BootInfo {
        physical_memory_offset: KERNEL_BASE,
        framebuffer,
        memory_map,
        initrd,
        acpi_rsdp: (record.acpi_table_base != 0).then_some(record.acpi_table_base),
    };
    crate::bootstrap::kernel_main(info)
}
