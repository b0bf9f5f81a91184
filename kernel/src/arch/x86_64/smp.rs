//! Application-processor start-up
//!
//! A real-mode trampoline is copied below 1 MiB and each AP is kicked with
//! the INIT/SIPI/SIPI sequence. The trampoline switches straight through
//! protected mode into long mode on the kernel's page tables and jumps to
//! [`ap_main`], which brings the core's local state up and halts until the
//! scheduler hands it work.

use core::arch::global_asm;

use super::apic;
use crate::sched::percpu::{self, MAX_CORES};

/// Physical page the trampoline is copied to (SIPI vector 8).
const TRAMPOLINE_PHYS: u64 = 0x8000;
const SIPI_VECTOR: u8 = (TRAMPOLINE_PHYS >> 12) as u8;

#[cfg(target_os = "none")]
global_asm!(
    ".section .text",
    ".balign 4096",
    ".global ap_tramp_start",
    ".global ap_tramp_end",
    ".global ap_tramp_patch",
    "ap_tramp_start:",
    ".code16",
    "cli",
    "xor ax, ax",
    "mov ds, ax",
    // Load the trampoline GDT through its fixed physical address.
    "lgdt [{base} + (2f - ap_tramp_start)]",
    "mov eax, cr4",
    "or eax, 1 << 5", // PAE
    "mov cr4, eax",
    "mov eax, [{base} + (ap_tramp_patch - ap_tramp_start)]",
    "mov cr3, eax",
    "mov ecx, 0xC0000080", // EFER
    "rdmsr",
    "or eax, 1 << 8", // LME
    "wrmsr",
    "mov eax, cr0",
    "or eax, 0x80000001", // PG | PE
    "mov cr0, eax",
    // Far jump into 64-bit code (66h-prefixed ptr32 encoding).
    ".byte 0x66, 0xEA",
    ".long {base} + (3f - ap_tramp_start)",
    ".word 0x08",
    ".balign 8",
    "2:", // descriptor for the inline GDT below
    ".word 31",
    ".long {base} + (4f - ap_tramp_start)",
    ".balign 8",
    "4:", // null, 64-bit code, data
    ".quad 0",
    ".quad 0x00AF9A000000FFFF",
    ".quad 0x00CF92000000FFFF",
    ".quad 0",
    ".code64",
    "3:",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    "mov rsp, [{base} + (ap_tramp_patch - ap_tramp_start) + 8]",
    "mov rdi, [{base} + (ap_tramp_patch - ap_tramp_start) + 24]",
    "mov rax, [{base} + (ap_tramp_patch - ap_tramp_start) + 16]",
    "jmp rax",
    ".balign 8",
    "ap_tramp_patch:", // cr3, stack, entry, core id
    ".quad 0",
    ".quad 0",
    ".quad 0",
    ".quad 0",
    "ap_tramp_end:",
    base = const TRAMPOLINE_PHYS,
);

#[cfg(target_os = "none")]
extern "C" {
    static ap_tramp_start: u8;
    static ap_tramp_end: u8;
    static ap_tramp_patch: u8;
}

#[cfg(target_os = "none")]
fn busy_wait(loops: u64) {
    for _ in 0..loops {
        core::hint::spin_loop();
    }
}

/// Copy the trampoline into low memory and patch its parameter block for
/// one target core.
#[cfg(target_os = "none")]
fn install_trampoline(core_id: usize) {
    // SAFETY: symbol arithmetic over the contiguous trampoline blob.
    let (start, len, patch_off) = unsafe {
        let start = core::ptr::addr_of!(ap_tramp_start);
        let end = core::ptr::addr_of!(ap_tramp_end);
        let patch = core::ptr::addr_of!(ap_tramp_patch);
        (
            start,
            end as usize - start as usize,
            patch as usize - start as usize,
        )
    };

    let dst = crate::bootinfo::phys_to_virt(TRAMPOLINE_PHYS);
    // SAFETY: the trampoline page is conventional low memory reserved for
    // exactly this copy; the patch slots lie inside the copied blob.
    unsafe {
        core::ptr::copy_nonoverlapping(start, dst, len);
        let patch = dst.add(patch_off) as *mut u64;
        patch.write_volatile(super::mmu::current_root().as_u64());
        patch
            .add(1)
            .write_volatile(percpu::kernel_stack_top_for(core_id));
        patch.add(2).write_volatile(ap_main as usize as u64);
        patch.add(3).write_volatile(core_id as u64);
    }
}

/// Start every secondary core (APIC ids are sequential under QEMU).
#[cfg(target_os = "none")]
pub fn start_cores() {
    // The trampoline executes at its physical address the instant paging
    // turns on, so that address must translate 1:1 in the kernel tables.
    let tramp = crate::mm::VirtAddr::new(TRAMPOLINE_PHYS);
    if crate::mm::paging::kernel_space()
        .map(
            tramp,
            crate::mm::PhysAddr::new(TRAMPOLINE_PHYS),
            crate::mm::PageFlags::WRITE,
        )
        .is_err()
    {
        println!("[SMP] trampoline page unavailable, staying single-core");
        return;
    }

    let bsp = apic::local_id();
    let mut expected = 1;

    for core_id in 1..MAX_CORES {
        let apic_id = core_id as u32;
        if apic_id == bsp {
            continue;
        }
        install_trampoline(core_id);

        apic::send_init(apic_id);
        busy_wait(1_000_000);
        apic::send_sipi(apic_id, SIPI_VECTOR);
        busy_wait(1_000_000);
        if percpu::online_count() < expected {
            apic::send_sipi(apic_id, SIPI_VECTOR);
        }

        // Give the core a bounded window to report in.
        let mut spins = 0;
        while percpu::online_count() < expected && spins < 64 {
            busy_wait(1_000_000);
            spins += 1;
        }
        if percpu::online_count() < expected {
            println!("[SMP] core {} did not come online", core_id);
        } else {
            expected += 1;
        }
    }
    let _ = crate::mm::paging::kernel_space().unmap(tramp);
    println!("[SMP] {} core(s) online", percpu::online_count() + 1);
}

/// First Rust code on a fresh AP: per-core descriptor tables, syscall
/// MSRs, local interrupt controller and timer, then halt until scheduled.
extern "C" fn ap_main(core_id: u64) -> ! {
    percpu::init_core(core_id as usize);
    super::gdt::init(core_id as usize);
    super::idt::init();
    super::syscall::init();
    apic::enable_local();
    super::timer::init();
    percpu::mark_online();
    super::idle_loop();
}
