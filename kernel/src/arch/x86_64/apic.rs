//! Local APIC
//!
//! xAPIC MMIO programming: spurious vector + enable, the periodic timer
//! LVT, EOI, and the INIT/SIPI sequence used for AP start-up. The legacy
//! PICs are remapped and masked first so they cannot inject vectors over
//! the exception range.

use pic8259::ChainedPics;
use spin::Mutex;

use super::idt::{SPURIOUS_VECTOR, TIMER_VECTOR};

/// Physical base of the xAPIC register page.
const APIC_BASE: u64 = 0xFEE0_0000;

/// Kernel-half window the register page is mapped at. The page sits above
/// RAM, so the linear physical mapping does not reach it.
const APIC_VIRT: u64 = 0xFFFF_FFFF_FEE0_0000;

// Register offsets.
const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// LVT timer periodic mode bit.
const TIMER_PERIODIC: u32 = 1 << 17;

/// Divide-by-16 configuration.
const DIVIDE_BY_16: u32 = 0x3;

/// Remapped-then-masked legacy PICs.
static PICS: Mutex<ChainedPics> = Mutex::new(
    // SAFETY: 0x20/0x28 are the conventional remap offsets, clear of the
    // CPU exception vectors.
    unsafe { ChainedPics::new(0x20, 0x28) },
);

fn reg(offset: u64) -> *mut u32 {
    (APIC_VIRT + offset) as *mut u32
}

fn write(offset: u64, value: u32) {
    // SAFETY: the xAPIC page is device memory in the linear mapping; each
    // register is a 32-bit volatile slot.
    unsafe {
        core::ptr::write_volatile(reg(offset), value);
    }
}

fn read(offset: u64) -> u32 {
    // SAFETY: as in `write`.
    unsafe { core::ptr::read_volatile(reg(offset)) }
}

/// Mask the PICs, map the register page into the kernel half, and
/// software-enable the local APIC on this core.
pub fn init() {
    crate::mm::paging::kernel_map(
        crate::mm::VirtAddr::new(APIC_VIRT),
        crate::mm::PhysAddr::new(APIC_BASE),
        crate::mm::PageFlags::WRITE,
    )
    .expect("mapping the local APIC registers failed");

    // SAFETY: remap + mask during single-threaded boot.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.disable();
    }
    enable_local();
}

/// Software-enable the local APIC (also run by every AP on itself).
pub fn enable_local() {
    write(REG_SPURIOUS, (SPURIOUS_VECTOR as u32) | 0x100);
}

/// This core's APIC id.
pub fn local_id() -> u32 {
    read(REG_ID) >> 24
}

/// Program the periodic tick (about 100 Hz under QEMU with the bus clock
/// divided by 16).
pub fn start_timer(initial_count: u32) {
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, (TIMER_VECTOR as u32) | TIMER_PERIODIC);
    write(REG_TIMER_INITIAL, initial_count);
}

/// Signal completion of the in-service interrupt.
pub fn end_of_interrupt() {
    write(REG_EOI, 0);
}

fn icr_wait() {
    // Delivery-status bit clears when the IPI has been sent.
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

/// Send INIT to the given APIC id.
pub fn send_init(apic_id: u32) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x0000_4500);
    icr_wait();
}

/// Send a STARTUP IPI pointing at `vector` (page number of the real-mode
/// trampoline).
pub fn send_sipi(apic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x0000_4600 | vector as u32);
    icr_wait();
}
