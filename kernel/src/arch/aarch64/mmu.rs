//! AArch64 page-table entry codec and TLB control
//!
//! Stage-1 4 KiB descriptors. COW sets the read-only access permission
//! plus a software-reserved bit (bit 55) so the fault handler can tell a
//! COW hit from a genuine permission fault. The kernel half lives in the
//! TTBR1 tables handed over by the loader; `set_current_root` only ever
//! switches TTBR0, the per-process user half.

use cortex_a::registers::{TTBR0_EL1, TTBR1_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use crate::mm::{PageFlags, PhysAddr, VirtAddr};

const VALID: u64 = 1 << 0;
/// Table link at levels 3..1, page descriptor at the leaf level.
const TABLE_OR_PAGE: u64 = 1 << 1;
/// Access flag; faults if clear, so always set.
const ACCESS_FLAG: u64 = 1 << 10;
/// Inner shareable.
const SHAREABLE_INNER: u64 = 0b11 << 8;
/// AP[1]: reachable from EL0.
const AP_EL0: u64 = 1 << 6;
/// AP[2]: read-only.
const AP_RO: u64 = 1 << 7;
/// Software-reserved bit marking a copy-on-write leaf.
const COW_MARK: u64 = 1 << 55;

const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Leaf entry for `frame` with translated attribute bits.
pub fn encode_leaf(frame: PhysAddr, flags: PageFlags) -> u64 {
    let mut entry =
        (frame.as_u64() & ADDR_MASK) | VALID | TABLE_OR_PAGE | ACCESS_FLAG | SHAREABLE_INNER;
    if !flags.contains(PageFlags::WRITE) {
        entry |= AP_RO;
    }
    if flags.contains(PageFlags::USER) {
        entry |= AP_EL0;
    }
    if flags.contains(PageFlags::COW) {
        // Read-only attribute plus the tag; the write fault resolves the
        // copy.
        entry |= AP_RO | COW_MARK;
    }
    entry
}

/// Link entry installing `table` as the child of the current level.
pub fn encode_table(table: PhysAddr) -> u64 {
    (table.as_u64() & ADDR_MASK) | VALID | TABLE_OR_PAGE
}

pub fn entry_present(entry: u64) -> bool {
    entry & VALID != 0
}

pub fn entry_frame(entry: u64) -> PhysAddr {
    PhysAddr::new(entry & ADDR_MASK)
}

/// Recover the neutral flags from a leaf entry.
pub fn entry_flags(entry: u64) -> PageFlags {
    let mut flags = PageFlags::empty();
    if entry & AP_RO == 0 {
        flags |= PageFlags::WRITE;
    }
    if entry & AP_EL0 != 0 {
        flags |= PageFlags::USER;
    }
    if entry & COW_MARK != 0 {
        flags |= PageFlags::COW;
    }
    flags
}

/// Invalidate the TLB entry for one page on this core.
pub fn invalidate(v: VirtAddr) {
    let page = v.page_base().as_u64() >> 12;
    // SAFETY: TLB maintenance only; barriers order it against the table
    // write that preceded the call.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) page,
        );
    }
}

/// Flush all stage-1 TLB entries on this core.
pub fn flush_all() {
    // SAFETY: TLB maintenance only.
    unsafe {
        core::arch::asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb");
    }
}

/// Root of the active user address space (TTBR0).
pub fn current_root() -> PhysAddr {
    PhysAddr::new(TTBR0_EL1.get_baddr())
}

/// Root holding the kernel-half subtree: the TTBR1 tables installed by
/// the loader.
pub fn boot_kernel_root() -> PhysAddr {
    PhysAddr::new(TTBR1_EL1.get_baddr())
}

/// Install `root` as the active user address space.
pub fn set_current_root(root: PhysAddr) {
    if TTBR0_EL1.get_baddr() == root.as_u64() {
        return;
    }
    TTBR0_EL1.set_baddr(root.as_u64());
    flush_all();
}
