//! x86_64 page-table entry codec and TLB control
//!
//! Translates the neutral flag set into long-mode entry bits. COW clears
//! the hardware writable bit and sets a software-available bit so the
//! fault handler can tell a COW hit from a genuine protection violation.

use x86_64::registers::control::Cr3;

use crate::mm::{PageFlags, PhysAddr, VirtAddr};

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER_ACCESSIBLE: u64 = 1 << 2;
/// Software-available bit marking a copy-on-write leaf.
const COW_MARK: u64 = 1 << 9;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Leaf entry for `frame` with translated attribute bits.
pub fn encode_leaf(frame: PhysAddr, flags: PageFlags) -> u64 {
    let mut entry = (frame.as_u64() & ADDR_MASK) | PRESENT;
    if flags.contains(PageFlags::WRITE) {
        entry |= WRITABLE;
    }
    if flags.contains(PageFlags::USER) {
        entry |= USER_ACCESSIBLE;
    }
    if flags.contains(PageFlags::COW) {
        // Write-protect and tag: the write fault resolves the copy.
        entry &= !WRITABLE;
        entry |= COW_MARK;
    }
    entry
}

/// Link entry installing `table` as the child of the current level.
pub fn encode_table(table: PhysAddr) -> u64 {
    (table.as_u64() & ADDR_MASK) | PRESENT | WRITABLE | USER_ACCESSIBLE
}

pub fn entry_present(entry: u64) -> bool {
    entry & PRESENT != 0
}

pub fn entry_frame(entry: u64) -> PhysAddr {
    PhysAddr::new(entry & ADDR_MASK)
}

/// Recover the neutral flags from a leaf entry.
pub fn entry_flags(entry: u64) -> PageFlags {
    let mut flags = PageFlags::empty();
    if entry & WRITABLE != 0 {
        flags |= PageFlags::WRITE;
    }
    if entry & USER_ACCESSIBLE != 0 {
        flags |= PageFlags::USER;
    }
    if entry & COW_MARK != 0 {
        flags |= PageFlags::COW;
    }
    flags
}

/// Invalidate the TLB entry for one page on this core.
pub fn invalidate(v: VirtAddr) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(v.as_u64()));
    #[cfg(not(target_os = "none"))]
    let _ = v;
}

/// Flush the whole TLB on this core (CR3 reload).
pub fn flush_all() {
    #[cfg(target_os = "none")]
    {
        let (frame, flags) = Cr3::read();
        // SAFETY: rewriting CR3 with its current value only flushes.
        unsafe {
            Cr3::write(frame, flags);
        }
    }
}

/// Root of the active address space.
pub fn current_root() -> PhysAddr {
    let (frame, _) = Cr3::read();
    PhysAddr::new(frame.start_address().as_u64())
}

/// Root holding the kernel-half subtree at boot. On x86_64 the boot CR3
/// already carries both halves.
pub fn boot_kernel_root() -> PhysAddr {
    current_root()
}

/// Install `root` as the active address space.
pub fn set_current_root(root: PhysAddr) {
    let (current, flags) = Cr3::read();
    if current.start_address().as_u64() == root.as_u64() {
        return;
    }
    let frame = x86_64::structures::paging::PhysFrame::containing_address(
        x86_64::PhysAddr::new(root.as_u64()),
    );
    // SAFETY: root points at a valid top-level table whose kernel half
    // aliases the shared kernel subtree.
    unsafe {
        Cr3::write(frame, flags);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_entry_bits() {
        let frame = PhysAddr::new(0x1234_5000);
        for flags in [
            PageFlags::empty(),
            PageFlags::WRITE,
            PageFlags::USER,
            PageFlags::WRITE | PageFlags::USER,
            PageFlags::USER | PageFlags::COW,
        ] {
            let entry = encode_leaf(frame, flags);
            assert!(entry_present(entry));
            assert_eq!(entry_frame(entry), frame, "frame survives {:?}", flags);
            let mut expect = flags;
            if flags.contains(PageFlags::COW) {
                expect.remove(PageFlags::WRITE);
            }
            assert_eq!(entry_flags(entry), expect, "flags survive {:?}", flags);
        }
    }

    #[test]
    fn cow_entries_are_hardware_read_only() {
        let entry = encode_leaf(
            PhysAddr::new(0x9000),
            PageFlags::WRITE | PageFlags::USER | PageFlags::COW,
        );
        assert_eq!(entry & WRITABLE, 0, "COW must clear the writable bit");
        assert_ne!(entry & COW_MARK, 0);
        assert_ne!(entry & USER_ACCESSIBLE, 0);
    }

    #[test]
    fn table_links_carry_the_child_frame() {
        let child = PhysAddr::new(0xABC000);
        let entry = encode_table(child);
        assert!(entry_present(entry));
        assert_eq!(entry_frame(entry), child);
    }
}
