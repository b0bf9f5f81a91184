//! Page-fault resolution
//!
//! The only recoverable fault is a write hit on a copy-on-write leaf: the
//! faulting page is duplicated into a fresh frame, remapped writable, and
//! the old frame's reference dropped. Every other fault is fatal; the
//! architecture trap handler prints the register state and halts.

use crate::{
    error::{KernelError, KernelResult},
    mm::{frame::FRAME_ALLOCATOR, paging::AddressSpace, PageFlags, VirtAddr, PAGE_SIZE},
};

/// Fault description assembled by the architecture trap handler.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address that faulted.
    pub address: u64,
    /// Whether the access was a write.
    pub was_write: bool,
    /// Whether the fault came from user mode.
    pub was_user: bool,
    /// Instruction pointer at the time of the fault.
    pub instruction_pointer: u64,
}

/// Attempt to resolve a fault against the given address space.
///
/// Succeeds only for a write to a present, COW-tagged page. The duplicate
/// runs with only the current thread observable between the two TLB states:
/// the handler executes with interrupts off on the faulting core.
pub fn handle_page_fault(space: &AddressSpace, info: &PageFaultInfo) -> KernelResult<()> {
    if !info.was_write {
        return Err(KernelError::Unsupported);
    }

    let page = VirtAddr::new(info.address).page_base();
    let (old_frame, flags) = space.translate(page).ok_or(KernelError::NotFound)?;
    if !flags.contains(PageFlags::COW) {
        return Err(KernelError::Unsupported);
    }

    let new_frame = { FRAME_ALLOCATOR.lock().alloc(1)? };

    let src = crate::bootinfo::phys_to_virt(old_frame.as_u64());
    let dst = crate::bootinfo::phys_to_virt(new_frame.as_u64());
    // SAFETY: both frames are covered by the linear mapping; the new frame
    // was just locked for exclusive use.
    unsafe {
        core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
    }

    let mut new_flags = flags;
    new_flags.remove(PageFlags::COW);
    new_flags.insert(PageFlags::WRITE);

    // `map` replaces the present leaf, dropping the shared frame's
    // reference (which may free it) and taking one on the duplicate.
    space.map(page, new_frame, new_flags)?;
    crate::arch::mmu::invalidate(page);
    Ok(())
}

/// Report an unresolvable fault and halt the machine.
pub fn fatal(info: &PageFaultInfo) -> ! {
    println!(
        "[FAULT] unresolved page fault at {:#x} (write={}, user={}) ip={:#x}",
        info.address, info.was_write, info.was_user, info.instruction_pointer
    );
    crate::arch::halt();
}
