//! Per-process address spaces
//!
//! Each address space is a 4-level radix tree of 512-entry tables keyed on
//! the virtual address. The upper quarter of every root aliases the shared
//! kernel subtree, so kernel mappings appear identically everywhere. Leaf
//! entries carry a frame number plus architecture attribute bits translated
//! from the neutral [`PageFlags`] set; the translation itself lives in
//! `arch::mmu`.
//!
//! Leaf frames are owned by their mappings and table frames by the tree
//! that links them, each through the PFA refcounts, so copy-on-write
//! sharing across `fork` keeps every frame alive exactly as long as
//! something references it.

use crate::{
    arch::mmu,
    error::{KernelError, KernelResult},
    mm::{frame::FRAME_ALLOCATOR, PageFlags, PhysAddr, VirtAddr, KERNEL_BASE, PAGE_SIZE},
};

/// Entries per table at every level.
pub const TABLE_ENTRIES: usize = 512;

/// Root index where the kernel half begins (the upper quarter).
pub const KERNEL_HALF_FIRST_INDEX: usize = 384;

const _: () = assert!(VirtAddr::new(KERNEL_BASE).table_index(3) == KERNEL_HALF_FIRST_INDEX);

/// A paging structure rooted at one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysAddr,
}

fn table_mut(frame: PhysAddr) -> *mut u64 {
    crate::bootinfo::phys_to_virt(frame.as_u64()) as *mut u64
}

/// Acquire and zero one frame for use as a paging table. The tree owning
/// the table holds its single reference.
pub fn create_table() -> KernelResult<PhysAddr> {
    let frame = {
        let mut pfa = FRAME_ALLOCATOR.lock();
        let frame = pfa.alloc(1)?;
        let _ = pfa.ref_inc(frame);
        frame
    };
    // SAFETY: the frame was just locked for exclusive use and the linear
    // mapping covers all of physical memory.
    unsafe {
        core::ptr::write_bytes(table_mut(frame), 0, PAGE_SIZE / 8);
    }
    Ok(frame)
}

impl AddressSpace {
    /// Adopt an existing root (the boot tables).
    pub const fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// A fresh address space whose kernel half aliases `kernel`'s.
    pub fn new(kernel: &AddressSpace) -> KernelResult<Self> {
        let root = create_table()?;
        let space = Self { root };
        space.clone_higher_half(kernel);
        Ok(space)
    }

    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Share the kernel subtree: copy the upper-quarter root entries from
    /// `src`. Done exactly once per new address space.
    pub fn clone_higher_half(&self, src: &AddressSpace) {
        let from = table_mut(src.root);
        let to = table_mut(self.root);
        // SAFETY: both roots are live table frames under the linear mapping;
        // the copied entries point into the shared kernel subtree.
        unsafe {
            for idx in KERNEL_HALF_FIRST_INDEX..TABLE_ENTRIES {
                *to.add(idx) = *from.add(idx);
            }
        }
    }

    /// Walk to the leaf table for `v`, creating intermediate tables when
    /// `create` is set. Returns a pointer to the leaf entry slot.
    fn walk(&self, v: VirtAddr, create: bool) -> KernelResult<*mut u64> {
        let mut table = self.root;
        for level in (1..=3).rev() {
            let slot = unsafe { table_mut(table).add(v.table_index(level)) };
            // SAFETY: slot indexes a live 512-entry table.
            let entry = unsafe { *slot };
            table = if mmu::entry_present(entry) {
                mmu::entry_frame(entry)
            } else {
                if !create {
                    return Err(KernelError::NotFound);
                }
                let child = create_table()?;
                // Install the child link carrying the child's own frame
                // number, never the parent's.
                // SAFETY: slot is the unique link for this subtree.
                unsafe {
                    *slot = mmu::encode_table(child);
                }
                child
            };
        }
        Ok(unsafe { table_mut(table).add(v.table_index(0)) })
    }

    /// Install `v -> p` with the given flags, creating intermediate tables
    /// as needed. Replacing a present leaf drops the old frame's reference
    /// before the new one is installed.
    pub fn map(&self, v: VirtAddr, p: PhysAddr, flags: PageFlags) -> KernelResult<()> {
        let slot = self.walk(v.page_base(), true)?;
        // SAFETY: slot is the leaf entry for `v` in this tree.
        unsafe {
            let old = *slot;
            if mmu::entry_present(old) {
                let _ = FRAME_ALLOCATOR.lock().ref_dec(mmu::entry_frame(old));
            }
            *slot = mmu::encode_leaf(p.frame_base(), flags);
        }
        let _ = FRAME_ALLOCATOR.lock().ref_inc(p.frame_base());
        Ok(())
    }

    /// Clear the leaf for `v` if present, dropping the frame reference and
    /// invalidating the TLB entry.
    pub fn unmap(&self, v: VirtAddr) -> KernelResult<()> {
        let slot = match self.walk(v.page_base(), false) {
            Ok(slot) => slot,
            Err(_) => return Ok(()),
        };
        // SAFETY: slot is the leaf entry for `v` in this tree.
        unsafe {
            let old = *slot;
            if mmu::entry_present(old) {
                let _ = FRAME_ALLOCATOR.lock().ref_dec(mmu::entry_frame(old));
                *slot = 0;
                mmu::invalidate(v);
            }
        }
        Ok(())
    }

    /// Current leaf for `v`, if any.
    pub fn translate(&self, v: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let slot = self.walk(v.page_base(), false).ok()?;
        // SAFETY: slot is the leaf entry for `v` in this tree.
        let entry = unsafe { *slot };
        if !mmu::entry_present(entry) {
            return None;
        }
        Some((mmu::entry_frame(entry), mmu::entry_flags(entry)))
    }

    /// Deep-copy the user portion of this space into `dst` for fork.
    ///
    /// Writable leaves lose WRITE and gain COW on *both* sides; every
    /// mirrored leaf bumps its frame's refcount. The kernel half is left to
    /// the `clone_higher_half` the destination already ran.
    pub fn fork_cow_into(&self, dst: &AddressSpace) -> KernelResult<()> {
        Self::fork_level(self.root, dst.root, 3)?;
        mmu::flush_all();
        Ok(())
    }

    fn fork_level(src: PhysAddr, dst: PhysAddr, level: usize) -> KernelResult<()> {
        let top = if level == 3 {
            KERNEL_HALF_FIRST_INDEX
        } else {
            TABLE_ENTRIES
        };
        for idx in 0..top {
            let src_slot = unsafe { table_mut(src).add(idx) };
            // SAFETY: src_slot indexes a live table frame.
            let entry = unsafe { *src_slot };
            if !mmu::entry_present(entry) {
                continue;
            }
            if level > 0 {
                let child = create_table()?;
                let dst_slot = unsafe { table_mut(dst).add(idx) };
                // SAFETY: dst_slot is the unique link for the new subtree.
                unsafe {
                    *dst_slot = mmu::encode_table(child);
                }
                Self::fork_level(mmu::entry_frame(entry), child, level - 1)?;
                continue;
            }

            let frame = mmu::entry_frame(entry);
            let mut flags = mmu::entry_flags(entry);
            if flags.contains(PageFlags::WRITE) {
                flags.remove(PageFlags::WRITE);
                flags.insert(PageFlags::COW);
                // SAFETY: rewriting the leaf we just read; the full TLB
                // flush after the walk publishes the downgrade.
                unsafe {
                    *src_slot = mmu::encode_leaf(frame, flags);
                }
            }
            let dst_slot = unsafe { table_mut(dst).add(idx) };
            // SAFETY: dst_slot was zeroed when its table was created.
            unsafe {
                *dst_slot = mmu::encode_leaf(frame, flags);
            }
            let _ = FRAME_ALLOCATOR.lock().ref_inc(frame);
        }
        Ok(())
    }

    /// Release the user portion: drop every mapped frame's reference and
    /// free every intermediate table. The root stays alive (it may still be
    /// the active space); [`release_root`](Self::release_root) frees it.
    pub fn teardown_user(&self) {
        Self::teardown_level(self.root, 3);
    }

    /// Free the root table frame. The space must no longer be active on
    /// any core.
    pub fn release_root(&self) {
        let _ = FRAME_ALLOCATOR.lock().ref_dec(self.root);
    }

    fn teardown_level(table: PhysAddr, level: usize) {
        let top = if level == 3 {
            KERNEL_HALF_FIRST_INDEX
        } else {
            TABLE_ENTRIES
        };
        for idx in 0..top {
            let slot = unsafe { table_mut(table).add(idx) };
            // SAFETY: slot indexes a live table frame being torn down.
            let entry = unsafe { *slot };
            if !mmu::entry_present(entry) {
                continue;
            }
            let frame = mmu::entry_frame(entry);
            if level > 0 {
                Self::teardown_level(frame, level - 1);
            }
            let _ = FRAME_ALLOCATOR.lock().ref_dec(frame);
            // SAFETY: as above; the subtree is unreachable after this.
            unsafe {
                *slot = 0;
            }
        }
    }

    /// Make this the active address space on the calling core.
    pub fn make_current(&self) {
        mmu::set_current_root(self.root);
    }
}

static KERNEL_SPACE: spin::Once<AddressSpace> = spin::Once::new();

/// Adopt the boot page tables as the canonical kernel space.
pub fn init() {
    KERNEL_SPACE.call_once(|| AddressSpace::from_root(mmu::boot_kernel_root()));
}

/// The canonical kernel address space (boot tables).
pub fn kernel_space() -> &'static AddressSpace {
    KERNEL_SPACE
        .get()
        .expect("paging::kernel_space called before paging::init")
}

/// Map a page into the shared kernel half. Visible in every address space
/// through the aliased upper quarter.
pub fn kernel_map(v: VirtAddr, p: PhysAddr, flags: PageFlags) -> KernelResult<()> {
    if !v.is_kernel_half() {
        return Err(KernelError::InvalidArgument);
    }
    kernel_space().map(v, p, flags)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{
        bootinfo,
        mm::page_fault::{handle_page_fault, PageFaultInfo},
        test_support::setup_phys_arena,
    };

    fn refcount(frame: PhysAddr) -> u16 {
        FRAME_ALLOCATOR.lock().refcount(frame).expect("in range")
    }

    fn fill_page(frame: PhysAddr, byte: u8) {
        // SAFETY: the frame is inside the leaked test arena.
        unsafe {
            core::ptr::write_bytes(bootinfo::phys_to_virt(frame.as_u64()), byte, PAGE_SIZE);
        }
    }

    fn page_byte(frame: PhysAddr) -> u8 {
        // SAFETY: as in `fill_page`.
        unsafe { *bootinfo::phys_to_virt(frame.as_u64()) }
    }

    #[test]
    fn map_translate_replace_and_unmap_track_refcounts() {
        let _guard = crate::lock_global_state_for_test();
        setup_phys_arena();

        let kernel = AddressSpace::from_root(create_table().expect("root"));
        let space = AddressSpace::new(&kernel).expect("fresh space");
        let va = VirtAddr::new(0x40_0000);

        let first = { FRAME_ALLOCATOR.lock().alloc(1).expect("frame") };
        space
            .map(va, first, PageFlags::USER | PageFlags::WRITE)
            .expect("map");
        assert_eq!(
            space.translate(va),
            Some((first, PageFlags::USER | PageFlags::WRITE))
        );
        assert_eq!(refcount(first), 1);

        // Idempotent replacement drops the old frame's reference.
        let second = { FRAME_ALLOCATOR.lock().alloc(1).expect("frame") };
        space
            .map(va, second, PageFlags::USER | PageFlags::WRITE)
            .expect("remap");
        assert_eq!(refcount(first), 0, "replaced frame goes back to the pool");
        assert_eq!(refcount(second), 1);

        space.unmap(va).expect("unmap");
        assert_eq!(space.translate(va), None);
        assert_eq!(refcount(second), 0);

        space.teardown_user();
        space.release_root();
        kernel.release_root();
    }

    #[test]
    fn fork_cow_shares_then_duplicates_on_write_fault() {
        let _guard = crate::lock_global_state_for_test();
        setup_phys_arena();

        let kernel = AddressSpace::from_root(create_table().expect("root"));
        let parent = AddressSpace::new(&kernel).expect("parent space");
        let va = VirtAddr::new(0x40_0000);

        let frame = { FRAME_ALLOCATOR.lock().alloc(1).expect("frame") };
        parent
            .map(va, frame, PageFlags::USER | PageFlags::WRITE)
            .expect("map");
        fill_page(frame, 0x5A);

        let child = AddressSpace::new(&kernel).expect("child space");
        parent.fork_cow_into(&child).expect("fork");

        // Both sides lost WRITE, gained COW, and share the frame.
        let expect = PageFlags::USER | PageFlags::COW;
        assert_eq!(parent.translate(va), Some((frame, expect)));
        assert_eq!(child.translate(va), Some((frame, expect)));
        assert_eq!(refcount(frame), 2);

        // A write fault in the parent duplicates the page.
        let info = PageFaultInfo {
            address: va.as_u64() + 0x10,
            was_write: true,
            was_user: true,
            instruction_pointer: 0,
        };
        handle_page_fault(&parent, &info).expect("COW fault resolves");

        let (new_frame, new_flags) = parent.translate(va).expect("still mapped");
        assert_ne!(new_frame, frame, "the parent now owns a private copy");
        assert_eq!(new_flags, PageFlags::USER | PageFlags::WRITE);
        assert_eq!(page_byte(new_frame), 0x5A, "contents were copied");
        assert_eq!(refcount(frame), 1, "the original dropped to the child's share");
        assert_eq!(refcount(new_frame), 1);
        assert_eq!(
            child.translate(va),
            Some((frame, expect)),
            "the child still sees the original, untouched"
        );

        // A read fault is not a COW hit and must not be resolved.
        let read_info = PageFaultInfo {
            was_write: false,
            ..info
        };
        assert!(handle_page_fault(&child, &read_info).is_err());

        // Child exit restores the pre-fork accounting.
        child.teardown_user();
        child.release_root();
        assert_eq!(refcount(frame), 0, "last share freed the original frame");

        parent.teardown_user();
        parent.release_root();
        assert_eq!(refcount(new_frame), 0);
        kernel.release_root();
    }
}
