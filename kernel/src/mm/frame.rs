//! Physical page-frame allocator
//!
//! Ownership of every physical frame is tracked by one bit in a bitmap that
//! spans `[base, base + length)`. Bit `i` set means frame `base + i * 4K` is
//! owned by someone. An optional refcount array (one 16-bit counter per
//! frame) backs copy-on-write sharing: a frame with a non-zero refcount must
//! have its bit set, and the decrement that reaches zero clears the bit.
//!
//! Allocation is a linear scan, O(total frames); acceptable because the PFA
//! only serves kernel data structures and COW faults, never per-user-object
//! allocation.

use spin::Mutex;

use crate::{
    bootinfo::MemoryMapEntry,
    error::{KernelError, KernelResult},
    mm::{pages_for, PhysAddr, PAGE_SIZE},
};

/// Bitmap frame allocator state.
pub struct FrameAllocator {
    /// Lowest physical address covered by the bitmap.
    base: u64,
    /// Bytes covered, from `base`.
    length: u64,
    /// Bitmap storage; one bit per frame, set = locked.
    bitmap: *mut u8,
    bitmap_len: usize,
    /// Per-frame share counters, present once [`enable_refcounts`] ran.
    refcounts: *mut u16,
    refcount_len: usize,
}

// SAFETY: The raw pointers refer to boot-reserved physical storage that no
// other code aliases. All mutation happens behind the global Mutex (or, in
// tests, on a locally owned allocator).
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// An allocator covering nothing. Every operation fails until
    /// [`init_from_map`](Self::init_from_map) runs.
    pub const fn empty() -> Self {
        Self {
            base: 0,
            length: 0,
            bitmap: core::ptr::null_mut(),
            bitmap_len: 0,
            refcounts: core::ptr::null_mut(),
            refcount_len: 0,
        }
    }

    /// Build the bitmap from the boot memory map.
    ///
    /// The first CONVENTIONAL region large enough provides the bitmap
    /// storage. The whole bitmap starts out locked, CONVENTIONAL ranges are
    /// then cleared, and finally the frames holding the bitmap itself are
    /// re-locked at byte granularity (whole bitmap bytes, eight frames per
    /// byte).
    ///
    /// `translate` turns a physical address into a dereferenceable pointer
    /// (the linear physical mapping on a live kernel).
    pub fn init_from_map(
        &mut self,
        map: &[MemoryMapEntry],
        translate: impl Fn(u64) -> *mut u8,
    ) -> KernelResult<()> {
        let base = map
            .iter()
            .map(|e| e.physical_start)
            .min()
            .ok_or(KernelError::InvalidArgument)?;
        let end = map
            .iter()
            .map(|e| e.end())
            .max()
            .ok_or(KernelError::InvalidArgument)?;

        let length = end - base;
        let total_frames = (length as usize) / PAGE_SIZE;
        let bitmap_len = total_frames.div_ceil(8);

        // Bitmap storage: first conventional region that can hold it.
        let storage = map
            .iter()
            .find(|e| e.is_conventional() && e.number_of_pages as usize * PAGE_SIZE >= bitmap_len)
            .ok_or(KernelError::OutOfMemory)?;
        let bitmap_phys = storage.physical_start;

        self.base = base;
        self.length = length;
        self.bitmap = translate(bitmap_phys);
        self.bitmap_len = bitmap_len;

        // Everything locked until proven conventional.
        // SAFETY: `bitmap` points at `bitmap_len` bytes of conventional RAM
        // reserved above; nothing else references the region yet.
        unsafe {
            core::ptr::write_bytes(self.bitmap, 0xFF, bitmap_len);
        }

        for entry in map.iter().filter(|e| e.is_conventional()) {
            let first = (entry.physical_start - base) as usize / PAGE_SIZE;
            let count = entry.number_of_pages as usize;
            for idx in first..first + count {
                self.clear_bit(idx);
            }
        }

        // Re-lock the frames the bitmap lives in. Whole bitmap bytes are
        // filled here, so the lock granularity is eight frames.
        let first_frame = (bitmap_phys - base) as usize / PAGE_SIZE;
        let frame_count = pages_for(bitmap_len);
        let first_byte = first_frame / 8;
        let last_byte = (first_frame + frame_count - 1) / 8;
        for byte in first_byte..=last_byte {
            // SAFETY: byte < bitmap_len because the bitmap's own frames are
            // inside the covered span.
            unsafe {
                *self.bitmap.add(byte) = 0xFF;
            }
        }

        Ok(())
    }

    /// Carve the refcount array out of free frames and seed it: every frame
    /// currently locked starts at refcount 1, so the "bit set iff refcount
    /// non-zero" invariant holds from the first moment the array exists.
    pub fn enable_refcounts(&mut self, translate: impl Fn(u64) -> *mut u8) -> KernelResult<()> {
        let total = self.total_frames();
        let bytes = total * core::mem::size_of::<u16>();
        let frames = pages_for(bytes);

        let storage = self.find_free(frames).ok_or(KernelError::OutOfMemory)?;
        self.set_lock(storage, frames, true)?;

        self.refcounts = translate(storage.as_u64()) as *mut u16;
        self.refcount_len = total;

        for idx in 0..total {
            let seed: u16 = if self.bit(idx) { 1 } else { 0 };
            // SAFETY: idx < refcount_len and the storage frames were locked
            // for exclusive use above.
            unsafe {
                *self.refcounts.add(idx) = seed;
            }
        }
        Ok(())
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn total_frames(&self) -> usize {
        (self.length as usize) / PAGE_SIZE
    }

    fn frame_index(&self, addr: PhysAddr) -> KernelResult<usize> {
        let a = addr.frame_base().as_u64();
        // Half-open interval: the last valid frame starts at base+length-4K.
        if a < self.base || a >= self.base + self.length {
            return Err(KernelError::OutOfRange);
        }
        Ok(((a - self.base) as usize) / PAGE_SIZE)
    }

    fn bit(&self, idx: usize) -> bool {
        // SAFETY: callers pass idx < total_frames, so idx/8 < bitmap_len.
        unsafe { *self.bitmap.add(idx / 8) & (1 << (idx % 8)) != 0 }
    }

    fn set_bit(&mut self, idx: usize) {
        // SAFETY: as in `bit`.
        unsafe {
            *self.bitmap.add(idx / 8) |= 1 << (idx % 8);
        }
    }

    fn clear_bit(&mut self, idx: usize) {
        // SAFETY: as in `bit`.
        unsafe {
            *self.bitmap.add(idx / 8) &= !(1 << (idx % 8));
        }
    }

    /// Lowest-address run of `count` free frames, or None when no such run
    /// exists.
    pub fn find_free(&self, count: usize) -> Option<PhysAddr> {
        if count == 0 || self.bitmap.is_null() {
            return None;
        }

        let total = self.total_frames();
        let mut run = 0;
        let mut start = 0;
        for idx in 0..total {
            if self.bit(idx) {
                run = 0;
                continue;
            }
            if run == 0 {
                start = idx;
            }
            run += 1;
            if run == count {
                return Some(PhysAddr::new(self.base + (start * PAGE_SIZE) as u64));
            }
        }
        None
    }

    /// Set or clear `count` consecutive bits starting at the frame
    /// containing `addr`. Fails `OutOfRange` when any touched frame lies
    /// outside `[base, base + length)`.
    pub fn set_lock(&mut self, addr: PhysAddr, count: usize, lock: bool) -> KernelResult<()> {
        let first = self.frame_index(addr)?;
        if first + count > self.total_frames() {
            return Err(KernelError::OutOfRange);
        }
        for idx in first..first + count {
            if lock {
                self.set_bit(idx);
            } else {
                self.clear_bit(idx);
            }
        }
        Ok(())
    }

    /// Find and lock `count` consecutive frames in one step.
    pub fn alloc(&mut self, count: usize) -> KernelResult<PhysAddr> {
        let addr = self.find_free(count).ok_or(KernelError::OutOfMemory)?;
        self.set_lock(addr, count, true)?;
        Ok(addr)
    }

    pub fn has_refcounts(&self) -> bool {
        !self.refcounts.is_null()
    }

    /// Current share count of a frame (0 when refcounting is off).
    pub fn refcount(&self, addr: PhysAddr) -> KernelResult<u16> {
        let idx = self.frame_index(addr)?;
        if !self.has_refcounts() {
            return Ok(0);
        }
        // SAFETY: idx < refcount_len by frame_index.
        Ok(unsafe { *self.refcounts.add(idx) })
    }

    /// Bump a frame's share count, locking its bit.
    pub fn ref_inc(&mut self, addr: PhysAddr) -> KernelResult<()> {
        let idx = self.frame_index(addr)?;
        if !self.has_refcounts() {
            return Ok(());
        }
        self.set_bit(idx);
        // SAFETY: idx < refcount_len by frame_index.
        unsafe {
            let p = self.refcounts.add(idx);
            *p = (*p).saturating_add(1);
        }
        Ok(())
    }

    /// Drop one share. The decrement that reaches zero clears the bitmap
    /// bit, returning the frame to the free pool.
    pub fn ref_dec(&mut self, addr: PhysAddr) -> KernelResult<u16> {
        let idx = self.frame_index(addr)?;
        if !self.has_refcounts() {
            return Ok(0);
        }
        // SAFETY: idx < refcount_len by frame_index.
        let remaining = unsafe {
            let p = self.refcounts.add(idx);
            *p = (*p).saturating_sub(1);
            *p
        };
        if remaining == 0 {
            self.clear_bit(idx);
        }
        Ok(remaining)
    }
}

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

/// Bring the global allocator up from the boot memory map and attach the
/// refcount array. Boot halts on failure; there is nothing to run without
/// physical memory.
pub fn init() {
    let info = crate::bootinfo::get();
    let mut pfa = FRAME_ALLOCATOR.lock();
    pfa.init_from_map(info.memory_map, crate::bootinfo::phys_to_virt)
        .expect("frame allocator init failed");
    pfa.enable_refcounts(crate::bootinfo::phys_to_virt)
        .expect("refcount array allocation failed");
    let total = pfa.total_frames();
    drop(pfa);
    println!("[MM] frame allocator ready, {} frames tracked", total);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{vec, vec::Vec};

    use super::*;
    use crate::bootinfo::MEMORY_TYPE_CONVENTIONAL;

    /// Allocator over a synthetic physical arena starting at `base`.
    fn fixture(map: &[MemoryMapEntry], base: u64) -> (FrameAllocator, Vec<u8>) {
        let span: usize = map
            .iter()
            .map(|e| e.end())
            .max()
            .map(|end| (end - base) as usize)
            .unwrap_or(0);
        let mut arena = vec![0u8; span];
        let ptr = arena.as_mut_ptr();
        let mut pfa = FrameAllocator::empty();
        pfa.init_from_map(map, |phys| unsafe { ptr.add((phys - base) as usize) })
            .expect("init over synthetic map should succeed");
        (pfa, arena)
    }

    fn one_region() -> [MemoryMapEntry; 1] {
        [MemoryMapEntry {
            kind: MEMORY_TYPE_CONVENTIONAL,
            physical_start: 0x1000,
            number_of_pages: 256,
        }]
    }

    #[test]
    fn boot_scenario_bitmap_layout() {
        // Memory map [{type=7, start=0x1000, pages=256}]: 32 bitmap bytes,
        // bits 0..=7 locked for the bitmap's own frame, the rest clear.
        let (pfa, arena) = fixture(&one_region(), 0x1000);
        assert_eq!(pfa.total_frames(), 256);
        assert_eq!(pfa.bitmap_len, 32);
        assert_eq!(arena[0], 0xFF, "first bitmap byte fully locked");
        for (i, byte) in arena[1..32].iter().enumerate() {
            assert_eq!(*byte, 0, "bitmap byte {} should be clear", i + 1);
        }
    }

    #[test]
    fn find_free_returns_lowest_run() {
        let (mut pfa, _arena) = fixture(&one_region(), 0x1000);
        // Frames 0..8 are locked by the bitmap, so the lowest free frame is 8.
        let first = pfa.find_free(1).expect("256-frame map has free frames");
        assert_eq!(first.as_u64(), 0x1000 + 8 * PAGE_SIZE as u64);

        // Punch a hole: lock frames 8..10, leaving 10 as the next run start.
        pfa.set_lock(first, 2, true).expect("locking free frames");
        let next = pfa.find_free(4).expect("long run still available");
        assert_eq!(next.as_u64(), 0x1000 + 10 * PAGE_SIZE as u64);
    }

    #[test]
    fn set_lock_covers_the_last_valid_frame() {
        let (mut pfa, _arena) = fixture(&one_region(), 0x1000);
        let last = PhysAddr::new(0x1000 + 255 * PAGE_SIZE as u64);
        pfa.set_lock(last, 1, true)
            .expect("last frame is inside the half-open interval");
        let past = PhysAddr::new(0x1000 + 256 * PAGE_SIZE as u64);
        assert_eq!(
            pfa.set_lock(past, 1, true),
            Err(KernelError::OutOfRange),
            "one past the end must fail"
        );
        assert_eq!(
            pfa.set_lock(last, 2, true),
            Err(KernelError::OutOfRange),
            "a run crossing the end must fail"
        );
    }

    #[test]
    fn refcounts_track_bitmap_bits() {
        let (mut pfa, mut arena) = fixture(&one_region(), 0x1000);
        let base = 0x1000;
        let ptr = arena.as_mut_ptr();
        pfa.enable_refcounts(|phys| unsafe { ptr.add((phys - base) as usize) })
            .expect("refcount storage fits the map");

        let frame = pfa.alloc(1).expect("allocation succeeds");
        pfa.ref_inc(frame).expect("in range");
        pfa.ref_inc(frame).expect("in range");
        assert_eq!(pfa.refcount(frame).unwrap(), 2);

        assert_eq!(pfa.ref_dec(frame).unwrap(), 1);
        let idx = (frame.as_u64() - base) as usize / PAGE_SIZE;
        assert!(pfa.bit(idx), "bit stays set while shares remain");

        assert_eq!(pfa.ref_dec(frame).unwrap(), 0);
        assert!(!pfa.bit(idx), "decrement to zero frees the frame");
    }

    #[test]
    fn bitmap_bit_iff_refcount_nonzero_after_seed() {
        let (mut pfa, mut arena) = fixture(&one_region(), 0x1000);
        let base = 0x1000;
        let ptr = arena.as_mut_ptr();
        pfa.enable_refcounts(|phys| unsafe { ptr.add((phys - base) as usize) })
            .expect("refcount storage fits the map");
        for idx in 0..pfa.total_frames() {
            let addr = PhysAddr::new(base + (idx * PAGE_SIZE) as u64);
            assert_eq!(
                pfa.bit(idx),
                pfa.refcount(addr).unwrap() > 0,
                "frame {} violates the bit/refcount invariant",
                idx
            );
        }
    }

    #[test]
    fn alloc_exhaustion_reports_none() {
        let map = [MemoryMapEntry {
            kind: MEMORY_TYPE_CONVENTIONAL,
            physical_start: 0x1000,
            number_of_pages: 16,
        }];
        let (mut pfa, _arena) = fixture(&map, 0x1000);
        // Bitmap byte-lock took the first 8 frames; 8 remain.
        assert!(pfa.find_free(16).is_none(), "no 16-frame run exists");
        pfa.alloc(8).expect("the remaining 8 frames are contiguous");
        assert_eq!(pfa.alloc(1), Err(KernelError::OutOfMemory));
    }
}
