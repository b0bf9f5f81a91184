//! Kernel heap allocator
//!
//! One global arena in the kernel half, managed as a doubly-linked list of
//! blocks whose headers live inline in the arena. Blocks that neighbour each
//! other in memory neighbour each other in the list, and adjacent free
//! blocks are merged eagerly. `malloc` is a first-fit forward scan; when the
//! arena runs dry the allocator asks the PFA for one more frame and maps it
//! at the arena end.
//!
//! The heap itself is not thread-safe; the [`LockedKernelHeap`] wrapper
//! serialises callers, and scheduler paths additionally run under the task
//! lock.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::mm::{PageFlags, PAGE_SIZE};

/// Virtual base of the heap arena, above every bootloader-owned region.
pub const HEAP_BASE: u64 = 0xFFFF_E000_0000_0000;

/// Hard ceiling for lazy growth (256 MiB arena).
pub const HEAP_LIMIT: u64 = HEAP_BASE + 256 * 1024 * 1024;

/// Pages mapped up front before the first allocation.
pub const HEAP_INITIAL_PAGES: usize = 64;

/// Inline block header. `size` counts payload bytes only; the payload
/// starts immediately after the header.
#[repr(C)]
struct BlockHeader {
    size: usize,
    used: bool,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Payloads are carved at this alignment; requests above it go unserved
/// (page-aligned storage comes straight from the PFA instead).
const MIN_ALIGN: usize = 16;

/// Free-list heap over one contiguous arena.
pub struct KernelHeap {
    start: *mut u8,
    end: *mut u8,
    first: *mut BlockHeader,
}

// SAFETY: the arena is exclusively owned by the heap; the LockedKernelHeap
// wrapper serialises all access.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self {
            start: ptr::null_mut(),
            end: ptr::null_mut(),
            first: ptr::null_mut(),
        }
    }

    /// Adopt `[start, start + size)` as the arena, containing a single free
    /// block.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, unaliased, and at least one
    /// header larger than zero.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        let header = start as *mut BlockHeader;
        // SAFETY: caller guarantees the range is mapped and exclusive.
        unsafe {
            (*header).size = size - HEADER_SIZE;
            (*header).used = false;
            (*header).prev = ptr::null_mut();
            (*header).next = ptr::null_mut();
        }
        self.start = start;
        self.end = unsafe { start.add(size) };
        self.first = header;
    }

    fn last_block(&self) -> *mut BlockHeader {
        let mut cur = self.first;
        if cur.is_null() {
            return cur;
        }
        // SAFETY: list links only ever point at in-arena headers.
        unsafe {
            while !(*cur).next.is_null() {
                cur = (*cur).next;
            }
        }
        cur
    }

    /// The arena grew by `bytes` ending at the old `end`; fold the new
    /// range in as a trailing free block, merged with the previous tail if
    /// that tail is free.
    ///
    /// # Safety
    ///
    /// The `bytes` following the current arena end must have been mapped
    /// writable by the caller.
    pub unsafe fn extend(&mut self, bytes: usize) {
        let tail = self.last_block();
        let new_end = unsafe { self.end.add(bytes) };

        // SAFETY: tail is a valid in-arena header and the grown range is
        // mapped per the caller contract.
        unsafe {
            if !tail.is_null() && !(*tail).used {
                (*tail).size += bytes;
            } else {
                let header = self.end as *mut BlockHeader;
                (*header).size = bytes - HEADER_SIZE;
                (*header).used = false;
                (*header).prev = tail;
                (*header).next = ptr::null_mut();
                if !tail.is_null() {
                    (*tail).next = header;
                } else {
                    self.first = header;
                }
            }
        }
        self.end = new_end;
    }

    fn payload(header: *mut BlockHeader) -> *mut u8 {
        // SAFETY: the payload begins directly after the header, inside the
        // arena by construction.
        unsafe { (header as *mut u8).add(HEADER_SIZE) }
    }

    /// First-fit allocation of `n` bytes (rounded up to [`MIN_ALIGN`]).
    pub fn malloc(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 || self.first.is_null() {
            return None;
        }
        let want = n.div_ceil(MIN_ALIGN) * MIN_ALIGN;

        let mut cur = self.first;
        while !cur.is_null() {
            // SAFETY: cur walks the intrusive list inside the arena.
            unsafe {
                if !(*cur).used && (*cur).size >= want {
                    if (*cur).size > want + 2 * HEADER_SIZE {
                        // Split in place; the tail stays free.
                        let tail = Self::payload(cur).add(want) as *mut BlockHeader;
                        (*tail).size = (*cur).size - want - HEADER_SIZE;
                        (*tail).used = false;
                        (*tail).prev = cur;
                        (*tail).next = (*cur).next;
                        if !(*tail).next.is_null() {
                            (*(*tail).next).prev = tail;
                        }
                        (*cur).next = tail;
                        (*cur).size = want;
                    }
                    (*cur).used = true;
                    return NonNull::new(Self::payload(cur));
                }
                cur = (*cur).next;
            }
        }
        None
    }

    /// Release a payload pointer. Pointers whose header would fall outside
    /// the arena are ignored.
    pub fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let addr = p as usize;
        let lo = self.start as usize + HEADER_SIZE;
        let hi = self.end as usize;
        if addr < lo || addr >= hi {
            return;
        }

        let header = (addr - HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: header lies inside the arena; list invariants make the
        // prev/next neighbours memory neighbours.
        unsafe {
            (*header).used = false;

            // Absorb the next block if free.
            let next = (*header).next;
            if !next.is_null() && !(*next).used {
                (*header).size += HEADER_SIZE + (*next).size;
                (*header).next = (*next).next;
                if !(*header).next.is_null() {
                    (*(*header).next).prev = header;
                }
            }

            // Let a free previous block absorb us.
            let prev = (*header).prev;
            if !prev.is_null() && !(*prev).used {
                (*prev).size += HEADER_SIZE + (*header).size;
                (*prev).next = (*header).next;
                if !(*prev).next.is_null() {
                    (*(*prev).next).prev = prev;
                }
            }
        }
    }

    /// Snapshot of `(used, size)` per block, in list order. Test support.
    #[cfg(all(test, not(target_os = "none")))]
    fn blocks(&self) -> alloc::vec::Vec<(bool, usize)> {
        let mut out = alloc::vec::Vec::new();
        let mut cur = self.first;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        // SAFETY: traversal over the intrusive list inside the arena.
        unsafe {
            while !cur.is_null() {
                assert_eq!((*cur).prev, prev, "prev must invert next");
                out.push(((*cur).used, (*cur).size));
                prev = cur;
                cur = (*cur).next;
            }
        }
        out
    }
}

/// The global, lock-wrapped heap.
pub struct LockedKernelHeap(Mutex<KernelHeap>);

impl LockedKernelHeap {
    pub const fn new() -> Self {
        Self(Mutex::new(KernelHeap::empty()))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, KernelHeap> {
        self.0.lock()
    }
}

impl Default for LockedKernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: allocations hand out exclusive payload ranges; the inner Mutex
// serialises all list mutation.
unsafe impl GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return ptr::null_mut();
        }
        let mut heap = self.0.lock();
        loop {
            if let Some(p) = heap.malloc(layout.size()) {
                return p.as_ptr();
            }
            if expand(&mut heap).is_err() {
                return ptr::null_mut();
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().free(ptr);
    }
}

/// Grow the arena by one frame from the PFA, mapped at the current end.
fn expand(heap: &mut KernelHeap) -> Result<(), crate::error::KernelError> {
    use crate::error::KernelError;

    let end = heap.end as u64;
    if end == 0 || end + PAGE_SIZE as u64 > HEAP_LIMIT {
        return Err(KernelError::OutOfMemory);
    }

    let frame = { crate::mm::frame::FRAME_ALLOCATOR.lock().alloc(1)? };
    crate::mm::paging::kernel_map(crate::mm::VirtAddr::new(end), frame, PageFlags::WRITE)?;
    // SAFETY: the page was just mapped writable at the arena end.
    unsafe {
        heap.extend(PAGE_SIZE);
    }
    Ok(())
}

/// Map the initial arena and hand it to the allocator. Boot halts on
/// failure.
pub fn init() {
    for i in 0..HEAP_INITIAL_PAGES {
        let frame = {
            crate::mm::frame::FRAME_ALLOCATOR
                .lock()
                .alloc(1)
                .expect("no frames left for the kernel heap")
        };
        let va = crate::mm::VirtAddr::new(HEAP_BASE + (i * PAGE_SIZE) as u64);
        crate::mm::paging::kernel_map(va, frame, PageFlags::WRITE)
            .expect("mapping the kernel heap failed");
    }

    // SAFETY: the pages above were just mapped writable and are unaliased.
    unsafe {
        crate::HEAP
            .lock()
            .init(HEAP_BASE as *mut u8, HEAP_INITIAL_PAGES * PAGE_SIZE);
    }
    println!(
        "[MM] kernel heap at {:#x}, {} KiB initial",
        HEAP_BASE,
        HEAP_INITIAL_PAGES * PAGE_SIZE / 1024
    );
}
