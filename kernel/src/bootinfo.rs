//! Boot information handed over by the UEFI-style bootloader
//!
//! The bootloader protocol itself is an external interface; the kernel only
//! consumes the fields named here. On x86_64 the record is filled from
//! `bootloader_api::BootInfo`, on AArch64 by the early boot shim.

use spin::Once;

/// Memory-map entry type for usable conventional RAM (UEFI type 7).
pub const MEMORY_TYPE_CONVENTIONAL: u32 = 7;

/// One entry of the physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    /// UEFI memory type; only [`MEMORY_TYPE_CONVENTIONAL`] is allocatable.
    pub kind: u32,
    /// First byte of the region.
    pub physical_start: u64,
    /// Length in whole 4 KiB pages.
    pub number_of_pages: u64,
}

impl MemoryMapEntry {
    /// Exclusive end address of the region.
    pub const fn end(&self) -> u64 {
        self.physical_start + self.number_of_pages * crate::mm::PAGE_SIZE as u64
    }

    pub const fn is_conventional(&self) -> bool {
        self.kind == MEMORY_TYPE_CONVENTIONAL
    }
}

/// Framebuffer geometry as reported by the bootloader.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferInfo {
    pub base: u64,
    pub size: usize,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
}

/// The boot record the kernel keeps for its whole lifetime.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// Offset at which all physical memory is mapped in the kernel half.
    pub physical_memory_offset: u64,
    /// Framebuffer handed over by the firmware, if any.
    pub framebuffer: Option<FramebufferInfo>,
    /// Physical memory map (lives in bootloader-provided storage).
    pub memory_map: &'static [MemoryMapEntry],
    /// Initial ramdisk (tar archive), still mapped where the loader put it.
    pub initrd: Option<&'static [u8]>,
    /// ACPI RSDP / EFI configuration table base, if reported.
    pub acpi_rsdp: Option<u64>,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

/// Upper bound on memory-map entries the kernel keeps.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 128;

static mut MEMORY_MAP_STORE: [MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES] = [MemoryMapEntry {
    kind: 0,
    physical_start: 0,
    number_of_pages: 0,
}; MAX_MEMORY_MAP_ENTRIES];

/// Copy the loader's memory map into kernel-owned storage (entries past
/// [`MAX_MEMORY_MAP_ENTRIES`] are dropped). Called exactly once, from the
/// single-threaded boot path.
pub fn store_memory_map(
    entries: impl Iterator<Item = MemoryMapEntry>,
) -> &'static [MemoryMapEntry] {
    let mut count = 0;
    // SAFETY: single-threaded boot, called once before `init`.
    unsafe {
        let store = &mut *core::ptr::addr_of_mut!(MEMORY_MAP_STORE);
        for entry in entries.take(MAX_MEMORY_MAP_ENTRIES) {
            store[count] = entry;
            count += 1;
        }
        let map_ref: &[MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES] = &*core::ptr::addr_of!(MEMORY_MAP_STORE);
        &map_ref[..count]
    }
}

/// Record the boot info exactly once, during early boot.
pub fn init(info: BootInfo) {
    BOOT_INFO.call_once(|| info);
}

/// The boot record. Panics if called before [`init`]; boot sequencing
/// guarantees the PFA is brought up after this is set.
pub fn get() -> &'static BootInfo {
    BOOT_INFO
        .get()
        .expect("bootinfo::get called before bootinfo::init")
}

/// Physical-to-virtual translation through the linear physical mapping.
#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (get().physical_memory_offset + phys) as *mut u8
}
