//! Vesper kernel binary
//!
//! On x86_64 the `bootloader_api` shim hands over its boot info, which is
//! translated into the kernel's own record before the shared boot path
//! runs. On AArch64 the entry point lives in `arch::aarch64::boot`; this
//! file only contributes the panic handler there.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use core::panic::PanicInfo;

#[cfg(target_os = "none")]
use vesper_kernel::println;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    vesper_kernel::arch::halt();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64_entry {
    use bootloader_api::{
        config::{BootloaderConfig, Mapping},
        info::MemoryRegionKind,
        BootInfo,
    };
    use vesper_kernel::{
        bootinfo,
        bootinfo::{FramebufferInfo, MemoryMapEntry, MEMORY_TYPE_CONVENTIONAL},
        bootstrap,
        mm::{KERNEL_BASE, PAGE_SIZE},
    };

    /// Keep every bootloader-chosen mapping (kernel, stack, physical
    /// memory, boot info, framebuffer) inside the shared kernel half.
    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config.mappings.dynamic_range_start = Some(KERNEL_BASE);
        config
    };

    bootloader_api::entry_point!(kernel_entry, config = &BOOTLOADER_CONFIG);

    fn kernel_entry(boot_info: &'static mut BootInfo) -> ! {
        let physical_memory_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory");

        let memory_map = bootinfo::store_memory_map(boot_info.memory_regions.iter().map(|r| {
            MemoryMapEntry {
                kind: match r.kind {
                    MemoryRegionKind::Usable => MEMORY_TYPE_CONVENTIONAL,
                    _ => 0,
                },
                physical_start: r.start,
                number_of_pages: (r.end - r.start) / PAGE_SIZE as u64,
            }
        }));

        let initrd = boot_info.ramdisk_addr.into_option().map(|addr| {
            // SAFETY: the bootloader maps the ramdisk at `addr` for the
            // kernel's lifetime.
            unsafe {
                core::slice::from_raw_parts(addr as *const u8, boot_info.ramdisk_len as usize)
            }
        });

        let framebuffer = boot_info.framebuffer.as_ref().into_option().map(|fb| {
            let fb_info = fb.info();
            FramebufferInfo {
                base: fb.buffer().as_ptr() as u64,
                size: fb_info.byte_len,
                width: fb_info.width,
                height: fb_info.height,
                stride: fb_info.stride,
            }
        });

        let info = bootinfo::BootInfo {
            physical_memory_offset,
            framebuffer,
            memory_map,
            initrd,
            acpi_rsdp: boot_info.rsdp_addr.into_option(),
        };
        bootstrap::kernel_main(info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
