//! ELF64 executable loader
//!
//! Validates a static little-endian executable and maps its `PT_LOAD`
//! segments into a destination address space. Because user pages are not
//! otherwise visible to the kernel, each segment's frames are briefly
//! mirror-mapped into the caller's active space at the same virtual
//! address while the payload is copied in.

use alloc::{sync::Arc, vec, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    fs::FileHandle,
    mm::{
        frame::FRAME_ALLOCATOR, pages_for, paging::AddressSpace, PageFlags, VirtAddr, PAGE_SIZE,
    },
};

/// ELF magic number
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// 64-bit class byte
const ELF_CLASS_64: u8 = 2;

/// Little-endian data byte
const ELF_DATA_LSB: u8 = 1;

/// Static executable file type
const ET_EXEC: u16 = 2;

/// Loadable program header type
const PT_LOAD: u32 = 1;

/// ELF file header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub os_abi: u8,
    pub abi_version: u8,
    pub padding: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Loaded-image record shared by a process and its forked children until
/// an exec replaces it (the `Arc` carries the share count).
#[derive(Debug)]
pub struct ImageRecord {
    /// Entry point from the file header.
    pub entry: u64,
    pub phentsize: u16,
    pub phnum: u16,
    /// Verbatim copy of the program-header table.
    pub phdr_copy: Vec<u8>,
}

/// Parse and validate the file header: magic, 64-bit little-endian,
/// System V ABI byte 0, static executable.
pub fn parse_header(bytes: &[u8]) -> KernelResult<Elf64Header> {
    if bytes.len() < core::mem::size_of::<Elf64Header>() {
        return Err(KernelError::InvalidElf);
    }
    // SAFETY: the length was checked and Elf64Header is plain repr(C) data
    // readable at any alignment.
    let header =
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Elf64Header) };

    if header.magic != ELF_MAGIC
        || header.class != ELF_CLASS_64
        || header.data != ELF_DATA_LSB
        || header.os_abi != 0
        || header.elf_type != ET_EXEC
    {
        return Err(KernelError::InvalidElf);
    }
    Ok(header)
}

/// Pull the `PT_LOAD` entries out of a program-header table copy.
pub fn load_segments(
    phdr_copy: &[u8],
    phentsize: u16,
    phnum: u16,
) -> KernelResult<Vec<Elf64ProgramHeader>> {
    let entry_size = phentsize as usize;
    if entry_size < core::mem::size_of::<Elf64ProgramHeader>()
        || phdr_copy.len() < entry_size * phnum as usize
    {
        return Err(KernelError::InvalidElf);
    }

    let mut out = Vec::new();
    for i in 0..phnum as usize {
        // SAFETY: bounds were checked above; the struct is plain repr(C)
        // data readable at any alignment.
        let phdr = unsafe {
            core::ptr::read_unaligned(
                phdr_copy[i * entry_size..].as_ptr() as *const Elf64ProgramHeader
            )
        };
        if phdr.p_type == PT_LOAD {
            if phdr.p_filesz > phdr.p_memsz {
                return Err(KernelError::InvalidElf);
            }
            out.push(phdr);
        }
    }
    Ok(out)
}

/// Load the executable behind `handle` into `dst`.
///
/// Every `PT_LOAD` segment gets `memsz` rounded up to whole pages of
/// contiguous frames, mapped USER|WRITE in `dst`; `filesz` bytes come from
/// the file and the rest of the final page stays zero.
pub fn load(handle: &mut FileHandle, dst: &AddressSpace) -> KernelResult<Arc<ImageRecord>> {
    let mut header_bytes = [0u8; core::mem::size_of::<Elf64Header>()];
    handle.seek(0)?;
    handle
        .read(&mut header_bytes)
        .map_err(|_| KernelError::InvalidElf)?;
    let header = parse_header(&header_bytes)?;

    let table_len = header.phentsize as usize * header.phnum as usize;
    let mut phdr_copy = vec![0u8; table_len];
    handle.seek(header.phoff).map_err(|_| KernelError::InvalidElf)?;
    handle
        .read(&mut phdr_copy)
        .map_err(|_| KernelError::InvalidElf)?;

    let segments = load_segments(&phdr_copy, header.phentsize, header.phnum)?;

    let current = AddressSpace::from_root(crate::arch::mmu::current_root());
    for phdr in &segments {
        let pages = pages_for(phdr.p_memsz as usize);
        if pages == 0 {
            continue;
        }
        let first = { FRAME_ALLOCATOR.lock().alloc(pages)? };

        for page in 0..pages {
            let frame = crate::mm::PhysAddr::new(first.as_u64() + (page * PAGE_SIZE) as u64);
            let va = VirtAddr::new(phdr.p_vaddr + (page * PAGE_SIZE) as u64);
            dst.map(va, frame, PageFlags::USER | PageFlags::WRITE)?;
            // Mirror into the active space so the copy below can reach the
            // segment through ordinary stores.
            current.map(va, frame, PageFlags::WRITE)?;
        }

        let base = phdr.p_vaddr as *mut u8;
        // SAFETY: the mirror mapping above makes [vaddr, vaddr + pages*4K)
        // writable in the active space.
        unsafe {
            core::ptr::write_bytes(base, 0, pages * PAGE_SIZE);
            handle.seek(phdr.p_offset)?;
            let payload = core::slice::from_raw_parts_mut(base, phdr.p_filesz as usize);
            handle.read(payload)?;
        }

        for page in 0..pages {
            let va = VirtAddr::new(phdr.p_vaddr + (page * PAGE_SIZE) as u64);
            current.unmap(va)?;
        }
    }

    Ok(Arc::new(ImageRecord {
        entry: header.entry,
        phentsize: header.phentsize,
        phnum: header.phnum,
        phdr_copy,
    }))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn valid_header() -> Elf64Header {
        Elf64Header {
            magic: ELF_MAGIC,
            class: ELF_CLASS_64,
            data: ELF_DATA_LSB,
            version: 1,
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
            elf_type: ET_EXEC,
            machine: 62,
            version2: 1,
            entry: 0x40_1000,
            phoff: 64,
            shoff: 0,
            flags: 0,
            ehsize: 64,
            phentsize: 56,
            phnum: 2,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    fn bytes_of<T>(v: &T) -> &[u8] {
        // SAFETY: reading the object representation of plain repr(C) data.
        unsafe {
            core::slice::from_raw_parts(v as *const T as *const u8, core::mem::size_of::<T>())
        }
    }

    #[test]
    fn accepts_a_static_little_endian_executable() {
        let header = valid_header();
        let parsed = parse_header(bytes_of(&header)).expect("valid header parses");
        assert_eq!(parsed.entry, 0x40_1000);
        assert_eq!(parsed.phnum, 2);
    }

    #[test]
    fn rejects_bad_magic_abi_and_type() {
        let mut h = valid_header();
        h.magic = [0; 4];
        assert_eq!(parse_header(bytes_of(&h)).map(|_| ()), Err(KernelError::InvalidElf));

        let mut h = valid_header();
        h.os_abi = 3;
        assert_eq!(parse_header(bytes_of(&h)).map(|_| ()), Err(KernelError::InvalidElf));

        let mut h = valid_header();
        h.elf_type = 3; // shared object
        assert_eq!(parse_header(bytes_of(&h)).map(|_| ()), Err(KernelError::InvalidElf));

        assert_eq!(
            parse_header(&[0u8; 16]).map(|_| ()),
            Err(KernelError::InvalidElf),
            "truncated header must fail"
        );
    }

    #[test]
    fn collects_only_pt_load_segments() {
        let mk = |p_type: u32, vaddr: u64| Elf64ProgramHeader {
            p_type,
            p_flags: 0,
            p_offset: 0x1000,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: 0x800,
            p_memsz: 0x1000,
            p_align: 0x1000,
        };
        let table = [mk(PT_LOAD, 0x40_0000), mk(4, 0), mk(PT_LOAD, 0x60_0000)];
        let mut raw = alloc::vec::Vec::new();
        for phdr in &table {
            raw.extend_from_slice(bytes_of(phdr));
        }

        let loads = load_segments(&raw, 56, 3).expect("table parses");
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].p_vaddr, 0x40_0000);
        assert_eq!(loads[1].p_vaddr, 0x60_0000);
    }

    #[test]
    fn rejects_filesz_beyond_memsz() {
        let phdr = Elf64ProgramHeader {
            p_type: PT_LOAD,
            p_flags: 0,
            p_offset: 0,
            p_vaddr: 0x40_0000,
            p_paddr: 0,
            p_filesz: 0x2000,
            p_memsz: 0x1000,
            p_align: 0x1000,
        };
        assert_eq!(
            load_segments(bytes_of(&phdr), 56, 1).map(|_| ()),
            Err(KernelError::InvalidElf)
        );
    }
}
