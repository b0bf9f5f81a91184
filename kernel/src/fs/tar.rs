//! USTAR initrd ingest
//!
//! Parses the initrd as a USTAR tar archive and populates the boot RAMFS.
//! Only regular-file entries (typeflag '0') are ingested, plus symlink
//! entries (typeflag '2') recorded as symlink nodes; missing intermediate
//! directories are created on the way. The archive ends at the first block
//! without the USTAR magic. File payloads are not copied: the created nodes
//! point straight into the archive.

use super::ramfs::Ramfs;
use crate::error::{KernelError, KernelResult};
use crate::fs::FileSystem;

/// TAR block size; headers and payload regions are multiples of this.
const BLOCK_SIZE: usize = 512;

/// Header field offsets and sizes (ustar format).
mod field {
    /// File name (100 bytes, null-terminated ASCII).
    pub const NAME_OFF: usize = 0;
    pub const NAME_LEN: usize = 100;

    /// File size in octal ASCII (12 bytes).
    pub const SIZE_OFF: usize = 124;
    pub const SIZE_LEN: usize = 12;

    /// Type flag (1 byte): '0' = regular file, '2' = symlink.
    pub const TYPE_OFF: usize = 156;

    /// Link target for symlinks (100 bytes, null-terminated ASCII).
    pub const LINK_OFF: usize = 157;
    pub const LINK_LEN: usize = 100;

    /// Magic field ("ustar" for POSIX TAR).
    pub const MAGIC_OFF: usize = 257;
    pub const MAGIC_LEN: usize = 5;
}

/// Null-terminated ASCII string out of a fixed-size field.
fn parse_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Octal ASCII number out of a fixed-size field.
fn parse_octal(buf: &[u8]) -> usize {
    let s = parse_str(buf).trim();
    if s.is_empty() {
        return 0;
    }
    usize::from_str_radix(s, 8).unwrap_or(0)
}

/// Populate `fs` from the archive bytes. Returns the number of nodes
/// created. A regular-file entry whose path ends in '/' is malformed and
/// is rejected with `InvalidArgument` rather than ingested.
pub fn ingest(fs: &Ramfs, archive: &'static [u8]) -> KernelResult<usize> {
    let mut offset = 0;
    let mut count = 0;

    while offset + BLOCK_SIZE <= archive.len() {
        let header = &archive[offset..offset + BLOCK_SIZE];

        // First block without the magic terminates the archive.
        let magic = &header[field::MAGIC_OFF..field::MAGIC_OFF + field::MAGIC_LEN];
        if magic != b"ustar" {
            break;
        }

        let name = parse_str(&header[field::NAME_OFF..field::NAME_OFF + field::NAME_LEN]);
        let size = parse_octal(&header[field::SIZE_OFF..field::SIZE_OFF + field::SIZE_LEN]);
        let typeflag = header[field::TYPE_OFF];

        let payload_start = offset + BLOCK_SIZE;
        let payload_blocks = size.div_ceil(BLOCK_SIZE);
        offset = payload_start + payload_blocks * BLOCK_SIZE;

        match typeflag {
            b'0' => {
                if name.ends_with('/') {
                    log::warn!("tar: regular file entry {:?} ends in '/'", name);
                    return Err(KernelError::InvalidArgument);
                }
                if payload_start + size > archive.len() {
                    return Err(KernelError::OutOfRange);
                }
                let data = &archive[payload_start..payload_start + size];
                let path = normalise(name);
                fs.mkfile(&path, data)?;
                count += 1;
            }
            b'2' => {
                let target =
                    parse_str(&header[field::LINK_OFF..field::LINK_OFF + field::LINK_LEN]);
                let path = normalise(name);
                let target = normalise(target);
                fs.mklink(&path, &target)?;
                count += 1;
            }
            _ => {}
        }
    }

    Ok(count)
}

/// Tar member names may lack the leading '/'.
fn normalise(name: &str) -> alloc::string::String {
    let mut path = alloc::string::String::new();
    if !name.starts_with('/') {
        path.push('/');
    }
    path.push_str(name);
    path
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::fs::FileSystem;

    /// Build one ustar member (header + padded payload).
    fn member(name: &str, typeflag: u8, link: &str, payload: &[u8]) -> Vec<u8> {
        let mut header = [0u8; BLOCK_SIZE];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let size = alloc::format!("{:011o}\0", payload.len());
        header[field::SIZE_OFF..field::SIZE_OFF + 12].copy_from_slice(size.as_bytes());
        header[field::TYPE_OFF] = typeflag;
        header[field::LINK_OFF..field::LINK_OFF + link.len()].copy_from_slice(link.as_bytes());
        header[field::MAGIC_OFF..field::MAGIC_OFF + 5].copy_from_slice(b"ustar");

        let mut out = Vec::from(header);
        out.extend_from_slice(payload);
        let pad = payload.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - payload.len();
        out.extend(core::iter::repeat(0u8).take(pad));
        out
    }

    fn leak(archive: Vec<u8>) -> &'static [u8] {
        alloc::boxed::Box::leak(archive.into_boxed_slice())
    }

    #[test]
    fn round_trips_every_regular_file() {
        let mut archive = Vec::new();
        archive.extend(member("init", b'0', "", &[0xAB; 64]));
        archive.extend(member("usr/share/motd", b'0', "", b"welcome"));
        archive.extend([0u8; 2 * BLOCK_SIZE]);

        let fs = Ramfs::new();
        let count = ingest(&fs, leak(archive)).expect("well-formed archive");
        assert_eq!(count, 2);

        let init = fs.find_node("/init").expect("lookup /init");
        assert_eq!(init.size(), 64);
        let mut buf = [0u8; 64];
        init.read_at(0, &mut buf).expect("full read");
        assert_eq!(buf, [0xAB; 64]);

        let motd = fs.find_node("/usr/share/motd").expect("nested file");
        let mut text = [0u8; 7];
        motd.read_at(0, &mut text).expect("read");
        assert_eq!(&text, b"welcome");
    }

    #[test]
    fn stops_at_first_non_ustar_block() {
        let mut archive = Vec::new();
        archive.extend(member("kept", b'0', "", b"x"));
        archive.extend([0u8; BLOCK_SIZE]); // zero block: no magic
        archive.extend(member("dropped", b'0', "", b"y"));

        let fs = Ramfs::new();
        let count = ingest(&fs, leak(archive)).expect("ingest");
        assert_eq!(count, 1);
        assert!(fs.find_node("/kept").is_ok());
        assert!(fs.find_node("/dropped").is_err());
    }

    #[test]
    fn slash_terminated_file_entry_is_invalid() {
        let _guard = crate::lock_global_state_for_test();
        let archive = member("bad/", b'0', "", b"z");
        let fs = Ramfs::new();
        assert_eq!(
            ingest(&fs, leak(archive)).map(|_| ()),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn symlink_entries_become_link_nodes() {
        let mut archive = Vec::new();
        archive.extend(member("bin/sh", b'0', "", b"#!"));
        archive.extend(member("sh", b'2', "bin/sh", &[]));

        let fs = Ramfs::new();
        assert_eq!(ingest(&fs, leak(archive)).expect("ingest"), 2);
        let via_link = fs.find_node("/sh").expect("resolves through the link");
        assert_eq!(via_link.size(), 2);
    }

    #[test]
    fn directory_entries_are_skipped_but_payload_files_land() {
        let mut archive = Vec::new();
        archive.extend(member("opt/", b'5', "", &[]));
        archive.extend(member("opt/tool", b'0', "", b"t"));

        let fs = Ramfs::new();
        assert_eq!(ingest(&fs, leak(archive)).expect("ingest"), 1);
        assert!(fs.find_node("/opt/tool").is_ok());
    }
}
