//! Virtual filesystem
//!
//! A mount table maps path prefixes to filesystem drivers; the longest
//! matching prefix wins and the driver sees only the remaining suffix.
//! Drivers are polymorphic over a small capability set (find, read, mkdir,
//! mkfile), and the boot RAMFS is populated from the initrd tar archive.

pub mod ramfs;
pub mod tar;

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Node kinds a driver can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// A resolved node, held open by a [`FileHandle`].
pub trait VfsNode: Send + Sync {
    fn kind(&self) -> FileKind;
    /// Payload length in bytes (0 for directories).
    fn size(&self) -> u64;
    /// Copy `buf.len()` bytes starting at `offset` into `buf`. Fails
    /// `OutOfRange` when the request would read past the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> KernelResult<()>;
    /// List a directory's children.
    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        Err(KernelError::Unsupported)
    }
}

/// Filesystem driver capability set.
pub trait FileSystem: Send + Sync {
    /// Resolve `path` (relative to the mount, '/'-separated) to a node.
    fn find_node(&self, path: &str) -> KernelResult<Arc<dyn VfsNode>>;
    /// Create a directory at `path`, succeeding if it already exists.
    fn mkdir(&self, path: &str) -> KernelResult<()>;
    /// Create a file at `path` backed by `data`.
    fn mkfile(&self, path: &str, data: &'static [u8]) -> KernelResult<()>;
}

/// An open file: node plus cursor.
pub struct FileHandle {
    node: Arc<dyn VfsNode>,
    cursor: u64,
    size: u64,
}

impl FileHandle {
    fn open(node: Arc<dyn VfsNode>) -> Self {
        let size = node.size();
        Self {
            node,
            cursor: 0,
            size,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.node.kind()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Absolute-position the cursor. Fails `OutOfRange` past the end.
    pub fn seek(&mut self, offset: u64) -> KernelResult<()> {
        if offset > self.size {
            return Err(KernelError::OutOfRange);
        }
        self.cursor = offset;
        Ok(())
    }

    /// Read at the cursor and advance it.
    pub fn read(&mut self, buf: &mut [u8]) -> KernelResult<()> {
        self.node.read_at(self.cursor, buf)?;
        self.cursor += buf.len() as u64;
        Ok(())
    }
}

struct Mount {
    prefix: String,
    fs: Arc<dyn FileSystem>,
}

static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// Register a driver at `prefix`. Fails `AlreadyExists` for a duplicate
/// prefix.
pub fn mount(prefix: &str, fs: Arc<dyn FileSystem>) -> KernelResult<()> {
    let mut mounts = MOUNTS.lock();
    if mounts.iter().any(|m| m.prefix == prefix) {
        return Err(KernelError::AlreadyExists);
    }
    mounts.push(Mount {
        prefix: String::from(prefix),
        fs,
    });
    Ok(())
}

/// The driver whose prefix shares the longest leading run with `path`,
/// together with the un-matched suffix.
fn mount_for(path: &str) -> KernelResult<(Arc<dyn FileSystem>, String)> {
    let mounts = MOUNTS.lock();
    let best = mounts
        .iter()
        .filter(|m| path.starts_with(m.prefix.as_str()))
        .max_by_key(|m| m.prefix.len())
        .ok_or(KernelError::NotFound)?;
    Ok((
        best.fs.clone(),
        String::from(&path[best.prefix.len()..]),
    ))
}

/// Resolve `path` through the mount table and open it.
pub fn find_node(path: &str) -> KernelResult<FileHandle> {
    let (fs, suffix) = mount_for(path)?;
    Ok(FileHandle::open(fs.find_node(&suffix)?))
}

/// Mount the boot RAMFS and ingest the initrd archive into it.
pub fn init() {
    let ramfs = Arc::new(ramfs::Ramfs::new());
    if let Some(initrd) = crate::bootinfo::get().initrd {
        match tar::ingest(ramfs.as_ref(), initrd) {
            Ok(count) => println!("[FS] initrd ingested, {} entries", count),
            Err(e) => println!("[FS] initrd ingest failed: {}", e),
        }
    } else {
        println!("[FS] no initrd present");
    }
    mount("", ramfs).expect("root mount cannot already exist");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fresh_mounts() {
        MOUNTS.lock().clear();
    }

    #[test]
    fn longest_prefix_wins() {
        let _guard = crate::lock_global_state_for_test();
        fresh_mounts();
        let root = Arc::new(ramfs::Ramfs::new());
        let nested = Arc::new(ramfs::Ramfs::new());
        nested.mkfile("/data", b"nested").expect("mkfile");
        root.mkfile("/dev/data", b"root").expect("mkfile");

        mount("", root).expect("root mount");
        mount("/dev", nested).expect("nested mount");

        let mut handle = find_node("/dev/data").expect("resolves via /dev mount");
        assert_eq!(handle.size(), 6);
        let mut buf = [0u8; 6];
        handle.read(&mut buf).expect("read");
        assert_eq!(&buf, b"nested");
    }

    #[test]
    fn duplicate_mount_prefix_is_rejected() {
        let _guard = crate::lock_global_state_for_test();
        fresh_mounts();
        mount("/a", Arc::new(ramfs::Ramfs::new())).expect("first mount");
        assert_eq!(
            mount("/a", Arc::new(ramfs::Ramfs::new())),
            Err(KernelError::AlreadyExists)
        );
    }

    #[test]
    fn cursor_advances_and_bounds() {
        let _guard = crate::lock_global_state_for_test();
        fresh_mounts();
        let root = Arc::new(ramfs::Ramfs::new());
        root.mkfile("/f", b"abcdef").expect("mkfile");
        mount("", root).expect("mount");

        let mut h = find_node("/f").expect("open");
        assert_eq!(h.cursor(), 0);
        let mut buf = [0u8; 4];
        h.read(&mut buf).expect("first read");
        assert_eq!(&buf, b"abcd");
        assert_eq!(h.cursor(), 4);

        let mut rest = [0u8; 4];
        assert_eq!(
            h.read(&mut rest),
            Err(KernelError::OutOfRange),
            "reading past the end must fail"
        );
        assert_eq!(h.cursor(), 4, "failed read leaves the cursor alone");
    }
}
