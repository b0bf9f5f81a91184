//! RAM filesystem
//!
//! A tree of nodes living entirely on the kernel heap. File nodes do not
//! copy their payload: `data` points into the still-mapped initrd image.

use alloc::{
    collections::BTreeMap,
    string::String,
    sync::Arc,
};

use spin::Mutex;

use super::{FileKind, FileSystem, VfsNode};
use crate::error::{KernelError, KernelResult};

/// One node of the tree. The root carries the empty name.
pub struct RamfsNode {
    kind: FileKind,
    /// File payload; aims into the initrd, never copied.
    data: Option<&'static [u8]>,
    /// Symlink target path, for [`FileKind::Symlink`] nodes.
    link_target: Option<String>,
    children: Mutex<BTreeMap<String, Arc<RamfsNode>>>,
}

impl RamfsNode {
    fn new_dir() -> Self {
        Self {
            kind: FileKind::Dir,
            data: None,
            link_target: None,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    fn new_file(data: &'static [u8]) -> Self {
        Self {
            kind: FileKind::File,
            data: Some(data),
            link_target: None,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    fn new_symlink(target: String) -> Self {
        Self {
            kind: FileKind::Symlink,
            data: None,
            link_target: Some(target),
            children: Mutex::new(BTreeMap::new()),
        }
    }
}

impl VfsNode for RamfsNode {
    fn kind(&self) -> FileKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.data.map(|d| d.len() as u64).unwrap_or(0)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> KernelResult<()> {
        let data = self.data.ok_or(KernelError::Unsupported)?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(KernelError::OutOfRange)?;
        if end > data.len() as u64 {
            return Err(KernelError::OutOfRange);
        }
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn readdir(&self) -> KernelResult<alloc::vec::Vec<super::DirEntry>> {
        if self.kind != FileKind::Dir {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self
            .children
            .lock()
            .iter()
            .map(|(name, child)| super::DirEntry {
                name: name.clone(),
                kind: child.kind,
            })
            .collect())
    }
}

/// The driver: a tree rooted at the empty path.
pub struct Ramfs {
    root: Arc<RamfsNode>,
}

impl Ramfs {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamfsNode::new_dir()),
        }
    }

    /// Walk to the directory node for `path`, optionally creating missing
    /// components.
    fn walk_dirs(&self, path: &str, create: bool) -> KernelResult<Arc<RamfsNode>> {
        let mut cur = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let next = {
                let mut children = cur.children.lock();
                match children.get(part) {
                    Some(child) => child.clone(),
                    None if create => {
                        let dir = Arc::new(RamfsNode::new_dir());
                        children.insert(String::from(part), dir.clone());
                        dir
                    }
                    None => return Err(KernelError::NotFound),
                }
            };
            if next.kind != FileKind::Dir {
                return Err(KernelError::InvalidArgument);
            }
            cur = next;
        }
        Ok(cur)
    }

    fn split_parent(path: &str) -> KernelResult<(&str, &str)> {
        let trimmed = path.trim_end_matches('/');
        let name_start = trimmed.rfind('/').map(|p| p + 1).unwrap_or(0);
        let name = &trimmed[name_start..];
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        Ok((&trimmed[..name_start], name))
    }

    fn insert(&self, path: &str, node: RamfsNode) -> KernelResult<()> {
        let (dir_path, name) = Self::split_parent(path)?;
        let parent = self.walk_dirs(dir_path, true)?;
        let mut children = parent.children.lock();
        if children.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        children.insert(String::from(name), Arc::new(node));
        Ok(())
    }

    /// Record a symlink node pointing at `target`.
    pub fn mklink(&self, path: &str, target: &str) -> KernelResult<()> {
        self.insert(path, RamfsNode::new_symlink(String::from(target)))
    }
}

impl Default for Ramfs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for Ramfs {
    fn find_node(&self, path: &str) -> KernelResult<Arc<dyn VfsNode>> {
        if path.split('/').all(|p| p.is_empty()) {
            return Ok(self.root.clone());
        }
        let (dir_path, name) = Self::split_parent(path)?;
        let parent = self.walk_dirs(dir_path, false)?;
        let node = {
            let children = parent.children.lock();
            children.get(name).cloned().ok_or(KernelError::NotFound)?
        };
        // Symlinks resolve one level, relative to the same tree.
        if node.kind == FileKind::Symlink {
            let target = node
                .link_target
                .clone()
                .ok_or(KernelError::InvalidArgument)?;
            return self.find_node(&target);
        }
        Ok(node)
    }

    fn mkdir(&self, path: &str) -> KernelResult<()> {
        self.walk_dirs(path, true).map(|_| ())
    }

    fn mkfile(&self, path: &str, data: &'static [u8]) -> KernelResult<()> {
        self.insert(path, RamfsNode::new_file(data))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn deep_paths_create_intermediates_once() {
        let fs = Ramfs::new();
        fs.mkfile("/usr/bin/init", b"payload").expect("mkfile");
        fs.mkfile("/usr/bin/sh", b"shell").expect("sibling in same dir");

        let node = fs.find_node("/usr/bin/init").expect("lookup");
        assert_eq!(node.kind(), FileKind::File);
        assert_eq!(node.size(), 7);
    }

    #[test]
    fn lookup_misses_report_not_found() {
        let fs = Ramfs::new();
        fs.mkdir("/etc").expect("mkdir");
        assert!(matches!(
            fs.find_node("/etc/passwd").map(|_| ()),
            Err(KernelError::NotFound)
        ));
        assert!(matches!(
            fs.find_node("/no/such/dir").map(|_| ()),
            Err(KernelError::NotFound)
        ));
    }

    #[test]
    fn duplicate_file_is_rejected() {
        let fs = Ramfs::new();
        fs.mkfile("/a", b"1").expect("first");
        assert_eq!(fs.mkfile("/a", b"2"), Err(KernelError::AlreadyExists));
    }

    #[test]
    fn symlink_resolves_one_level() {
        let fs = Ramfs::new();
        fs.mkfile("/target", b"xyz").expect("mkfile");
        fs.mklink("/alias", "/target").expect("mklink");

        let node = fs.find_node("/alias").expect("resolves through the link");
        assert_eq!(node.kind(), FileKind::File);
        assert_eq!(node.size(), 3);
    }

    #[test]
    fn readdir_lists_children_of_directories_only() {
        let fs = Ramfs::new();
        fs.mkfile("/etc/hosts", b"::1").expect("mkfile");
        fs.mkdir("/etc/conf.d").expect("mkdir");

        let etc = fs.find_node("/etc").expect("lookup");
        let mut entries = etc.readdir().expect("listing a directory");
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "conf.d");
        assert_eq!(entries[0].kind, FileKind::Dir);
        assert_eq!(entries[1].name, "hosts");
        assert_eq!(entries[1].kind, FileKind::File);

        let file = fs.find_node("/etc/hosts").expect("lookup");
        assert!(file.readdir().is_err(), "files do not list");
    }

    #[test]
    fn read_at_checks_bounds() {
        let fs = Ramfs::new();
        fs.mkfile("/f", b"0123456789").expect("mkfile");
        let node = fs.find_node("/f").expect("lookup");

        let mut buf = [0u8; 4];
        node.read_at(6, &mut buf).expect("tail read");
        assert_eq!(&buf, b"6789");
        assert_eq!(
            node.read_at(7, &mut buf),
            Err(KernelError::OutOfRange),
            "read crossing the end must fail"
        );
    }
}
