//! Filesystem core: the entry tree, path resolution, and the registry.
//!
//! An [`Entry`] is a ref-counted node of a mounted filesystem, file or
//! directory. Children hold strong references to their parents (never the
//! reverse), so the tree is strictly downward-recomputed and upward-owned
//! and no cycles form.

pub mod fat;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::buffer::TransactionalBuffer;
use crate::error::{SysError, SysResult};

pub type EntryRef = Arc<dyn Entry>;

/// Second-resolution timestamps; absent fields are unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTimestamps {
    pub created: Option<u64>,
    pub modified: Option<u64>,
    pub accessed: Option<u64>,
}

/// A node in a mounted filesystem.
///
/// Operations a concrete entry does not support return `NotSupported`;
/// the directory group applies to directories, the byte-content group to
/// files.
pub trait Entry: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    fn is_directory(&self) -> bool;

    fn size(&self) -> usize;

    fn timestamps(&self) -> EntryTimestamps;

    fn set_timestamps(&self, timestamps: EntryTimestamps);

    /// Parent entry; `None` at a filesystem root.
    fn parent(&self) -> Option<EntryRef>;

    /// Write back pending metadata (size, timestamps, start cluster).
    fn flush(&self) -> SysResult<()>;

    // The directory group takes `Arc<Self>` so produced children can hold
    // a strong reference to their parent.

    fn lookup(self: Arc<Self>, name: &str) -> SysResult<EntryRef> {
        let _ = name;
        Err(SysError::NotSupported)
    }

    fn all_children(self: Arc<Self>) -> SysResult<Vec<EntryRef>> {
        Err(SysError::NotSupported)
    }

    fn add_child(self: Arc<Self>, name: &str, is_directory: bool) -> SysResult<EntryRef> {
        let _ = (name, is_directory);
        Err(SysError::NotSupported)
    }

    fn remove_child(&self, name: &str) -> SysResult<()> {
        let _ = name;
        Err(SysError::NotSupported)
    }

    fn read_bytes(
        &self,
        buffer: &mut dyn TransactionalBuffer,
        offset: usize,
        length: usize,
    ) -> SysResult<usize> {
        let _ = (buffer, offset, length);
        Err(SysError::NotSupported)
    }

    fn write_bytes(
        &self,
        buffer: &dyn TransactionalBuffer,
        offset: usize,
        length: usize,
    ) -> SysResult<usize> {
        let _ = (buffer, offset, length);
        Err(SysError::NotSupported)
    }

    fn resize(&self, new_size: usize) -> SysResult<usize> {
        let _ = new_size;
        Err(SysError::NotSupported)
    }
}

/// Stable hash of an entry's path from its filesystem root.
pub fn entry_hash(entry: &dyn Entry) -> u64 {
    fn name_hash(name: &str) -> u64 {
        // FNV-1a.
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in name.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x1000_0000_01b3);
        }
        hash
    }
    let mut hash = name_hash(&entry.name());
    if let Some(parent) = entry.parent() {
        let parent_hash = entry_hash(&*parent);
        hash ^= parent_hash
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(hash << 6)
            .wrapping_add(hash >> 2);
    }
    hash
}

/// A mounted filesystem.
pub trait Filesystem: Send + Sync {
    fn get_root(&self) -> EntryRef;
}

/// Resolve `path` starting from `start` (absolute paths restart from the
/// filesystem root above `start`).
///
/// `.` components are skipped; `..` follows the parent pointer, saturating
/// at the root. When `out_parent` is supplied it receives the parent of
/// the final component, even when that final component does not exist
/// (so callers can create it).
pub fn full_path_lookup(
    start: EntryRef,
    path: &str,
    mut out_parent: Option<&mut Option<EntryRef>>,
) -> SysResult<EntryRef> {
    let mut current = if path.starts_with('/') {
        let mut root = start;
        while let Some(parent) = root.parent() {
            root = parent;
        }
        root
    } else {
        start
    };

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    for (index, component) in components.iter().enumerate() {
        let is_last = index + 1 == components.len();
        if *component == ".." {
            if let Some(parent) = current.parent() {
                current = parent;
            }
            continue;
        }
        if !current.is_directory() {
            return Err(SysError::NotADirectory);
        }
        if is_last {
            if let Some(slot) = out_parent.as_deref_mut() {
                *slot = Some(current.clone());
            }
        }
        current = current.clone().lookup(component)?;
    }
    Ok(current)
}

/// Registry of mounted filesystems; the first registration becomes the
/// root.
pub struct FilesystemRegistry {
    filesystems: Vec<(String, Arc<dyn Filesystem>)>,
}

static FS_REGISTRY: Mutex<FilesystemRegistry> = Mutex::new(FilesystemRegistry {
    filesystems: Vec::new(),
});

impl FilesystemRegistry {
    pub fn root(&self) -> Option<Arc<dyn Filesystem>> {
        self.filesystems.first().map(|(_, fs)| fs.clone())
    }
}

pub fn register_filesystem(name: String, filesystem: Arc<dyn Filesystem>) {
    log::info!("fs: registered filesystem '{}'", name);
    FS_REGISTRY.lock().filesystems.push((name, filesystem));
}

/// Root directory of the root filesystem.
pub fn root_directory() -> SysResult<EntryRef> {
    FS_REGISTRY
        .lock()
        .root()
        .map(|fs| fs.get_root())
        .ok_or(SysError::NoSuchDevice)
}

/// Attempt to mount a root filesystem from the accessible (partition)
/// block devices.
///
/// Returns `NoSuchDevice` when no device is ready and `InvalidArgument`
/// when devices exist but none holds a recognisable volume; the boot
/// driver retries around this.
pub fn try_mount_root() -> SysResult<()> {
    if FS_REGISTRY.lock().root().is_some() {
        return Ok(());
    }
    let devices = crate::blockdev::with_registry(|registry| registry.accessible_devices());
    if devices.is_empty() {
        return Err(SysError::NoSuchDevice);
    }
    let mut last_error = SysError::InvalidArgument;
    for (name, device) in devices {
        match fat::FatFilesystem::try_create_from(device) {
            Ok(filesystem) => {
                log::info!("fs: mounted root from {}", name);
                register_filesystem(name, filesystem);
                return Ok(());
            }
            Err(error) => {
                log::debug!("fs: {} not mountable: {}", name, error);
                last_error = error;
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
pub(crate) mod testfs {
    //! Tiny in-memory tree for path-resolution tests.

    use super::*;

    pub struct TestDir {
        pub name: String,
        pub parent: Mutex<Option<EntryRef>>,
        pub children: Mutex<Vec<EntryRef>>,
    }

    impl fmt::Debug for TestDir {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TestDir").field("name", &self.name).finish()
        }
    }

    impl TestDir {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: String::from(name),
                parent: Mutex::new(None),
                children: Mutex::new(Vec::new()),
            })
        }

        pub fn attach(parent: &Arc<TestDir>, child: Arc<TestDir>) -> Arc<TestDir> {
            *child.parent.lock() = Some(parent.clone() as EntryRef);
            parent.children.lock().push(child.clone() as EntryRef);
            child
        }
    }

    impl Entry for TestDir {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn is_directory(&self) -> bool {
            true
        }

        fn size(&self) -> usize {
            0
        }

        fn timestamps(&self) -> EntryTimestamps {
            EntryTimestamps::default()
        }

        fn set_timestamps(&self, _timestamps: EntryTimestamps) {}

        fn parent(&self) -> Option<EntryRef> {
            self.parent.lock().clone()
        }

        fn flush(&self) -> SysResult<()> {
            Ok(())
        }

        fn lookup(self: Arc<Self>, name: &str) -> SysResult<EntryRef> {
            self.children
                .lock()
                .iter()
                .find(|c| c.name() == name)
                .cloned()
                .ok_or(SysError::NoEntry)
        }

        fn all_children(self: Arc<Self>) -> SysResult<Vec<EntryRef>> {
            Ok(self.children.lock().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testfs::TestDir;
    use super::*;

    fn fixture() -> (EntryRef, EntryRef) {
        // /usr/bin, /etc
        let root = TestDir::new("");
        let usr = TestDir::attach(&root, TestDir::new("usr"));
        let bin = TestDir::attach(&usr, TestDir::new("bin"));
        TestDir::attach(&root, TestDir::new("etc"));
        (root as EntryRef, bin as EntryRef)
    }

    #[test]
    fn absolute_and_relative_lookup() {
        let (root, bin) = fixture();
        let found = full_path_lookup(root.clone(), "/usr/bin", None).unwrap();
        assert_eq!(found.name(), "bin");

        // Relative from /usr/bin.
        let etc = full_path_lookup(bin.clone(), "../../etc", None).unwrap();
        assert_eq!(etc.name(), "etc");

        // `.` components are skipped; absolute restart works from
        // anywhere in the tree.
        let usr = full_path_lookup(bin, "/./usr/.", None).unwrap();
        assert_eq!(usr.name(), "usr");
    }

    #[test]
    fn dotdot_saturates_at_root() {
        let (root, _) = fixture();
        let still_root = full_path_lookup(root.clone(), "../../..", None).unwrap();
        assert_eq!(still_root.name(), "");
        assert!(still_root.parent().is_none());
    }

    #[test]
    fn missing_component_reports_parent() {
        let (root, _) = fixture();
        let mut parent = None;
        let result = full_path_lookup(root, "/usr/newfile", Some(&mut parent));
        assert_eq!(result.unwrap_err(), SysError::NoEntry);
        assert_eq!(parent.unwrap().name(), "usr");
    }

    #[test]
    fn hash_depends_on_path_and_is_stable() {
        let (root, bin) = fixture();
        let etc = full_path_lookup(root.clone(), "/etc", None).unwrap();
        let first = entry_hash(&*bin);
        assert_eq!(first, entry_hash(&*bin));
        assert_ne!(first, entry_hash(&*etc));
        assert_ne!(first, entry_hash(&*root));
    }
}
