use fuser::FileType;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of a single filesystem operation. Errors carry the raw OS errno;
/// the kernel bridge negates them when replying.
pub type OpResult<T> = std::result::Result<T, i32>;

/// One memoizable directory entry: the underlying inode number, the entry
/// type as reported by the directory itself, and the name.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: OsString,
}

/// Resolve a kernel-relative path (rooted at `/`) under a configured root.
pub(crate) fn resolve_under(root: &Path, rel: &Path) -> PathBuf {
    let stripped = rel.strip_prefix("/").unwrap_or(rel);
    root.join(stripped)
}

/// Registry of open file handles, shared by both views. Handles are
/// position-independent (all reads and writes go through `pread`/`pwrite`),
/// so concurrent I/O on one handle needs no lock of its own.
pub(crate) struct HandleTable {
    next_fh: Mutex<u64>,
    handles: RwLock<HashMap<u64, Arc<File>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_fh: Mutex::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: File) -> u64 {
        let fh = {
            let mut next = self.next_fh.lock();
            let fh = *next;
            // wrapping_add for overflow tolerance; handles are ephemeral and
            // recycled when files are closed
            *next = next.wrapping_add(1);
            fh
        };
        self.handles.write().insert(fh, Arc::new(file));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.handles.read().get(&fh).map(Arc::clone)
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<File>> {
        self.handles.write().remove(&fh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_under_strips_leading_slash() {
        let root = Path::new("/data/backing");
        assert_eq!(
            resolve_under(root, Path::new("/a/b.txt")),
            PathBuf::from("/data/backing/a/b.txt")
        );
        assert_eq!(
            resolve_under(root, Path::new("/")),
            PathBuf::from("/data/backing")
        );
    }

    #[test]
    fn test_handle_table_insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"x").unwrap();

        let table = HandleTable::new();
        let fh = table.insert(File::open(&path).unwrap());
        assert!(table.get(fh).is_some());

        assert!(table.remove(fh).is_some());
        assert!(table.get(fh).is_none());
        assert!(table.remove(fh).is_none());
    }

    #[test]
    fn test_handle_table_allocates_distinct_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        File::create(&path).unwrap();

        let table = HandleTable::new();
        let a = table.insert(File::open(&path).unwrap());
        let b = table.insert(File::open(&path).unwrap());
        assert_ne!(a, b);
    }
}
