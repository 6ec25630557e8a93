use fuser::FUSE_ROOT_ID;
use fxhash::hash64;
use lru::LruCache;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const DEFAULT_INODE_CACHE_CAPACITY: usize = 10000;

/// One kernel-visible inode: its number, its parent, its name there, and the
/// relative path the core operates on.
#[derive(Debug, Clone)]
pub(crate) struct InodeEntry {
    pub ino: u64,
    pub parent: u64,
    pub name: OsString,
    pub path: PathBuf,
}

/// Maps kernel inode numbers to relative paths for the bridge.
///
/// Entries are kept in an LRU so the table cannot grow without bound; an
/// evicted entry is simply re-created on the next lookup, which the kernel
/// always performs because entry and attribute timeouts are zero.
#[derive(Debug)]
pub(crate) struct InodeTable {
    inodes: LruCache<u64, InodeEntry>,
    children: HashMap<u64, HashMap<u64, u64>>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            inodes: LruCache::new(NonZeroUsize::new(DEFAULT_INODE_CACHE_CAPACITY).unwrap()),
            children: HashMap::new(),
            // Inode 1 is reserved for the root directory
            next_ino: 2,
        };
        table.inodes.put(
            FUSE_ROOT_ID,
            InodeEntry {
                ino: FUSE_ROOT_ID,
                parent: FUSE_ROOT_ID,
                name: OsString::new(),
                path: PathBuf::from("/"),
            },
        );
        table
    }

    pub fn alloc(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino = self.next_ino.wrapping_add(1);
        ino
    }

    pub fn insert(&mut self, entry: InodeEntry) {
        if entry.ino != FUSE_ROOT_ID {
            let name_hash = hash64(entry.name.as_bytes());
            self.children
                .entry(entry.parent)
                .or_default()
                .insert(name_hash, entry.ino);
        }
        self.inodes.put(entry.ino, entry);
    }

    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.peek(&ino).map(|entry| entry.path.clone())
    }

    pub fn parent_of(&self, ino: u64) -> Option<u64> {
        self.inodes.peek(&ino).map(|entry| entry.parent)
    }

    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        let name_hash = hash64(name.as_bytes());
        self.children
            .get(&parent)
            .and_then(|map| map.get(&name_hash).copied())
            .filter(|ino| self.inodes.contains(ino))
    }

    pub fn remove_child(&mut self, parent: u64, name: &OsStr) {
        let name_hash = hash64(name.as_bytes());
        if let Some(map) = self.children.get_mut(&parent) {
            map.remove(&name_hash);
        }
    }

    /// Register a child under a (possibly new) parent after a rename and
    /// repoint the inode's path.
    pub fn rename(
        &mut self,
        ino: u64,
        old_parent: u64,
        old_name: &OsStr,
        new_parent: u64,
        new_name: OsString,
        new_path: PathBuf,
    ) {
        self.remove_child(old_parent, old_name);
        let name_hash = hash64(new_name.as_bytes());
        self.children
            .entry(new_parent)
            .or_default()
            .insert(name_hash, ino);
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.parent = new_parent;
            entry.name = new_name;
            entry.path = new_path;
        }
    }

    /// Find the existing inode for a child or allocate and register one.
    pub fn child_ino(&mut self, parent: u64, name: &OsStr, path: &Path) -> u64 {
        if let Some(ino) = self.lookup_child(parent, name) {
            return ino;
        }
        let ino = self.alloc();
        self.insert(InodeEntry {
            ino,
            parent,
            name: name.to_os_string(),
            path: path.to_path_buf(),
        });
        ino
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }
}
