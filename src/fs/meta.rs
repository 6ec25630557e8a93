use nix::sys::stat::{lstat, FileStat};
use nix::unistd::{access, AccessFlags};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::DirEntryExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fs::convert::{errno_of, filetype_of};
use crate::fs::types::{resolve_under, DirEntry, OpResult};

/// Memoized results for one relative path. Each field is filled at most
/// once and never mutated afterwards; an errno is remembered exactly like a
/// success. Access results are keyed per mask, with no bitmask subsumption.
#[derive(Default)]
struct Entry {
    stat: Option<OpResult<FileStat>>,
    link: Option<OpResult<Vec<u8>>>,
    access: HashMap<i32, OpResult<()>>,
    listing: Option<OpResult<Vec<DirEntry>>>,
}

/// Per-path memoization of metadata syscalls against the backing tree.
///
/// The map lock covers only entry creation and lookup; the memoizing syscall
/// itself runs under the per-entry lock, so distinct paths proceed in
/// parallel. Entries live for the lifetime of the process.
pub(crate) struct MetadataCache {
    backing: PathBuf,
    entries: Mutex<HashMap<PathBuf, Arc<Mutex<Entry>>>>,
}

impl MetadataCache {
    pub fn new(backing: PathBuf) -> Self {
        MetadataCache {
            backing,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, path: &Path) -> Arc<Mutex<Entry>> {
        let mut map = self.entries.lock();
        match map.get(path) {
            Some(entry) => Arc::clone(entry),
            None => {
                tracing::debug!("MISS: {}", path.display());
                let entry = Arc::new(Mutex::new(Entry::default()));
                map.insert(path.to_path_buf(), Arc::clone(&entry));
                entry
            }
        }
    }

    pub fn getattr(&self, path: &Path) -> OpResult<FileStat> {
        let full = resolve_under(&self.backing, path);
        let entry = self.entry(path);
        let mut entry = entry.lock();

        *entry
            .stat
            .get_or_insert_with(|| lstat(&full).map_err(|e| e as i32))
    }

    pub fn access(&self, path: &Path, mask: i32) -> OpResult<()> {
        let full = resolve_under(&self.backing, path);
        let entry = self.entry(path);
        let mut entry = entry.lock();

        *entry.access.entry(mask).or_insert_with(|| {
            access(&full, AccessFlags::from_bits_truncate(mask)).map_err(|e| e as i32)
        })
    }

    pub fn readlink(&self, path: &Path) -> OpResult<Vec<u8>> {
        let full = resolve_under(&self.backing, path);
        let entry = self.entry(path);
        let mut entry = entry.lock();

        entry
            .link
            .get_or_insert_with(|| {
                fs::read_link(&full)
                    .map(|target| target.into_os_string().into_vec())
                    .map_err(|e| errno_of(&e))
            })
            .clone()
    }

    /// Walk the (memoized) listing, handing each entry to `filler`.
    /// Enumeration stops early when `filler` returns true.
    pub fn list(&self, path: &Path, filler: &mut dyn FnMut(&DirEntry) -> bool) -> OpResult<()> {
        let full = resolve_under(&self.backing, path);
        let entry = self.entry(path);
        let mut entry = entry.lock();

        match entry.listing.get_or_insert_with(|| enumerate(&full)) {
            Ok(items) => {
                for item in items {
                    if filler(item) {
                        break;
                    }
                }
                Ok(())
            }
            Err(errno) => Err(*errno),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn enumerate(full: &Path) -> OpResult<Vec<DirEntry>> {
    tracing::info!("LISTING {}", full.display());

    let read_dir = fs::read_dir(full).map_err(|e| errno_of(&e))?;
    let mut items = Vec::new();
    for dent in read_dir {
        let dent = dent.map_err(|e| errno_of(&e))?;
        let kind = match dent.file_type() {
            Ok(ft) => filetype_of(ft),
            Err(_) => continue,
        };
        items.push(DirEntry {
            ino: dent.ino(),
            kind,
            name: dent.file_name(),
        });
    }
    Ok(items)
}
