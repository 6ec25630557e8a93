mod convert;
mod inode;
mod materialize;
mod meta;
pub mod mount;
mod readonly;
mod readwrite;
pub mod types;
mod writeback;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::stat::FileStat;
use nix::sys::statvfs::{statvfs, Statvfs};

use materialize::Materializer;
use meta::MetadataCache;
use readonly::ReadOnlyView;
use readwrite::ReadWriteView;
use types::{resolve_under, DirEntry, HandleTable, OpResult};
use writeback::BackgroundWriter;

use crate::config::Config;

/// The full per-path callback surface. Both views implement all of it; the
/// read-only view answers every mutating call with EROFS.
pub(crate) trait PathOps: Send + Sync {
    fn getattr(&self, path: &Path) -> OpResult<FileStat>;
    fn access(&self, path: &Path, mask: i32) -> OpResult<()>;
    fn readlink(&self, path: &Path) -> OpResult<Vec<u8>>;
    fn readdir(&self, path: &Path, filler: &mut dyn FnMut(&DirEntry) -> bool) -> OpResult<()>;
    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> OpResult<()>;
    fn mkdir(&self, path: &Path, mode: u32) -> OpResult<()>;
    fn unlink(&self, path: &Path) -> OpResult<()>;
    fn rmdir(&self, path: &Path) -> OpResult<()>;
    fn symlink(&self, target: &Path, linkpath: &Path) -> OpResult<()>;
    fn rename(&self, from: &Path, to: &Path, flags: u32) -> OpResult<()>;
    fn link(&self, from: &Path, to: &Path) -> OpResult<()>;
    fn chmod(&self, path: &Path, mode: u32) -> OpResult<()>;
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> OpResult<()>;
    fn truncate(&self, path: &Path, size: i64, fh: Option<u64>) -> OpResult<()>;
    fn create(&self, path: &Path, mode: u32, flags: i32) -> OpResult<u64>;
    fn open(&self, path: &Path, flags: i32) -> OpResult<u64>;
    fn read(&self, path: &Path, offset: i64, size: u32, fh: Option<u64>) -> OpResult<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8], offset: i64, fh: Option<u64>) -> OpResult<u32>;
    fn release(&self, path: &Path, fh: u64) -> OpResult<()>;
}

/// Routes each callback to the read-only or read-write view by testing the
/// path against the configured read-write subtree. Holds no per-operation
/// state of its own.
pub struct CacheFs {
    backing: PathBuf,
    rw: PathBuf,
    readonly: ReadOnlyView,
    readwrite: ReadWriteView,
    writer: Arc<BackgroundWriter>,
}

impl CacheFs {
    pub fn new(config: &Config) -> Self {
        let mat = Arc::new(Materializer::new(
            config.backing.clone(),
            config.cache.clone(),
        ));
        let handles = Arc::new(HandleTable::new());
        let writer = Arc::new(BackgroundWriter::spawn(
            config.backing.clone(),
            config.cache.clone(),
        ));

        let readonly = ReadOnlyView::new(
            MetadataCache::new(config.backing.clone()),
            Arc::clone(&mat),
            Arc::clone(&handles),
        );
        let readwrite = ReadWriteView::new(mat, handles, Arc::clone(&writer));

        CacheFs {
            backing: config.backing.clone(),
            rw: config.rw.clone(),
            readonly,
            readwrite,
            writer,
        }
    }

    /// A path is writable when its backing location falls inside the
    /// read-write subtree. The comparison is component-wise, so a sibling
    /// like `rwx` never routes as if it were under `rw`.
    fn is_write_path(&self, path: &Path) -> bool {
        resolve_under(&self.backing, path).starts_with(&self.rw)
    }

    fn view_for(&self, path: &Path) -> &dyn PathOps {
        if self.is_write_path(path) {
            &self.readwrite
        } else {
            &self.readonly
        }
    }

    pub fn getattr(&self, path: &Path) -> OpResult<FileStat> {
        self.view_for(path).getattr(path)
    }

    pub fn access(&self, path: &Path, mask: i32) -> OpResult<()> {
        self.view_for(path).access(path, mask)
    }

    pub fn readlink(&self, path: &Path) -> OpResult<Vec<u8>> {
        self.view_for(path).readlink(path)
    }

    pub fn readdir(
        &self,
        path: &Path,
        filler: &mut dyn FnMut(&DirEntry) -> bool,
    ) -> OpResult<()> {
        self.view_for(path).readdir(path, filler)
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> OpResult<()> {
        self.view_for(path).mknod(path, mode, rdev)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> OpResult<()> {
        self.view_for(path).mkdir(path, mode)
    }

    pub fn unlink(&self, path: &Path) -> OpResult<()> {
        self.view_for(path).unlink(path)
    }

    pub fn rmdir(&self, path: &Path) -> OpResult<()> {
        self.view_for(path).rmdir(path)
    }

    // Two-path operations route on the first path; the selected view handles
    // the second.

    pub fn symlink(&self, target: &Path, linkpath: &Path) -> OpResult<()> {
        self.view_for(target).symlink(target, linkpath)
    }

    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> OpResult<()> {
        self.view_for(from).rename(from, to, flags)
    }

    pub fn link(&self, from: &Path, to: &Path) -> OpResult<()> {
        self.view_for(from).link(from, to)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> OpResult<()> {
        self.view_for(path).chmod(path, mode)
    }

    pub fn chown(&self, path: &Path, uid: u32, gid: u32) -> OpResult<()> {
        self.view_for(path).chown(path, uid, gid)
    }

    pub fn truncate(&self, path: &Path, size: i64, fh: Option<u64>) -> OpResult<()> {
        self.view_for(path).truncate(path, size, fh)
    }

    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> OpResult<u64> {
        self.view_for(path).create(path, mode, flags)
    }

    pub fn open(&self, path: &Path, flags: i32) -> OpResult<u64> {
        self.view_for(path).open(path, flags)
    }

    pub fn read(&self, path: &Path, offset: i64, size: u32, fh: Option<u64>) -> OpResult<Vec<u8>> {
        self.view_for(path).read(path, offset, size, fh)
    }

    pub fn write(&self, path: &Path, data: &[u8], offset: i64, fh: Option<u64>) -> OpResult<u32> {
        self.view_for(path).write(path, data, offset, fh)
    }

    pub fn release(&self, path: &Path, fh: u64) -> OpResult<()> {
        self.view_for(path).release(path, fh)
    }

    pub fn statfs(&self, path: &Path) -> OpResult<Statvfs> {
        statvfs(&resolve_under(&self.backing, path)).map_err(|e| e as i32)
    }

    pub fn fsync(&self, _path: &Path, _datasync: bool) -> OpResult<()> {
        Ok(())
    }

    /// Drain the background writer. Exposed so callers can force pending
    /// data propagation to complete.
    pub fn flush(&self) {
        self.writer.flush();
    }

    /// Prime the metadata cache from an existing cache tree.
    pub fn prewarm(&self) {
        self.readonly.prewarm();
    }

    /// Drain pending propagation and stop the writer thread. Called on
    /// unmount; safe to call more than once.
    pub fn shutdown(&self) {
        self.writer.flush();
        self.writer.stop();
    }
}
