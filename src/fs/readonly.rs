use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use nix::sys::stat::FileStat;

use crate::fs::convert::{errno_of, open_with_flags};
use crate::fs::materialize::Materializer;
use crate::fs::meta::MetadataCache;
use crate::fs::types::{DirEntry, HandleTable, OpResult};
use crate::fs::PathOps;

/// Serves paths outside the read-write subtree. Metadata comes from the
/// memoizing cache; file content is copied into the cache tree on first open
/// and served from there. Every mutating operation is rejected.
pub(crate) struct ReadOnlyView {
    meta: MetadataCache,
    mat: Arc<Materializer>,
    handles: Arc<HandleTable>,
}

impl ReadOnlyView {
    pub fn new(meta: MetadataCache, mat: Arc<Materializer>, handles: Arc<HandleTable>) -> Self {
        ReadOnlyView { meta, mat, handles }
    }

    /// Walk an existing cache tree and prime the metadata cache with the
    /// entries a remounted session is most likely to ask for first.
    pub fn prewarm(&self) {
        let cache_root = self.mat.cache_root().to_path_buf();
        tracing::info!("reading cache from: {}", cache_root.display());

        self.prewarm_dir(Path::new("/"));

        tracing::info!("read {} items", self.meta.len());
    }

    fn prewarm_dir(&self, rel: &Path) {
        let dir = self.mat.cache_path(rel);
        let Ok(read_dir) = fs::read_dir(&dir) else {
            return;
        };

        for dent in read_dir.flatten() {
            let child = rel.join(dent.file_name());
            let _ = self.meta.getattr(&child);
            let _ = self.meta.access(&child, libc::R_OK);
            if dent.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                let _ = self.meta.list(&child, &mut |_| false);
                self.prewarm_dir(&child);
            }
        }
    }
}

impl PathOps for ReadOnlyView {
    fn getattr(&self, path: &Path) -> OpResult<FileStat> {
        self.meta.getattr(path)
    }

    fn access(&self, path: &Path, mask: i32) -> OpResult<()> {
        self.meta.access(path, mask)
    }

    fn readlink(&self, path: &Path) -> OpResult<Vec<u8>> {
        self.meta.readlink(path)
    }

    fn readdir(&self, path: &Path, filler: &mut dyn FnMut(&DirEntry) -> bool) -> OpResult<()> {
        self.meta.list(path, filler)
    }

    fn mknod(&self, _path: &Path, _mode: u32, _rdev: u64) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn mkdir(&self, _path: &Path, _mode: u32) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn unlink(&self, _path: &Path) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn rmdir(&self, _path: &Path) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn symlink(&self, _target: &Path, _linkpath: &Path) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn rename(&self, _from: &Path, _to: &Path, _flags: u32) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn link(&self, _from: &Path, _to: &Path) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn chmod(&self, _path: &Path, _mode: u32) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn truncate(&self, _path: &Path, _size: i64, _fh: Option<u64>) -> OpResult<()> {
        Err(libc::EROFS)
    }

    fn create(&self, _path: &Path, _mode: u32, _flags: i32) -> OpResult<u64> {
        Err(libc::EROFS)
    }

    fn open(&self, path: &Path, flags: i32) -> OpResult<u64> {
        let cached = self.mat.copy_in_file(path).map_err(|e| errno_of(&e))?;
        let file = open_with_flags(&cached, flags, None).map_err(|e| errno_of(&e))?;
        Ok(self.handles.insert(file))
    }

    fn read(&self, path: &Path, offset: i64, size: u32, fh: Option<u64>) -> OpResult<Vec<u8>> {
        let cached = self.mat.copy_in_file(path).map_err(|e| errno_of(&e))?;

        let file = match fh.and_then(|fh| self.handles.get(fh)) {
            Some(file) => file,
            None => Arc::new(File::open(&cached).map_err(|e| errno_of(&e))?),
        };

        let mut buf = vec![0u8; size as usize];
        let n = file
            .read_at(&mut buf, offset as u64)
            .map_err(|e| errno_of(&e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&self, _path: &Path, _data: &[u8], _offset: i64, _fh: Option<u64>) -> OpResult<u32> {
        Err(libc::EROFS)
    }

    fn release(&self, _path: &Path, fh: u64) -> OpResult<()> {
        self.handles.remove(fh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn setup() -> (tempfile::TempDir, ReadOnlyView, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let backing = root.path().join("backing");
        let cache = root.path().join("cache");
        fs::create_dir_all(&backing).unwrap();
        fs::create_dir_all(&cache).unwrap();

        let mat = Arc::new(Materializer::new(backing.clone(), cache.clone()));
        let view = ReadOnlyView::new(
            MetadataCache::new(backing.clone()),
            mat,
            Arc::new(HandleTable::new()),
        );
        (root, view, backing, cache)
    }

    #[test]
    fn test_mutating_operations_are_rejected() {
        let (_root, view, _backing, _cache) = setup();
        let p = Path::new("/f");

        assert_eq!(view.mknod(p, 0o644, 0), Err(libc::EROFS));
        assert_eq!(view.mkdir(p, 0o755), Err(libc::EROFS));
        assert_eq!(view.unlink(p), Err(libc::EROFS));
        assert_eq!(view.rmdir(p), Err(libc::EROFS));
        assert_eq!(view.symlink(p, Path::new("/l")), Err(libc::EROFS));
        assert_eq!(view.rename(p, Path::new("/g"), 0), Err(libc::EROFS));
        assert_eq!(view.link(p, Path::new("/g")), Err(libc::EROFS));
        assert_eq!(view.chmod(p, 0o600), Err(libc::EROFS));
        assert_eq!(view.chown(p, 0, 0), Err(libc::EROFS));
        assert_eq!(view.truncate(p, 0, None), Err(libc::EROFS));
        assert_eq!(view.create(p, 0o644, libc::O_WRONLY), Err(libc::EROFS));
        assert_eq!(view.write(p, b"x", 0, None), Err(libc::EROFS));
    }

    #[test]
    fn test_open_populates_cache_copy() {
        let (_root, view, backing, cache) = setup();
        fs::write(backing.join("f.txt"), b"content").unwrap();

        let fh = view.open(Path::new("/f.txt"), libc::O_RDONLY).unwrap();
        assert_eq!(fs::read(cache.join("f.txt")).unwrap(), b"content");

        let data = view.read(Path::new("/f.txt"), 0, 64, Some(fh)).unwrap();
        assert_eq!(data, b"content");
        view.release(Path::new("/f.txt"), fh).unwrap();
    }

    #[test]
    fn test_second_open_serves_existing_copy() {
        let (_root, view, backing, cache) = setup();
        fs::write(backing.join("f.txt"), b"original").unwrap();

        let fh = view.open(Path::new("/f.txt"), libc::O_RDONLY).unwrap();
        view.release(Path::new("/f.txt"), fh).unwrap();

        // Backing changes are not picked up: the cache copy is authoritative.
        fs::write(backing.join("f.txt"), b"changed upstream").unwrap();
        let fh = view.open(Path::new("/f.txt"), libc::O_RDONLY).unwrap();
        let data = view.read(Path::new("/f.txt"), 0, 64, Some(fh)).unwrap();
        assert_eq!(data, b"original");
        assert_eq!(fs::read(cache.join("f.txt")).unwrap(), b"original");
    }

    #[test]
    fn test_read_without_handle_opens_and_closes() {
        let (_root, view, backing, _cache) = setup();
        fs::write(backing.join("f.txt"), b"0123456789").unwrap();

        let data = view.read(Path::new("/f.txt"), 4, 3, None).unwrap();
        assert_eq!(data, b"456");
    }

    #[test]
    fn test_prewarm_primes_metadata() {
        let (_root, view, backing, cache) = setup();
        fs::create_dir_all(backing.join("d")).unwrap();
        fs::write(backing.join("d/f.txt"), b"x").unwrap();
        fs::create_dir_all(cache.join("d")).unwrap();
        fs::write(cache.join("d/f.txt"), b"x").unwrap();

        view.prewarm();

        // Entries exist, so the memoized stat survives backing deletion.
        fs::remove_file(backing.join("d/f.txt")).unwrap();
        assert!(view.getattr(Path::new("/d/f.txt")).is_ok());
    }
}
