use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use nix::sys::stat::{lstat, FileStat, Mode, SFlag};
use nix::unistd::{fchownat, mkfifo, truncate as truncate_path, FchownatFlags, Gid, Uid};

use crate::fs::convert::{errno_of, filetype_of, open_with_flags};
use crate::fs::materialize::Materializer;
use crate::fs::types::{DirEntry, HandleTable, OpResult};
use crate::fs::writeback::BackgroundWriter;
use crate::fs::PathOps;

/// Serves paths inside the read-write subtree.
///
/// Reads operate on eagerly materialized cache copies. Metadata mutations are
/// applied to the cache and then to the backing tree, after draining the
/// background writer so earlier data writes land first. Data mutations touch
/// only the cache and schedule asynchronous propagation.
pub(crate) struct ReadWriteView {
    mat: Arc<Materializer>,
    handles: Arc<HandleTable>,
    writer: Arc<BackgroundWriter>,
    dirty: Mutex<HashSet<u64>>,
}

impl ReadWriteView {
    pub fn new(
        mat: Arc<Materializer>,
        handles: Arc<HandleTable>,
        writer: Arc<BackgroundWriter>,
    ) -> Self {
        ReadWriteView {
            mat,
            handles,
            writer,
            dirty: Mutex::new(HashSet::new()),
        }
    }

    fn handle(&self, fh: u64) -> OpResult<Arc<File>> {
        self.handles.get(fh).ok_or(libc::EBADF)
    }
}

impl PathOps for ReadWriteView {
    fn getattr(&self, path: &Path) -> OpResult<FileStat> {
        let full = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        lstat(&full).map_err(|e| e as i32)
    }

    fn access(&self, path: &Path, mask: i32) -> OpResult<()> {
        let full = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        nix::unistd::access(&full, nix::unistd::AccessFlags::from_bits_truncate(mask))
            .map_err(|e| e as i32)
    }

    fn readlink(&self, path: &Path) -> OpResult<Vec<u8>> {
        use std::os::unix::ffi::OsStringExt;

        let full = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        fs::read_link(&full)
            .map(|target| target.into_os_string().into_vec())
            .map_err(|e| errno_of(&e))
    }

    fn readdir(&self, path: &Path, filler: &mut dyn FnMut(&DirEntry) -> bool) -> OpResult<()> {
        let full = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;

        for dent in fs::read_dir(&full).map_err(|e| errno_of(&e))? {
            let dent = dent.map_err(|e| errno_of(&e))?;
            let kind = match dent.file_type() {
                Ok(ft) => filetype_of(ft),
                Err(_) => continue,
            };
            let item = DirEntry {
                ino: dent.ino(),
                kind,
                name: dent.file_name(),
            };
            if filler(&item) {
                break;
            }
        }
        Ok(())
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> OpResult<()> {
        let cached = self.mat.ensure_parent(path).map_err(|e| errno_of(&e))?;

        let kind = mode & libc::S_IFMT as u32;
        if kind == libc::S_IFREG as u32 || kind == 0 {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&cached)
                .map(|_| ())
                .map_err(|e| errno_of(&e))
        } else if kind == libc::S_IFIFO as u32 {
            mkfifo(&cached, Mode::from_bits_truncate(mode as nix::libc::mode_t))
                .map_err(|e| e as i32)
        } else {
            nix::sys::stat::mknod(
                &cached,
                SFlag::from_bits_truncate(mode as nix::libc::mode_t),
                Mode::from_bits_truncate(mode as nix::libc::mode_t),
                rdev as nix::libc::dev_t,
            )
            .map_err(|e| e as i32)
        }
    }

    fn mkdir(&self, path: &Path, mode: u32) -> OpResult<()> {
        let cached = self.mat.ensure_parent(path).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        let mut builder = fs::DirBuilder::new();
        builder.mode(mode);
        builder.create(&cached).map_err(|e| errno_of(&e))?;
        builder
            .create(self.mat.backing_path(path))
            .map_err(|e| errno_of(&e))
    }

    fn unlink(&self, path: &Path) -> OpResult<()> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        fs::remove_file(&cached).map_err(|e| errno_of(&e))?;
        fs::remove_file(self.mat.backing_path(path)).map_err(|e| errno_of(&e))
    }

    fn rmdir(&self, path: &Path) -> OpResult<()> {
        let cached = self.mat.ensure_parent(path).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        fs::remove_dir(&cached).map_err(|e| errno_of(&e))?;
        fs::remove_dir(self.mat.backing_path(path)).map_err(|e| errno_of(&e))
    }

    fn symlink(&self, target: &Path, linkpath: &Path) -> OpResult<()> {
        self.mat.ensure_parent(target).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        // The target is written verbatim into both trees; materialized cache
        // locations must not leak into the backing store.
        std::os::unix::fs::symlink(target, self.mat.cache_path(linkpath))
            .map_err(|e| errno_of(&e))?;
        std::os::unix::fs::symlink(target, self.mat.backing_path(linkpath))
            .map_err(|e| errno_of(&e))
    }

    fn rename(&self, from: &Path, to: &Path, flags: u32) -> OpResult<()> {
        if flags != 0 {
            return Err(libc::EINVAL);
        }

        let cached = self.mat.ensure_parent(from).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        fs::rename(&cached, self.mat.cache_path(to)).map_err(|e| errno_of(&e))?;
        fs::rename(self.mat.backing_path(from), self.mat.backing_path(to))
            .map_err(|e| errno_of(&e))
    }

    fn link(&self, from: &Path, to: &Path) -> OpResult<()> {
        self.writer.flush();

        fs::hard_link(self.mat.cache_path(from), self.mat.cache_path(to))
            .map_err(|e| errno_of(&e))?;
        fs::hard_link(self.mat.backing_path(from), self.mat.backing_path(to))
            .map_err(|e| errno_of(&e))
    }

    fn chmod(&self, path: &Path, mode: u32) -> OpResult<()> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        fs::set_permissions(&cached, fs::Permissions::from_mode(mode))
            .map_err(|e| errno_of(&e))?;
        fs::set_permissions(
            self.mat.backing_path(path),
            fs::Permissions::from_mode(mode),
        )
        .map_err(|e| errno_of(&e))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> OpResult<()> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        // u32::MAX means "leave unchanged", mirroring chown(2)'s -1.
        let owner = (uid != u32::MAX).then(|| Uid::from_raw(uid));
        let group = (gid != u32::MAX).then(|| Gid::from_raw(gid));

        fchownat(
            None,
            &cached,
            owner,
            group,
            FchownatFlags::NoFollowSymlink,
        )
        .map_err(|e| e as i32)?;
        fchownat(
            None,
            &self.mat.backing_path(path),
            owner,
            group,
            FchownatFlags::NoFollowSymlink,
        )
        .map_err(|e| e as i32)
    }

    fn truncate(&self, path: &Path, size: i64, fh: Option<u64>) -> OpResult<()> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;

        match fh {
            Some(fh) => {
                let file = self.handle(fh)?;
                file.set_len(size as u64).map_err(|e| errno_of(&e))?;
            }
            None => {
                truncate_path(&cached, size as nix::libc::off_t).map_err(|e| e as i32)?;
            }
        }

        self.writer.enqueue(path);
        Ok(())
    }

    fn create(&self, path: &Path, mode: u32, flags: i32) -> OpResult<u64> {
        let cached = self.mat.ensure_parent(path).map_err(|e| errno_of(&e))?;
        self.writer.flush();

        let file = open_with_flags(&cached, flags | libc::O_CREAT, Some(mode))
            .map_err(|e| errno_of(&e))?;
        let fh = self.handles.insert(file);

        // The backing copy is created up front so the path exists remotely;
        // its handle is closed immediately and data follows asynchronously.
        match open_with_flags(
            &self.mat.backing_path(path),
            flags | libc::O_CREAT,
            Some(mode),
        ) {
            Ok(remote) => drop(remote),
            Err(e) => {
                self.handles.remove(fh);
                return Err(errno_of(&e));
            }
        }

        Ok(fh)
    }

    fn open(&self, path: &Path, flags: i32) -> OpResult<u64> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;
        let file = open_with_flags(&cached, flags, None).map_err(|e| errno_of(&e))?;
        Ok(self.handles.insert(file))
    }

    fn read(&self, path: &Path, offset: i64, size: u32, fh: Option<u64>) -> OpResult<Vec<u8>> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;

        let file = match fh {
            Some(fh) => self.handle(fh)?,
            None => Arc::new(File::open(&cached).map_err(|e| errno_of(&e))?),
        };

        let mut buf = vec![0u8; size as usize];
        let n = file
            .read_at(&mut buf, offset as u64)
            .map_err(|e| errno_of(&e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8], offset: i64, fh: Option<u64>) -> OpResult<u32> {
        let cached = self.mat.ensure_file(path).map_err(|e| errno_of(&e))?;

        match fh {
            Some(fh) => {
                let file = self.handle(fh)?;
                let n = file
                    .write_at(data, offset as u64)
                    .map_err(|e| errno_of(&e))?;
                self.dirty.lock().insert(fh);
                Ok(n as u32)
            }
            None => {
                let file = fs::OpenOptions::new()
                    .write(true)
                    .open(&cached)
                    .map_err(|e| errno_of(&e))?;
                let n = file
                    .write_at(data, offset as u64)
                    .map_err(|e| errno_of(&e))?;
                self.writer.enqueue(path);
                Ok(n as u32)
            }
        }
    }

    fn release(&self, path: &Path, fh: u64) -> OpResult<()> {
        self.handles.remove(fh);
        if self.dirty.lock().remove(&fh) {
            self.writer.enqueue(path);
        }
        Ok(())
    }
}
