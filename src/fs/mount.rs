use fuser::{
    FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{CachefsError, Result};
use crate::fs::convert::stat_to_fileattr;
use crate::fs::inode::InodeTable;
use crate::fs::CacheFs;

/// Replies carry zero-length timeouts so the kernel re-enters on every
/// lookup, attribute read, and negative lookup. The in-process metadata
/// cache is authoritative; the kernel caches nothing.
const TTL: Duration = Duration::ZERO;

/// Translates the kernel's inode-based protocol into the path-based calls
/// the dispatcher serves. The only state is the ino ↔ path table.
pub struct FuseBridge {
    fs: CacheFs,
    table: Mutex<InodeTable>,
}

impl FuseBridge {
    pub fn new(fs: CacheFs) -> Self {
        FuseBridge {
            fs,
            table: Mutex::new(InodeTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.table.lock().path_of(ino)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.table
            .lock()
            .path_of(parent)
            .map(|parent_path| parent_path.join(name))
    }

    /// Fetch attributes for a path and reply with an entry, registering the
    /// child inode on success.
    fn reply_entry_for(&self, parent: u64, name: &OsStr, path: &Path, reply: ReplyEntry) {
        match self.fs.getattr(path) {
            Ok(st) => {
                let ino = self.table.lock().child_ino(parent, name, path);
                reply.entry(&TTL, &stat_to_fileattr(&st, ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }
}

/// Mount the filesystem and serve callbacks until unmounted. Returns after a
/// clean unmount; pending background propagation is drained on the way out.
pub fn mount(fs: CacheFs, mountpoint: &Path) -> Result<()> {
    let options = vec![
        MountOption::FSName("cachefs".to_string()),
        MountOption::AutoUnmount,
    ];

    tracing::info!("mounting at {}", mountpoint.display());
    fuser::mount2(FuseBridge::new(fs), mountpoint, &options)
        .map_err(|e| CachefsError::Fuse(e.to_string()))
}

impl Filesystem for FuseBridge {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("cachefs filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs.shutdown();
        tracing::info!("cachefs filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.reply_entry_for(parent, name, &path, reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &stat_to_fileattr(&st, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // The kernel folds chmod, chown, and truncate into one setattr;
        // unbundle them in that order.
        if let Some(mode) = mode {
            if let Err(errno) = self.fs.chmod(&path, mode) {
                reply.error(errno);
                return;
            }
        }

        if uid.is_some() || gid.is_some() {
            if let Err(errno) = self
                .fs
                .chown(&path, uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX))
            {
                reply.error(errno);
                return;
            }
        }

        if let Some(size) = size {
            if let Err(errno) = self.fs.truncate(&path, size as i64, fh) {
                reply.error(errno);
                return;
            }
        }

        match self.fs.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &stat_to_fileattr(&st, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.readlink(&path) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Err(errno) = self.fs.mknod(&path, mode, rdev as u64) {
            reply.error(errno);
            return;
        }
        self.reply_entry_for(parent, name, &path, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Err(errno) = self.fs.mkdir(&path, mode) {
            reply.error(errno);
            return;
        }
        self.reply_entry_for(parent, name, &path, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.unlink(&path) {
            Ok(()) => {
                self.table.lock().remove_child(parent, name);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.table.lock().remove_child(parent, name);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Err(errno) = self.fs.symlink(target, &path) {
            reply.error(errno);
            return;
        }
        self.reply_entry_for(parent, link_name, &path, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.rename(&from, &to, flags) {
            Ok(()) => {
                let mut table = self.table.lock();
                if let Some(ino) = table.lookup_child(parent, name) {
                    table.rename(ino, parent, name, newparent, newname.to_os_string(), to);
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(from), Some(to)) = (self.path_of(ino), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Err(errno) = self.fs.link(&from, &to) {
            reply.error(errno);
            return;
        }
        self.reply_entry_for(newparent, newname, &to, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fh = match self.fs.create(&path, mode, flags) {
            Ok(fh) => fh,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match self.fs.getattr(&path) {
            Ok(st) => {
                let ino = self.table.lock().child_ino(parent, name, &path);
                reply.created(&TTL, &stat_to_fileattr(&st, ino), 0, fh, flags as u32);
            }
            Err(errno) => {
                let _ = self.fs.release(&path, fh);
                reply.error(errno);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.read(&path, offset, size, Some(fh)) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.write(&path, data, offset, Some(fh)) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.release(&path, fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.fsync(&path, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent = self
            .table
            .lock()
            .parent_of(ino)
            .unwrap_or(FUSE_ROOT_ID);

        let mut entries: Vec<(u64, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent, FileType::Directory, OsString::from("..")),
        ];

        let result = self.fs.readdir(&path, &mut |item| {
            entries.push((item.ino, item.kind, item.name.clone()));
            false
        });
        if let Err(errno) = result {
            reply.error(errno);
            return;
        }

        for (idx, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (idx + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.statfs(&path) {
            Ok(vfs) => reply.statfs(
                vfs.blocks() as u64,
                vfs.blocks_free() as u64,
                vfs.blocks_available() as u64,
                vfs.files() as u64,
                vfs.files_free() as u64,
                vfs.block_size() as u32,
                vfs.name_max() as u32,
                vfs.fragment_size() as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }
}
