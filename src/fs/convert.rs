use fuser::{FileAttr, FileType};
use nix::sys::stat::FileStat;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Map std::io::Error to the OS errno it wraps. Errors synthesized by the
/// standard library (no raw code) fall back to the closest ErrorKind match.
pub(crate) fn errno_of(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

pub(crate) fn filetype_of(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn mode_to_filetype(mode: u32) -> FileType {
    match mode & (libc::S_IFMT as u32) {
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timespec_to_systemtime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Convert a memoized lstat result into the attribute record the kernel
/// bridge replies with. The inode number is the bridge's own; everything
/// else comes from the stat struct.
pub(crate) fn stat_to_fileattr(st: &FileStat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: timespec_to_systemtime(st.st_atime, st.st_atime_nsec),
        mtime: timespec_to_systemtime(st.st_mtime, st.st_mtime_nsec),
        ctime: timespec_to_systemtime(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: mode_to_filetype(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

/// Open a file honoring the flags the kernel handed us. The access mode,
/// O_CREAT, O_TRUNC, and O_APPEND map onto OpenOptions; anything else is
/// passed through verbatim.
pub(crate) fn open_with_flags(path: &Path, flags: i32, mode: Option<u32>) -> io::Result<File> {
    let acc = flags & libc::O_ACCMODE;
    let writable = acc == libc::O_WRONLY || acc == libc::O_RDWR;

    let mut opts = OpenOptions::new();
    opts.read(acc == libc::O_RDONLY || acc == libc::O_RDWR)
        .write(writable)
        .create(flags & libc::O_CREAT != 0)
        .truncate(writable && flags & libc::O_TRUNC != 0)
        .append(writable && flags & libc::O_APPEND != 0);

    let passthrough = flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND);
    if passthrough != 0 {
        opts.custom_flags(passthrough);
    }
    if let Some(mode) = mode {
        opts.mode(mode & 0o7777);
    }

    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_errno_of_prefers_raw_os_error() {
        let e = io::Error::from_raw_os_error(libc::ENOTDIR);
        assert_eq!(errno_of(&e), libc::ENOTDIR);
    }

    #[test]
    fn test_errno_of_maps_synthetic_kinds() {
        let e = io::Error::new(ErrorKind::NotFound, "gone");
        assert_eq!(errno_of(&e), libc::ENOENT);
        let e = io::Error::new(ErrorKind::AlreadyExists, "there");
        assert_eq!(errno_of(&e), libc::EEXIST);
    }

    #[test]
    fn test_mode_to_filetype() {
        assert_eq!(
            mode_to_filetype(libc::S_IFDIR as u32 | 0o755),
            FileType::Directory
        );
        assert_eq!(
            mode_to_filetype(libc::S_IFLNK as u32 | 0o777),
            FileType::Symlink
        );
        assert_eq!(
            mode_to_filetype(libc::S_IFREG as u32 | 0o644),
            FileType::RegularFile
        );
    }

    #[test]
    fn test_stat_round_trip_through_fileattr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let st = nix::sys::stat::lstat(&path).unwrap();
        let attr = stat_to_fileattr(&st, 42);

        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.uid, st.st_uid);
    }

    #[test]
    fn test_open_with_flags_creates_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new");

        let file =
            open_with_flags(&path, libc::O_WRONLY | libc::O_CREAT, Some(0o600)).unwrap();
        drop(file);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
