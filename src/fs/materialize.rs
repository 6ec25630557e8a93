use parking_lot::Mutex;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::fs::types::resolve_under;

/// Copies files and subtrees from the backing tree into the cache tree.
///
/// All copy-in runs under one lock, shared by both views, so concurrent
/// requests for the same path never race a half-written copy. A path that is
/// already present in the cache is returned untouched.
pub(crate) struct Materializer {
    backing: PathBuf,
    cache: PathBuf,
    copy_lock: Mutex<()>,
}

impl Materializer {
    pub fn new(backing: PathBuf, cache: PathBuf) -> Self {
        Materializer {
            backing,
            cache,
            copy_lock: Mutex::new(()),
        }
    }

    pub fn backing_path(&self, rel: &Path) -> PathBuf {
        resolve_under(&self.backing, rel)
    }

    pub fn cache_path(&self, rel: &Path) -> PathBuf {
        resolve_under(&self.cache, rel)
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache
    }

    /// Make sure `cache/rel` exists, copying it from the backing tree if
    /// needed. A missing backing path is not an error: the cache location is
    /// returned for the caller to create. Directories are copied with their
    /// entire subtree, preserving mtimes on every node.
    pub fn ensure_file(&self, rel: &Path) -> io::Result<PathBuf> {
        let _guard = self.copy_lock.lock();
        self.ensure_file_locked(rel)
    }

    fn ensure_file_locked(&self, rel: &Path) -> io::Result<PathBuf> {
        let cached = self.cache_path(rel);
        if cached.symlink_metadata().is_ok() {
            return Ok(cached);
        }

        let full = self.backing_path(rel);
        let meta = match full.symlink_metadata() {
            Ok(meta) => meta,
            Err(_) => return Ok(cached),
        };

        if meta.is_dir() {
            fs::create_dir_all(&cached)?;
            copy_tree(&full, &cached)?;
            copy_mtime(&full, &cached)?;
        } else {
            if let Some(parent) = cached.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_node(&full, &cached, &meta)?;
        }

        Ok(cached)
    }

    /// Materialize the parent directory of `rel`, returning the cache
    /// location of `rel` itself.
    pub fn ensure_parent(&self, rel: &Path) -> io::Result<PathBuf> {
        let _guard = self.copy_lock.lock();

        let cached = self.cache_path(rel);
        if let Some(parent) = cached.parent() {
            if parent.symlink_metadata().is_err() {
                let parent_rel = rel.parent().unwrap_or(Path::new("/"));
                self.ensure_file_locked(parent_rel)?;
            }
        }
        Ok(cached)
    }

    /// Lazy single-file copy-in for the read-only side. An existing cache
    /// copy is never overwritten, which makes duplicate requests no-ops.
    pub fn copy_in_file(&self, rel: &Path) -> io::Result<PathBuf> {
        let _guard = self.copy_lock.lock();

        let cached = self.cache_path(rel);
        if cached.symlink_metadata().is_ok() {
            return Ok(cached);
        }

        let full = self.backing_path(rel);
        tracing::info!(
            "read-only copy '{}' -> '{}'",
            full.display(),
            cached.display()
        );
        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&full, &cached)?;
        Ok(cached)
    }
}

fn copy_node(from: &Path, to: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        std::os::unix::fs::symlink(target, to)?;
    } else {
        fs::copy(from, to)?;
        copy_mtime(from, to)?;
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for dent in fs::read_dir(from)? {
        let dent = dent?;
        let src = dent.path();
        let dest = to.join(dent.file_name());
        let ft = dent.file_type()?;

        if ft.is_dir() {
            fs::create_dir(&dest)?;
            copy_tree(&src, &dest)?;
            // Set the directory mtime after its children; writing them
            // would clobber it otherwise.
            copy_mtime(&src, &dest)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&src)?;
            std::os::unix::fs::symlink(target, &dest)?;
        } else {
            fs::copy(&src, &dest)?;
            copy_mtime(&src, &dest)?;
        }
    }
    Ok(())
}

fn copy_mtime(from: &Path, to: &Path) -> io::Result<()> {
    let mtime = from.symlink_metadata()?.modified()?;
    File::options().read(true).open(to)?.set_modified(mtime)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn setup() -> (tempfile::TempDir, Materializer) {
        let root = tempfile::tempdir().unwrap();
        let backing = root.path().join("backing");
        let cache = root.path().join("cache");
        fs::create_dir_all(&backing).unwrap();
        fs::create_dir_all(&cache).unwrap();
        let mat = Materializer::new(backing, cache);
        (root, mat)
    }

    fn age(path: &Path) -> SystemTime {
        path.symlink_metadata().unwrap().modified().unwrap()
    }

    #[test]
    fn test_ensure_file_copies_regular_file_with_mtime() {
        let (root, mat) = setup();
        let src = root.path().join("backing/f.txt");
        fs::write(&src, b"payload").unwrap();
        let old = SystemTime::now() - Duration::from_secs(86400);
        File::options()
            .read(true)
            .open(&src)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let cached = mat.ensure_file(Path::new("/f.txt")).unwrap();

        assert_eq!(fs::read(&cached).unwrap(), b"payload");
        assert_eq!(age(&cached), age(&src));
    }

    #[test]
    fn test_ensure_file_copies_directory_subtree() {
        let (root, mat) = setup();
        let src = root.path().join("backing/d");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("nested/b.txt"), b"b").unwrap();
        std::os::unix::fs::symlink("a.txt", src.join("link")).unwrap();

        let cached = mat.ensure_file(Path::new("/d")).unwrap();

        assert_eq!(fs::read(cached.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(cached.join("nested/b.txt")).unwrap(), b"b");
        assert_eq!(
            fs::read_link(cached.join("link")).unwrap(),
            PathBuf::from("a.txt")
        );
        assert_eq!(age(&cached.join("a.txt")), age(&src.join("a.txt")));
    }

    #[test]
    fn test_ensure_file_missing_backing_creates_nothing() {
        let (_root, mat) = setup();

        let cached = mat.ensure_file(Path::new("/absent")).unwrap();
        assert!(cached.symlink_metadata().is_err());
    }

    #[test]
    fn test_ensure_file_does_not_recopy() {
        let (root, mat) = setup();
        fs::write(root.path().join("backing/f"), b"original").unwrap();

        let cached = mat.ensure_file(Path::new("/f")).unwrap();
        fs::write(&cached, b"locally changed").unwrap();

        let again = mat.ensure_file(Path::new("/f")).unwrap();
        assert_eq!(fs::read(&again).unwrap(), b"locally changed");
    }

    #[test]
    fn test_ensure_parent_materializes_directory() {
        let (root, mat) = setup();
        let src = root.path().join("backing/d");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("sibling.txt"), b"s").unwrap();

        let cached = mat.ensure_parent(Path::new("/d/new_file")).unwrap();

        assert_eq!(cached, mat.cache_path(Path::new("/d/new_file")));
        assert!(cached.parent().unwrap().is_dir());
        // The parent came over as a whole subtree
        assert_eq!(
            fs::read(mat.cache_path(Path::new("/d/sibling.txt"))).unwrap(),
            b"s"
        );
    }

    #[test]
    fn test_copy_in_file_is_idempotent() {
        let (root, mat) = setup();
        fs::write(root.path().join("backing/f"), b"first").unwrap();

        let cached = mat.copy_in_file(Path::new("/f")).unwrap();
        assert_eq!(fs::read(&cached).unwrap(), b"first");

        fs::write(&cached, b"cache-side edit").unwrap();
        mat.copy_in_file(Path::new("/f")).unwrap();
        assert_eq!(fs::read(&cached).unwrap(), b"cache-side edit");
    }

    #[test]
    fn test_copy_in_file_creates_parent_directories() {
        let (root, mat) = setup();
        let src = root.path().join("backing/a/b");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("deep.txt"), b"deep").unwrap();

        let cached = mat.copy_in_file(Path::new("/a/b/deep.txt")).unwrap();
        assert_eq!(fs::read(&cached).unwrap(), b"deep");
    }
}
