use std::fs;
use std::path::PathBuf;

use cachefs::{CacheFs, Config};

/// A dispatcher wired over throwaway backing/cache trees, with `rw/`
/// pre-created inside the backing tree.
pub struct Harness {
    pub fs: CacheFs,
    pub backing: PathBuf,
    pub cache: PathBuf,
    _root: tempfile::TempDir,
}

#[allow(dead_code)]
pub fn setup() -> Harness {
    setup_with(|_backing| {})
}

/// Build a harness after letting the caller populate the backing tree.
pub fn setup_with<F>(populate: F) -> Harness
where
    F: FnOnce(&std::path::Path),
{
    let root = tempfile::tempdir().unwrap();
    let backing = root.path().join("backing");
    let cache = root.path().join("cache");
    fs::create_dir_all(backing.join("rw")).unwrap();
    fs::create_dir_all(&cache).unwrap();

    populate(&backing);

    let config = Config {
        rw: backing.join("rw"),
        backing: backing.clone(),
        cache: cache.clone(),
    };

    Harness {
        fs: CacheFs::new(&config),
        backing,
        cache,
        _root: root,
    }
}
