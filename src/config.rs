use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CachefsError, Result};

/// On-disk configuration, loaded from a TOML file when `--config` is given.
/// Every field is optional; command-line positionals take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CachefsError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            CachefsError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// The three resolved roots. All are absolute and canonicalized; `rw` is a
/// directory inside `backing` within which mutation is permitted.
#[derive(Debug, Clone)]
pub struct Config {
    pub backing: PathBuf,
    pub cache: PathBuf,
    pub rw: PathBuf,
}

impl Config {
    /// Merge the optional config file with command-line overrides and
    /// validate the result. The backing tree and read-write subtree must
    /// already exist; the cache tree is created if missing and reused as-is
    /// when it already has content.
    pub fn resolve(
        file: Option<&Path>,
        backing: Option<PathBuf>,
        cache: Option<PathBuf>,
        rw: Option<PathBuf>,
    ) -> Result<Config> {
        let file_cfg = match file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let backing = pick("backing", backing, file_cfg.paths.backing.as_deref())?;
        let cache = pick("cache", cache, file_cfg.paths.cache.as_deref())?;
        let rw = pick("rw", rw, file_cfg.paths.rw.as_deref())?;

        let backing = canonical("backing", &backing)?;

        if !cache.exists() {
            fs::create_dir_all(&cache).map_err(|e| {
                CachefsError::Config(format!(
                    "Failed to create cache directory {}: {}",
                    cache.display(),
                    e
                ))
            })?;
        }
        let cache = canonical("cache", &cache)?;
        let rw = canonical("rw", &rw)?;

        if !rw.starts_with(&backing) {
            return Err(CachefsError::Config(format!(
                "Read-write subtree {} is not inside backing tree {}",
                rw.display(),
                backing.display()
            )));
        }

        Ok(Config { backing, cache, rw })
    }
}

fn pick(name: &str, cli: Option<PathBuf>, file: Option<&str>) -> Result<PathBuf> {
    match (cli, file) {
        (Some(p), _) => Ok(p),
        (None, Some(s)) => Ok(expand_tilde(s)),
        (None, None) => Err(CachefsError::Config(format!(
            "No {} path given on the command line or in the config file",
            name
        ))),
    }
}

fn canonical(name: &str, path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| {
        CachefsError::Config(format!(
            "Failed to resolve {} path {}: {}",
            name,
            path.display(),
            e
        ))
    })
}

/// Expand a leading `~/` using $HOME. Paths without the prefix pass through.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (tempfile::TempDir, PathBuf, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let backing = root.path().join("backing");
        let cache = root.path().join("cache");
        let rw = backing.join("rw");
        fs::create_dir_all(&rw).unwrap();
        (root, backing, cache, rw)
    }

    #[test]
    fn test_resolve_from_cli() {
        let (_root, backing, cache, rw) = tree();

        let config =
            Config::resolve(None, Some(backing.clone()), Some(cache.clone()), Some(rw)).unwrap();

        assert!(config.rw.starts_with(&config.backing));
        // The cache directory is created on demand
        assert!(cache.is_dir());
    }

    #[test]
    fn test_resolve_from_file() {
        let (root, backing, cache, rw) = tree();

        let config_path = root.path().join("config.toml");
        let content = format!(
            "[paths]\nbacking = {:?}\ncache = {:?}\nrw = {:?}\n",
            backing, cache, rw
        );
        fs::write(&config_path, content).unwrap();

        let config = Config::resolve(Some(&config_path), None, None, None).unwrap();
        assert!(config.rw.starts_with(&config.backing));
    }

    #[test]
    fn test_missing_backing_is_an_error() {
        let (_root, backing, cache, rw) = tree();
        fs::remove_dir_all(&backing).unwrap();

        let result = Config::resolve(None, Some(backing), Some(cache), Some(rw));
        assert!(matches!(result, Err(CachefsError::Config(_))));
    }

    #[test]
    fn test_rw_outside_backing_is_an_error() {
        let (root, backing, cache, _rw) = tree();
        let stray = root.path().join("elsewhere");
        fs::create_dir_all(&stray).unwrap();

        let result = Config::resolve(None, Some(backing), Some(cache), Some(stray));
        assert!(matches!(result, Err(CachefsError::Config(_))));
    }

    #[test]
    fn test_missing_path_reports_which_one() {
        let (_root, backing, cache, _rw) = tree();

        let err = Config::resolve(None, Some(backing), Some(cache), None).unwrap_err();
        assert!(err.to_string().contains("rw"));
    }
}
