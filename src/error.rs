use thiserror::Error;

pub type Result<T> = std::result::Result<T, CachefsError>;

#[derive(Error, Debug)]
pub enum CachefsError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FUSE error: {0}")]
    Fuse(String),
}
