pub mod cli;
pub mod config;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{CachefsError, Result};
pub use fs::CacheFs;
