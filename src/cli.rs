use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cachefs")]
#[command(
    about = "Mount a caching overlay over a slow backing tree, with write-through to a designated subtree"
)]
pub struct Args {
    #[arg(help = "Directory where the filesystem is mounted")]
    pub mountpoint: PathBuf,

    #[arg(help = "Backing tree (the source of truth)")]
    pub backing: Option<PathBuf>,

    #[arg(help = "Local cache tree")]
    pub cache: Option<PathBuf>,

    #[arg(help = "Read-write subtree inside the backing tree")]
    pub rw: Option<PathBuf>,

    #[arg(long, help = "Read roots from a TOML config file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Append log lines to this file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[arg(long, help = "Prime the metadata cache from the existing cache tree")]
    pub prewarm: bool,
}
