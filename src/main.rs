use clap::Parser;

use cachefs::cli::Args;
use cachefs::fs::mount;
use cachefs::{CacheFs, Config, Result};

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = Config::resolve(
        args.config.as_deref(),
        args.backing.clone(),
        args.cache.clone(),
        args.rw.clone(),
    )?;

    tracing::info!(
        "backing={} cache={} rw={}",
        config.backing.display(),
        config.cache.display(),
        config.rw.display()
    );

    let fs = CacheFs::new(&config);
    if args.prewarm {
        fs.prewarm();
    }

    mount::mount(fs, &args.mountpoint)?;
    Ok(0)
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = std::env::var("CACHEFS_LOG").unwrap_or_else(|_| "info".to_string());

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
