use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::fs::types::resolve_under;

struct State {
    queue: VecDeque<PathBuf>,
    /// True while the worker is copying an entry it already popped.
    busy: bool,
    running: bool,
}

struct Shared {
    backing: PathBuf,
    cache: PathBuf,
    state: Mutex<State>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

/// Propagates changed cache files to the backing tree on a single worker
/// thread. The queue is FIFO and unbounded; a failed copy is logged and
/// dropped, never retried, and never kills the worker.
pub(crate) struct BackgroundWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWriter {
    pub fn spawn(backing: PathBuf, cache: PathBuf) -> Self {
        let shared = Arc::new(Shared {
            backing,
            cache,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                busy: false,
                running: true,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("cachefs-writeback".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn writeback thread");

        BackgroundWriter {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Append a path and wake the worker.
    pub fn enqueue(&self, rel: &Path) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(rel.to_path_buf());
        self.shared.work_cv.notify_one();
    }

    /// Block until every entry enqueued so far has been propagated. Returns
    /// immediately once the writer has been stopped.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while state.running && (!state.queue.is_empty() || state.busy) {
            self.shared.idle_cv.wait(&mut state);
        }
    }

    /// Stop the worker and join it. Entries still queued are discarded.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.work_cv.notify_all();
            self.shared.idle_cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let rel = {
            let mut state = shared.state.lock();
            loop {
                if !state.running {
                    return;
                }
                if let Some(rel) = state.queue.pop_front() {
                    state.busy = true;
                    break rel;
                }
                shared.work_cv.wait(&mut state);
            }
        };

        if let Err(e) = propagate(&shared, &rel) {
            tracing::error!("background sync of {} failed: {}", rel.display(), e);
        }

        let mut state = shared.state.lock();
        state.busy = false;
        if state.queue.is_empty() {
            shared.idle_cv.notify_all();
        }
    }
}

fn propagate(shared: &Shared, rel: &Path) -> std::io::Result<()> {
    let local = resolve_under(&shared.cache, rel);
    let remote = resolve_under(&shared.backing, rel);

    if let Some(parent) = remote.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&local, &remote)?;
    tracing::debug!("synced {} -> {}", local.display(), remote.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackgroundWriter) {
        let root = tempfile::tempdir().unwrap();
        let backing = root.path().join("backing");
        let cache = root.path().join("cache");
        fs::create_dir_all(&backing).unwrap();
        fs::create_dir_all(&cache).unwrap();
        let writer = BackgroundWriter::spawn(backing, cache);
        (root, writer)
    }

    #[test]
    fn test_enqueue_then_flush_copies_file() {
        let (root, writer) = setup();
        fs::write(root.path().join("cache/f.bin"), b"bytes").unwrap();

        writer.enqueue(Path::new("/f.bin"));
        writer.flush();

        assert_eq!(fs::read(root.path().join("backing/f.bin")).unwrap(), b"bytes");
    }

    #[test]
    fn test_propagation_creates_missing_parents() {
        let (root, writer) = setup();
        fs::create_dir_all(root.path().join("cache/a/b")).unwrap();
        fs::write(root.path().join("cache/a/b/f"), b"deep").unwrap();

        writer.enqueue(Path::new("/a/b/f"));
        writer.flush();

        assert_eq!(fs::read(root.path().join("backing/a/b/f")).unwrap(), b"deep");
    }

    #[test]
    fn test_propagation_overwrites_existing_file() {
        let (root, writer) = setup();
        fs::write(root.path().join("backing/f"), b"stale").unwrap();
        fs::write(root.path().join("cache/f"), b"fresh").unwrap();

        writer.enqueue(Path::new("/f"));
        writer.flush();

        assert_eq!(fs::read(root.path().join("backing/f")).unwrap(), b"fresh");
    }

    #[test]
    fn test_failed_entry_does_not_stop_the_worker() {
        let (root, writer) = setup();
        fs::write(root.path().join("cache/real"), b"ok").unwrap();

        writer.enqueue(Path::new("/missing"));
        writer.enqueue(Path::new("/real"));
        writer.flush();

        assert!(!root.path().join("backing/missing").exists());
        assert_eq!(fs::read(root.path().join("backing/real")).unwrap(), b"ok");
    }

    #[test]
    fn test_flush_on_empty_queue_returns() {
        let (_root, writer) = setup();
        writer.flush();
    }

    #[test]
    fn test_fifo_order_per_path() {
        let (root, writer) = setup();

        fs::write(root.path().join("cache/f"), b"one").unwrap();
        writer.enqueue(Path::new("/f"));
        writer.flush();
        assert_eq!(fs::read(root.path().join("backing/f")).unwrap(), b"one");

        fs::write(root.path().join("cache/f"), b"two").unwrap();
        writer.enqueue(Path::new("/f"));
        writer.flush();
        assert_eq!(fs::read(root.path().join("backing/f")).unwrap(), b"two");
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_root, writer) = setup();
        writer.stop();
        writer.stop();
    }

    #[test]
    fn test_flush_after_stop_returns() {
        let (root, writer) = setup();
        writer.stop();
        fs::write(root.path().join("cache/f"), b"x").unwrap();
        writer.enqueue(Path::new("/f"));
        writer.flush();
        assert!(!root.path().join("backing/f").exists());
    }
}
