use crate::error::Result;
use fs2::FileExt as _;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Lock file name inside a cache root.
pub const LOCK_FILENAME: &str = "lockfile";

/// A filesystem-backed lock that is safe to share across multiple processes.
///
/// The lockfile is opened once and kept for the lifetime of the lock; every
/// call to [`CacheLock::acquire`] only locks and unlocks it.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    // Serializes in-process callers (across every handle on the same root)
    // before anyone attempts the OS-level lock.
    process_lock: &'static Mutex<()>,
}

/// Held for the duration of one cache operation. Dropping it releases the file
/// lock first, then the in-process mutex.
#[derive(Debug)]
pub struct CacheLockGuard<'a> {
    file: &'a File,
    _guard: MutexGuard<'static, ()>,
}

impl CacheLock {
    /// Open (creating if needed) the lockfile at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        // Key the process-wide mutex on the canonical path so differently spelled
        // roots still share it.
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            file,
            process_lock: process_lock_for_path(&canonical),
            path: canonical,
        })
    }

    /// Acquire the lock, blocking until both the in-process mutex and the
    /// exclusive file lock are held.
    pub fn acquire(&self) -> Result<CacheLockGuard<'_>> {
        let guard = self
            .process_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.file.lock_exclusive()?;
        Ok(CacheLockGuard {
            file: &self.file,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::debug!(
                target = "disk_cache",
                error = %err,
                "failed to unlock cache lockfile"
            );
        }
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}
