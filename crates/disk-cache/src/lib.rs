//! A size-bounded blob cache on local disk, shared by threads and processes.
//!
//! Callers store named items (opaque byte payloads) under a string key and get
//! them back as file paths. When the total size exceeds the configured budget
//! the least recently used keys are evicted whole.
//!
//! ## On-disk layout
//!
//! Everything lives under a single cache root:
//! - `lockfile`: exclusive advisory lock held for the duration of every
//!   operation (see [`CacheLock`])
//! - `entries.json`: the index ([`Metadata`]); rebuilt from the blob tree if it
//!   is unreadable
//! - `<shard>/<key>/<item>`: item payloads, sharded by key prefix (see
//!   [`folder_for_key`])
//! - `getdir-*/`: per-handle export directories holding the hard links
//!   returned by [`DiskCache::get`] and [`DiskCache::add`]
//!
//! Keys are usually derived from a source file with [`key_for_path`], which
//! hashes its canonical path, length and modification time.

mod cache;
mod config;
mod error;
mod eviction;
mod key;
mod lock;
mod metadata;
mod storage;
mod util;

pub use cache::DiskCache;
pub use config::{CacheConfig, CACHE_DIR_ENV, MAX_SIZE_ENV};
pub use error::{CacheError, Result};
pub use eviction::EvictionReport;
pub use key::key_for_path;
pub use lock::{CacheLock, CacheLockGuard, LOCK_FILENAME};
pub use metadata::{Entry, Metadata, ENTRIES_FILENAME};
pub use storage::{folder_for_key, EXPORT_DIR_PREFIX};
