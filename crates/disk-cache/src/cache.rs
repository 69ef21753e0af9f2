use crate::config::CacheConfig;
use crate::error::Result;
use crate::eviction::{prune, EvictionReport};
use crate::key::{key_for_path, validate_key};
use crate::lock::{CacheLock, LOCK_FILENAME};
use crate::metadata::{Entry, MetadataStore};
use crate::storage::BlobStore;
use crate::util::create_private_dir_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A size-bounded blob cache rooted at a directory and shared between
/// processes.
///
/// Every operation takes the cache lock (an in-process mutex plus an exclusive
/// lock on `<root>/lockfile`), re-reads `entries.json` if another handle has
/// changed it, does its work, writes the index back if it changed and
/// releases the lock.
///
/// Paths returned by [`get`](Self::get) and [`add`](Self::add) are hard links
/// in a scratch directory private to this handle. They keep their contents
/// even if the entry is later rewritten or evicted, and are deleted when the
/// handle is dropped.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    max_size: i64,
    lock: CacheLock,
    blobs: BlobStore,
    state: Mutex<MetadataStore>,
}

impl DiskCache {
    /// Open (creating if needed) the cache at `path`. `max_size` is the size
    /// budget in bytes; values below 1 disable eviction.
    ///
    /// Opening loads or rebuilds the index and evicts entries if the cache is
    /// over budget.
    pub fn open(path: impl AsRef<Path>, max_size: i64) -> Result<Self> {
        let path = path.as_ref();
        create_private_dir_all(path)?;
        let root = std::fs::canonicalize(path)?;

        let lock = CacheLock::open(&root.join(LOCK_FILENAME))?;
        let blobs = BlobStore::new(&root)?;
        let cache = Self {
            state: Mutex::new(MetadataStore::new(&root)),
            root,
            max_size,
            lock,
            blobs,
        };

        let entries = cache.with_entries(|store| {
            cache.prune(store);
            Ok(store.len())
        })?;
        tracing::debug!(
            target = "disk_cache",
            root = %cache.root.display(),
            lockfile = %cache.lock.path().display(),
            max_size,
            entries,
            "opened disk cache"
        );
        Ok(cache)
    }

    /// Open the cache described by `config`.
    pub fn open_with_config(config: &CacheConfig) -> Result<Self> {
        Self::open(config.cache_root()?, config.max_size)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    /// The private directory that exported item paths live in.
    pub fn export_dir(&self) -> &Path {
        self.blobs.export_dir()
    }

    /// Export the named items of `key`, or all of its items if `items` is
    /// empty.
    ///
    /// Items that don't exist are left out of the result; an unknown key
    /// yields an empty map. Finding at least one item marks the entry as most
    /// recently used.
    pub fn get(&self, key: &str, items: &[&str]) -> Result<BTreeMap<String, PathBuf>> {
        validate_key(key)?;
        self.with_entries(|store| {
            let exported = self.blobs.get(key, items)?;
            if !exported.is_empty() {
                store.touch(key);
            }
            Ok(exported)
        })
    }

    /// Like [`get`](Self::get), keyed by [`key_for_path`]. Returns the derived
    /// key alongside the exported items.
    pub fn get_path(
        &self,
        path: impl AsRef<Path>,
        items: &[&str],
    ) -> Result<(String, BTreeMap<String, PathBuf>)> {
        let key = key_for_path(path)?;
        let exported = self.get(&key, items)?;
        Ok((key, exported))
    }

    /// Store `items` under `key`, creating the entry if needed. An empty
    /// payload deletes that item. Returns export paths for the written items.
    ///
    /// Items are written one at a time. If one fails, the ones before it stay
    /// written and accounted for, and the error is returned.
    pub fn add<K, V>(
        &self,
        key: &str,
        items: impl IntoIterator<Item = (K, V)>,
    ) -> Result<BTreeMap<String, PathBuf>>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        validate_key(key)?;
        self.with_entries(|store| self.add_locked(store, key, items))
    }

    /// Store `items` under `key` on behalf of the source file at `path`.
    ///
    /// If `path` was previously cached under a different key (the file has
    /// changed since), that older entry is removed first.
    pub fn add_path<K, V>(
        &self,
        path: impl AsRef<Path>,
        key: &str,
        items: impl IntoIterator<Item = (K, V)>,
    ) -> Result<BTreeMap<String, PathBuf>>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        validate_key(key)?;
        let source = source_path(path.as_ref())?;
        self.with_entries(|store| {
            if let Some(previous) = store.key_for_source(&source).map(str::to_owned) {
                if previous != key {
                    tracing::debug!(
                        target = "disk_cache",
                        previous_key = %previous,
                        key,
                        "source file changed; removing stale cache entry"
                    );
                    self.remove_locked(store, &previous)?;
                }
            }
            let exported = self.add_locked(store, key, items)?;
            store.set_key_for_source(source, key);
            Ok(exported)
        })
    }

    /// Delete `key` and all of its items. Unknown keys are a no-op.
    pub fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.with_entries(|store| self.remove_locked(store, key))
    }

    /// Delete every entry.
    pub fn clear(&self) -> Result<()> {
        self.with_entries(|store| match self.blobs.clear() {
            Ok(()) => {
                store.clear();
                Ok(())
            }
            Err(err) => {
                // Some folders may survive; make the index match what's left.
                store.rebuild()?;
                Err(err)
            }
        })
    }

    /// All keys, least recently used first.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.with_entries(|store| Ok(store.keys()))
    }

    /// A snapshot of every entry, least recently used first.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.with_entries(|store| Ok(store.metadata().sorted_entries.clone()))
    }

    pub fn total_size(&self) -> Result<u64> {
        self.with_entries(|store| Ok(store.total_size()))
    }

    pub fn entry_size(&self, key: &str) -> Result<Option<u64>> {
        self.with_entries(|store| Ok(store.get(key).map(|entry| entry.size)))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.with_entries(|store| Ok(store.contains(key)))
    }

    pub fn len(&self) -> Result<usize> {
        self.with_entries(|store| Ok(store.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reload the index if another handle has changed it since this handle
    /// last looked.
    pub fn ensure_entries(&self) -> Result<()> {
        self.with_entries(|_| Ok(()))
    }

    /// Evict least recently used entries until the cache fits its budget.
    pub fn evict(&self) -> Result<EvictionReport> {
        self.with_entries(|store| Ok(self.prune(store)))
    }

    fn with_entries<T>(&self, op: impl FnOnce(&mut MetadataStore) -> Result<T>) -> Result<T> {
        let _guard = self.lock.acquire()?;
        let mut store = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        store.ensure_entries()?;

        let result = op(&mut store);
        // Persist whatever was accounted for, even if `op` failed part way.
        let written = store.write_entries_if_dirty();
        let value = result?;
        written?;
        Ok(value)
    }

    fn add_locked<K, V>(
        &self,
        store: &mut MetadataStore,
        key: &str,
        items: impl IntoIterator<Item = (K, V)>,
    ) -> Result<BTreeMap<String, PathBuf>>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let mut delta = 0i64;
        let result = self.blobs.add(key, items, &mut delta);
        if result.is_ok() || delta != 0 || store.contains(key) {
            self.update_accounting(store, key, delta);
        }
        result
    }

    fn remove_locked(&self, store: &mut MetadataStore, key: &str) -> Result<()> {
        self.blobs.remove(key)?;
        store.remove_entry(key);
        Ok(())
    }

    fn update_accounting(&self, store: &mut MetadataStore, key: &str, delta: i64) {
        store.update_accounting(key, delta);
        if delta > 0 {
            self.prune(store);
        }
    }

    fn prune(&self, store: &mut MetadataStore) -> EvictionReport {
        prune(store, &self.blobs, self.max_size)
    }
}

/// Absolute form of `path` used as the `PathMap` key.
fn source_path(path: &Path) -> Result<String> {
    let absolute = match std::fs::canonicalize(path) {
        Ok(path) => path,
        Err(_) => std::path::absolute(path)?,
    };
    Ok(absolute.to_string_lossy().into_owned())
}
