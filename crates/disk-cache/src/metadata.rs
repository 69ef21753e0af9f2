use crate::error::Result;
use crate::storage;
use crate::util::atomic_write_with;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::OffsetDateTime;

pub const ENTRIES_FILENAME: &str = "entries.json";

/// Metadata for one cached key: the combined size of its items and the last
/// time it was read or written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    pub key: String,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
}

/// The persisted index, stored as `entries.json` in the cache root.
///
/// `sorted_entries` is kept in LRU order: the front is the next eviction
/// candidate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sorted_entries: Vec<Entry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub path_map: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Metadata {
    fn entries_sum(&self) -> u64 {
        self.sorted_entries
            .iter()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.size))
    }

    /// Fix up an index loaded from disk so the in-memory invariants hold.
    ///
    /// Returns `true` if anything changed.
    fn repair(&mut self) -> bool {
        let mut changed = false;

        // Duplicate keys: the last occurrence is the most recent one.
        let mut seen = HashSet::new();
        let before = self.sorted_entries.len();
        let mut deduped: Vec<Entry> = self
            .sorted_entries
            .drain(..)
            .rev()
            .filter(|entry| seen.insert(entry.key.clone()))
            .collect();
        deduped.reverse();
        changed |= deduped.len() != before;
        self.sorted_entries = deduped;

        if !self
            .sorted_entries
            .windows(2)
            .all(|pair| pair[0].last_used <= pair[1].last_used)
        {
            self.sorted_entries.sort_by_key(|entry| entry.last_used);
            changed = true;
        }

        let sum = self.entries_sum();
        if self.total_size != sum {
            self.total_size = sum;
            changed = true;
        }

        let keys: HashSet<&str> = self
            .sorted_entries
            .iter()
            .map(|entry| entry.key.as_str())
            .collect();
        let path_count = self.path_map.len();
        self.path_map.retain(|_, key| keys.contains(key.as_str()));
        changed |= self.path_map.len() != path_count;

        changed
    }
}

/// The parts of `entries.json`'s stat that change on every rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileState {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

impl FileState {
    fn read(path: &Path) -> Result<Option<Self>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            meta.ino()
        };
        #[cfg(not(unix))]
        let inode = 0;

        Ok(Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            inode,
        }))
    }
}

/// In-memory view of the entries index with dirty tracking and external
/// change detection.
///
/// All methods must be called with the cache lock held.
#[derive(Debug)]
pub(crate) struct MetadataStore {
    root: PathBuf,
    entries_path: PathBuf,
    metadata: Metadata,
    index: HashMap<String, usize>,
    loaded: bool,
    last_state: Option<FileState>,
    dirty: bool,
}

impl MetadataStore {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            entries_path: root.join(ENTRIES_FILENAME),
            metadata: Metadata::default(),
            index: HashMap::new(),
            loaded: false,
            last_state: None,
            dirty: false,
        }
    }

    /// Make sure the in-memory index reflects `entries.json`, re-reading it if
    /// this is the first access or another handle has rewritten it since.
    pub(crate) fn ensure_entries(&mut self) -> Result<()> {
        let current = FileState::read(&self.entries_path)?;
        if self.loaded && current == self.last_state {
            return Ok(());
        }

        let Some(state) = current else {
            self.metadata = Metadata::default();
            self.reindex();
            self.last_state = None;
            self.loaded = true;
            return Ok(());
        };

        let bytes = match std::fs::read(&self.entries_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.metadata = Metadata::default();
                self.reindex();
                self.last_state = None;
                self.loaded = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<Metadata>(&bytes) {
            Ok(mut metadata) => {
                if metadata.repair() {
                    tracing::debug!(
                        target = "disk_cache",
                        path = %self.entries_path.display(),
                        "repaired inconsistent cache index"
                    );
                    self.dirty = true;
                }
                self.metadata = metadata;
                self.reindex();
                self.last_state = Some(state);
                self.loaded = true;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    target = "disk_cache",
                    path = %self.entries_path.display(),
                    error = %crate::CacheError::from(err),
                    "cache index is corrupt; rebuilding from cache directory"
                );
                self.rebuild()
            }
        }
    }

    /// Regenerate the index by scanning the cache directory and write it out
    /// immediately. Path associations are lost.
    pub(crate) fn rebuild(&mut self) -> Result<()> {
        let mut entries = storage::scan_entries(&self.root)?;
        entries.sort_by_key(|entry| entry.last_used);

        let mut metadata = Metadata {
            total_size: 0,
            sorted_entries: entries,
            path_map: BTreeMap::new(),
        };
        metadata.total_size = metadata.entries_sum();

        self.metadata = metadata;
        self.reindex();
        self.loaded = true;
        self.dirty = true;
        self.write_entries_if_dirty()
    }

    pub(crate) fn write_entries_if_dirty(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let metadata = &self.metadata;
        atomic_write_with(&self.entries_path, |file| {
            let mut writer = std::io::BufWriter::new(file);
            serde_json::to_writer(&mut writer, metadata)?;
            writer.flush()?;
            Ok(())
        })?;

        self.dirty = false;
        self.last_state = FileState::read(&self.entries_path)?;
        Ok(())
    }

    pub(crate) fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.metadata.total_size
    }

    pub(crate) fn len(&self) -> usize {
        self.metadata.sorted_entries.len()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Entry> {
        self.index
            .get(key)
            .map(|&pos| &self.metadata.sorted_entries[pos])
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.metadata
            .sorted_entries
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub(crate) fn key_for_source(&self, source: &str) -> Option<&str> {
        self.metadata.path_map.get(source).map(String::as_str)
    }

    /// Associate `source` with `key`. The key must already be indexed.
    pub(crate) fn set_key_for_source(&mut self, source: String, key: &str) {
        if !self.contains(key) {
            return;
        }
        if self.key_for_source(&source) != Some(key) {
            self.metadata.path_map.insert(source, key.to_string());
            self.dirty = true;
        }
    }

    /// Apply a size delta to `key` and mark it most recently used, creating
    /// the entry if it does not exist yet.
    pub(crate) fn update_accounting(&mut self, key: &str, delta: i64) {
        let now = self.next_timestamp();
        let size = match self.take(key) {
            Some(entry) => {
                self.metadata.total_size = self.metadata.total_size.saturating_sub(entry.size);
                apply_delta(entry.size, delta)
            }
            None => apply_delta(0, delta),
        };

        self.metadata.total_size = self.metadata.total_size.saturating_add(size);
        self.index
            .insert(key.to_string(), self.metadata.sorted_entries.len());
        self.metadata.sorted_entries.push(Entry {
            key: key.to_string(),
            size,
            last_used: now,
        });
        self.dirty = true;
    }

    /// Mark `key` most recently used without changing its size. Returns
    /// `false` if the key is not indexed.
    pub(crate) fn touch(&mut self, key: &str) -> bool {
        if !self.contains(key) {
            return false;
        }
        self.update_accounting(key, 0);
        true
    }

    /// Drop `key` from the index and from every path association.
    pub(crate) fn remove_entry(&mut self, key: &str) -> Option<Entry> {
        let entry = self.take(key)?;
        self.metadata.total_size = self.metadata.total_size.saturating_sub(entry.size);
        self.metadata.path_map.retain(|_, mapped| mapped != key);
        self.dirty = true;
        Some(entry)
    }

    /// The least recently used entry, if any.
    pub(crate) fn oldest(&self) -> Option<&Entry> {
        self.metadata.sorted_entries.first()
    }

    pub(crate) fn clear(&mut self) {
        self.metadata = Metadata::default();
        self.index.clear();
        self.dirty = true;
    }

    fn take(&mut self, key: &str) -> Option<Entry> {
        let pos = self.index.remove(key)?;
        let entry = self.metadata.sorted_entries.remove(pos);
        for moved in &self.metadata.sorted_entries[pos..] {
            if let Some(slot) = self.index.get_mut(&moved.key) {
                *slot -= 1;
            }
        }
        Some(entry)
    }

    fn reindex(&mut self) {
        self.index = self
            .metadata
            .sorted_entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (entry.key.clone(), pos))
            .collect();
    }

    // Never go backwards, even if the wall clock does.
    fn next_timestamp(&self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        match self.metadata.sorted_entries.last() {
            Some(last) if last.last_used > now => last.last_used,
            _ => now,
        }
    }
}

fn apply_delta(size: u64, delta: i64) -> u64 {
    if delta >= 0 {
        size.saturating_add(delta.unsigned_abs())
    } else {
        size.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::Duration;

    fn entry(key: &str, size: u64, secs: i64) -> Entry {
        Entry {
            key: key.to_string(),
            size,
            last_used: OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs),
        }
    }

    #[test]
    fn serializes_with_pascal_case_fields() {
        let mut metadata = Metadata {
            total_size: 3,
            sorted_entries: vec![entry("k1", 3, 1)],
            path_map: BTreeMap::new(),
        };
        metadata
            .path_map
            .insert("/tmp/a".to_string(), "k1".to_string());

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["TotalSize"], 3);
        assert_eq!(value["SortedEntries"][0]["Key"], "k1");
        assert_eq!(value["SortedEntries"][0]["Size"], 3);
        assert_eq!(
            value["SortedEntries"][0]["LastUsed"],
            "1970-01-01T00:00:01Z"
        );
        assert_eq!(value["PathMap"]["/tmp/a"], "k1");
    }

    #[test]
    fn null_collections_deserialize_as_empty() {
        let metadata: Metadata =
            serde_json::from_str(r#"{"TotalSize":0,"SortedEntries":null,"PathMap":null}"#)
                .unwrap();
        assert_eq!(metadata, Metadata::default());
    }

    #[test]
    fn repair_fixes_totals_order_duplicates_and_dangling_paths() {
        let mut metadata = Metadata {
            total_size: 999,
            sorted_entries: vec![entry("b", 2, 5), entry("a", 1, 1), entry("b", 4, 9)],
            path_map: BTreeMap::from([
                ("/x".to_string(), "a".to_string()),
                ("/y".to_string(), "gone".to_string()),
            ]),
        };

        assert!(metadata.repair());
        assert_eq!(
            metadata.sorted_entries,
            vec![entry("a", 1, 1), entry("b", 4, 9)]
        );
        assert_eq!(metadata.total_size, 5);
        assert_eq!(metadata.path_map.len(), 1);
        assert!(!metadata.repair());
    }

    #[test]
    fn accounting_keeps_total_and_order() {
        let tmp = TempDir::new().unwrap();
        let mut store = MetadataStore::new(tmp.path());
        store.ensure_entries().unwrap();

        store.update_accounting("a", 10);
        store.update_accounting("b", 5);
        store.update_accounting("a", -4);
        assert_eq!(store.keys(), vec!["b", "a"]);
        assert_eq!(store.get("a").unwrap().size, 6);
        assert_eq!(store.total_size(), 11);

        store.update_accounting("b", -100);
        assert_eq!(store.get("b").unwrap().size, 0);
        assert_eq!(store.total_size(), 6);

        assert!(store.touch("a"));
        assert!(!store.touch("missing"));
        assert_eq!(store.keys(), vec!["b", "a"]);

        let removed = store.remove_entry("b").unwrap();
        assert_eq!(removed.size, 0);
        assert_eq!(store.keys(), vec!["a"]);
        assert_eq!(store.get("a").unwrap().key, "a");
        assert_eq!(store.total_size(), 6);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let tmp = TempDir::new().unwrap();
        let mut store = MetadataStore::new(tmp.path());
        store.ensure_entries().unwrap();
        store.metadata.sorted_entries.push(Entry {
            key: "future".to_string(),
            size: 0,
            last_used: OffsetDateTime::now_utc() + Duration::days(1),
        });
        store.reindex();

        store.update_accounting("now", 1);
        let entries = &store.metadata().sorted_entries;
        assert!(entries[0].last_used <= entries[1].last_used);
    }

    #[test]
    fn remove_entry_drops_path_associations() {
        let tmp = TempDir::new().unwrap();
        let mut store = MetadataStore::new(tmp.path());
        store.ensure_entries().unwrap();
        store.update_accounting("k", 1);
        store.set_key_for_source("/src/file".to_string(), "k");
        store.set_key_for_source("/src/unknown".to_string(), "nope");
        assert_eq!(store.key_for_source("/src/file"), Some("k"));
        assert_eq!(store.key_for_source("/src/unknown"), None);

        store.remove_entry("k");
        assert_eq!(store.key_for_source("/src/file"), None);
    }

    #[test]
    fn write_then_reload_in_second_store() {
        let tmp = TempDir::new().unwrap();
        let mut a = MetadataStore::new(tmp.path());
        let mut b = MetadataStore::new(tmp.path());
        a.ensure_entries().unwrap();
        b.ensure_entries().unwrap();
        assert_eq!(b.len(), 0);

        a.update_accounting("k1", 8);
        a.write_entries_if_dirty().unwrap();

        b.ensure_entries().unwrap();
        assert_eq!(b.keys(), vec!["k1"]);
        assert_eq!(b.total_size(), 8);
    }

    #[test]
    fn clean_store_does_not_write() {
        let tmp = TempDir::new().unwrap();
        let mut store = MetadataStore::new(tmp.path());
        store.ensure_entries().unwrap();
        store.write_entries_if_dirty().unwrap();
        assert!(!tmp.path().join(ENTRIES_FILENAME).exists());
    }

    #[test]
    fn deleted_index_resets_to_empty() {
        let tmp = TempDir::new().unwrap();
        let mut store = MetadataStore::new(tmp.path());
        store.ensure_entries().unwrap();
        store.update_accounting("k1", 8);
        store.write_entries_if_dirty().unwrap();

        std::fs::remove_file(tmp.path().join(ENTRIES_FILENAME)).unwrap();
        store.ensure_entries().unwrap();
        assert_eq!(store.len(), 0);
        assert_eq!(store.total_size(), 0);
    }
}
