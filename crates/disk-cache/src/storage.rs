//! The blob tree under a cache root.
//!
//! Layout:
//! - `<root>/<shard>/<key>/<item>`: one file per item, where `<shard>` is the
//!   first four characters of the key (or the whole key when it is shorter than
//!   five characters)
//! - `<root>/getdir-*/<key>/<item>`: per-handle export directories holding
//!   hard links handed out to callers

use crate::error::Result;
use crate::key::validate_item_name;
use crate::metadata::Entry;
use crate::util::{remove_dir_all_nofollow, remove_file_if_exists};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use time::OffsetDateTime;

pub const EXPORT_DIR_PREFIX: &str = "getdir-";

/// Directory holding the items for `key`.
pub fn folder_for_key(root: &Path, key: &str) -> PathBuf {
    let shard = match key.char_indices().nth(4) {
        Some((end, _)) => &key[..end],
        None => key,
    };
    root.join(shard).join(key)
}

fn is_export_dir_name(name: &str) -> bool {
    name.starts_with(EXPORT_DIR_PREFIX)
}

/// Reads and writes item files and exports them through a private scratch
/// directory.
#[derive(Debug)]
pub(crate) struct BlobStore {
    root: PathBuf,
    export_dir: TempDir,
}

impl BlobStore {
    pub(crate) fn new(root: &Path) -> Result<Self> {
        let export_dir = tempfile::Builder::new()
            .prefix(EXPORT_DIR_PREFIX)
            .tempdir_in(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            export_dir,
        })
    }

    pub(crate) fn export_dir(&self) -> &Path {
        self.export_dir.path()
    }

    /// Export the requested items of `key`, or every item present when
    /// `items` is empty. Missing items and directories are skipped.
    pub(crate) fn get(&self, key: &str, items: &[&str]) -> Result<BTreeMap<String, PathBuf>> {
        let folder = folder_for_key(&self.root, key);
        let names = if items.is_empty() {
            list_items(&folder)?
        } else {
            for name in items {
                validate_item_name(name)?;
            }
            items.iter().map(|name| name.to_string()).collect()
        };

        let mut exported = BTreeMap::new();
        for name in names {
            let source = folder.join(&name);
            match fs::metadata(&source) {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            let dest = self.export(key, &name, &source)?;
            exported.insert(name, dest);
        }
        Ok(exported)
    }

    /// Write `items` for `key`, accumulating the net size change in `delta`
    /// as each item lands. An empty payload deletes the item.
    ///
    /// On error, `delta` covers every item processed before the failure.
    pub(crate) fn add<K, V>(
        &self,
        key: &str,
        items: impl IntoIterator<Item = (K, V)>,
        delta: &mut i64,
    ) -> Result<BTreeMap<String, PathBuf>>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let folder = folder_for_key(&self.root, key);
        fs::create_dir_all(&folder)?;

        let mut exported = BTreeMap::new();
        for (name, data) in items {
            let name = name.as_ref();
            let data = data.as_ref();
            validate_item_name(name)?;
            let path = folder.join(name);

            let existing = match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => 0,
                Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
                Err(err) => return Err(err.into()),
            };

            // Unlink first so exports linked from the old bytes keep them.
            remove_file_if_exists(&path)?;
            *delta -= size_delta(existing);
            if data.is_empty() {
                exported.remove(name);
                continue;
            }

            fs::write(&path, data)?;
            *delta += size_delta(data.len() as u64);
            let dest = self.export(key, name, &path)?;
            exported.insert(name.to_string(), dest);
        }
        Ok(exported)
    }

    /// Delete every item of `key`. A missing folder is not an error.
    pub(crate) fn remove(&self, key: &str) -> io::Result<()> {
        let folder = folder_for_key(&self.root, key);
        remove_dir_all_nofollow(&folder)?;

        // Drop the shard directory too once it is empty.
        if let Some(shard) = folder.parent() {
            if shard != self.root {
                let _ = fs::remove_dir(shard);
            }
        }
        Ok(())
    }

    /// Delete every top-level directory except export directories.
    pub(crate) fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if is_export_dir_name(&name.to_string_lossy()) {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if file_type.is_dir() {
                remove_dir_all_nofollow(&entry.path())?;
            }
        }
        Ok(())
    }

    fn export(&self, key: &str, name: &str, source: &Path) -> io::Result<PathBuf> {
        let dir = self.export_dir.path().join(key);
        fs::create_dir_all(&dir)?;
        let dest = dir.join(name);
        match fs::hard_link(source, &dest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                remove_file_if_exists(&dest)?;
                fs::hard_link(source, &dest)?;
            }
            Err(err) => return Err(err),
        }
        Ok(dest)
    }
}

fn size_delta(len: u64) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn list_items(folder: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type().is_ok_and(|ty| ty.is_file()) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Reconstruct index entries from the blob tree: one entry per key
/// directory, sized by its item files and last used at their newest mtime.
///
/// Directories that don't sit where [`folder_for_key`] would put them are
/// ignored.
pub(crate) fn scan_entries(root: &Path) -> Result<Vec<Entry>> {
    let mut found: HashMap<String, Entry> = HashMap::new();

    let top = match fs::read_dir(root) {
        Ok(top) => top,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    for shard in top {
        let shard = shard?;
        let shard_name = shard.file_name();
        if is_export_dir_name(&shard_name.to_string_lossy()) {
            continue;
        }
        if !shard.file_type().is_ok_and(|ty| ty.is_dir()) {
            continue;
        }

        for item in walkdir::WalkDir::new(shard.path())
            .follow_links(false)
            .min_depth(1)
            .max_depth(2)
        {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    if err
                        .io_error()
                        .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound)
                    {
                        continue;
                    }
                    return Err(err.into());
                }
            };

            let (key_dir, is_item) = match item.depth() {
                1 if item.file_type().is_dir() => (item.path(), false),
                2 if item.file_type().is_file() => match item.path().parent() {
                    Some(parent) => (parent, true),
                    None => continue,
                },
                _ => continue,
            };
            let Some(key) = key_dir.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if folder_for_key(root, key) != key_dir {
                continue;
            }

            let meta = match item.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::debug!(
                        target = "disk_cache",
                        path = %item.path().display(),
                        error = %err,
                        "failed to stat cache entry while rebuilding index"
                    );
                    continue;
                }
            };
            let modified = meta
                .modified()
                .map(OffsetDateTime::from)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);

            let entry = found.entry(key.to_string()).or_insert_with(|| Entry {
                key: key.to_string(),
                size: 0,
                last_used: modified,
            });
            if is_item {
                entry.size = entry.size.saturating_add(meta.len());
                entry.last_used = entry.last_used.max(modified);
            }
        }
    }

    let mut entries: Vec<Entry> = found.into_values().collect();
    entries.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.key.cmp(&b.key)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_by_four_byte_prefix() {
        let root = Path::new("/cache");
        assert_eq!(folder_for_key(root, "abcd"), root.join("abcd/abcd"));
        assert_eq!(folder_for_key(root, "k1"), root.join("k1/k1"));
        assert_eq!(folder_for_key(root, "abcde"), root.join("abcd/abcde"));
        assert_eq!(
            folder_for_key(root, "0123456789abcdef"),
            root.join("0123/0123456789abcdef")
        );
    }

    #[test]
    fn add_tracks_delta_and_exports() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();

        let mut delta = 0;
        let exported = blobs
            .add("key1", [("a", b"1234".as_slice()), ("b", b"56".as_slice())], &mut delta)
            .unwrap();
        assert_eq!(delta, 6);
        assert_eq!(fs::read(&exported["a"]).unwrap(), b"1234");
        assert!(exported["a"].starts_with(blobs.export_dir()));

        let mut delta = 0;
        let exported = blobs
            .add("key1", [("a", b"".as_slice()), ("b", b"5678".as_slice())], &mut delta)
            .unwrap();
        assert_eq!(delta, -4 - 2 + 4);
        assert!(!exported.contains_key("a"));
        assert!(!folder_for_key(tmp.path(), "key1").join("a").exists());
    }

    #[test]
    fn rewrite_does_not_mutate_earlier_exports() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();

        let mut delta = 0;
        blobs.add("key1", [("a", "old")], &mut delta).unwrap();
        let first = blobs.get("key1", &["a"]).unwrap()["a"].clone();
        let kept = tmp.path().join("kept");
        fs::hard_link(&first, &kept).unwrap();

        blobs.add("key1", [("a", "new!")], &mut delta).unwrap();
        assert_eq!(fs::read(&kept).unwrap(), b"old");
        let second = blobs.get("key1", &["a"]).unwrap()["a"].clone();
        assert_eq!(fs::read(second).unwrap(), b"new!");
    }

    #[test]
    fn get_skips_missing_items_and_directories() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();
        let mut delta = 0;
        blobs.add("key1", [("a", "x")], &mut delta).unwrap();
        fs::create_dir(folder_for_key(tmp.path(), "key1").join("sub")).unwrap();

        let got = blobs.get("key1", &["a", "missing", "sub"]).unwrap();
        assert_eq!(got.keys().collect::<Vec<_>>(), vec!["a"]);

        let all = blobs.get("key1", &[]).unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["a"]);

        assert!(blobs.get("nokey", &[]).unwrap().is_empty());
    }

    #[test]
    fn clear_keeps_export_dirs_and_files() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();
        let mut delta = 0;
        blobs.add("key1", [("a", "x")], &mut delta).unwrap();
        fs::write(tmp.path().join("entries.json"), b"{}").unwrap();

        blobs.clear().unwrap();
        assert!(!tmp.path().join("key1").exists());
        assert!(blobs.export_dir().is_dir());
        assert!(tmp.path().join("entries.json").is_file());
    }

    #[test]
    fn scan_rebuilds_sizes_and_ignores_misplaced_dirs() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();
        let mut delta = 0;
        blobs
            .add("k1", [("1", "abcd"), ("2", "efgh")], &mut delta)
            .unwrap();
        blobs.add("longkey", [("x", "12345")], &mut delta).unwrap();
        fs::create_dir_all(tmp.path().join("zzzz/notzzzz")).unwrap();
        fs::write(tmp.path().join("zzzz/notzzzz/item"), b"ignored").unwrap();

        let mut entries = scan_entries(tmp.path()).unwrap();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let summary: Vec<_> = entries.iter().map(|e| (e.key.as_str(), e.size)).collect();
        assert_eq!(summary, vec![("k1", 8), ("longkey", 5)]);
    }

    #[test]
    fn remove_deletes_folder_and_empty_shard() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();
        let mut delta = 0;
        blobs.add("longkey", [("x", "1")], &mut delta).unwrap();

        blobs.remove("longkey").unwrap();
        assert!(!tmp.path().join("long").exists());
        blobs.remove("longkey").unwrap();
    }

    #[test]
    fn stale_export_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path()).unwrap();
        let mut delta = 0;
        blobs.add("key1", [("a", "x")], &mut delta).unwrap();

        let stale = blobs.export_dir().join("key1").join("b");
        fs::write(&stale, b"stale").unwrap();
        blobs.add("key1", [("b", "fresh")], &mut delta).unwrap();
        assert_eq!(fs::read(&stale).unwrap(), b"fresh");
    }
}
