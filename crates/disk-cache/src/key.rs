use crate::error::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

/// Compute a cache key identifying the current version of the file at `path`.
///
/// The key is the lowercase hex SHA-256 of `canonical_path NUL size NUL
/// mtime_nanos`, so it changes whenever the file is moved, resized or
/// touched. Entries cached under an older key are orphaned and later cleaned
/// up by [`DiskCache::add_path`](crate::DiskCache::add_path).
pub fn key_for_path(path: impl AsRef<Path>) -> Result<String> {
    let path = std::fs::canonicalize(path.as_ref())?;
    let meta = std::fs::metadata(&path)?;
    let modified_nanos: u128 = match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(dur) => dur.as_nanos(),
            Err(err) => {
                static REPORTED_MTIME_BEFORE_EPOCH: OnceLock<()> = OnceLock::new();
                if REPORTED_MTIME_BEFORE_EPOCH.set(()).is_ok() {
                    tracing::debug!(
                        target = "disk_cache",
                        path = %path.display(),
                        error = ?err,
                        "file mtime is before UNIX_EPOCH; using 0 for cache key"
                    );
                }
                0
            }
        },
        Err(err) => return Err(err.into()),
    };

    Ok(hash_hex(&identity_bytes(&path, meta.len(), modified_nanos)))
}

/// The raw path bytes, not a UTF-8 rendering, so names differing only in
/// non-UTF-8 bytes keep distinct keys.
fn identity_bytes(path: &Path, len: u64, modified_nanos: u128) -> Vec<u8> {
    let mut identity = path.as_os_str().as_encoded_bytes().to_vec();
    identity.push(0);
    identity.extend_from_slice(len.to_string().as_bytes());
    identity.push(0);
    identity.extend_from_slice(modified_nanos.to_string().as_bytes());
    identity
}

pub(crate) fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Keys become directory names, so they must be a single path component.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if is_valid_component(key) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
        })
    }
}

pub(crate) fn validate_item_name(name: &str) -> Result<()> {
    if is_valid_component(name) {
        Ok(())
    } else {
        Err(CacheError::InvalidItemName {
            name: name.to_string(),
        })
    }
}

fn is_valid_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
