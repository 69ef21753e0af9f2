use crate::metadata::MetadataStore;
use crate::storage::BlobStore;
use serde::Serialize;

/// Result summary from an eviction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Evicted keys, least recently used first.
    pub evicted: Vec<String>,
    /// Sum of the evicted entries' recorded sizes.
    pub freed_bytes: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

/// Evict least-recently-used entries until the total size fits `max_size`.
///
/// Entries are removed whole. `max_size < 1` means unbounded. An entry whose
/// folder can't be deleted is still dropped from the index so the pass always
/// terminates; the next rebuild will pick the folder up again.
pub(crate) fn prune(store: &mut MetadataStore, blobs: &BlobStore, max_size: i64) -> EvictionReport {
    let mut report = EvictionReport::default();
    let Ok(budget) = u64::try_from(max_size) else {
        return report;
    };
    if budget == 0 {
        return report;
    }

    let before = store.total_size();
    while store.total_size() > budget {
        let Some(key) = store.oldest().map(|entry| entry.key.clone()) else {
            break;
        };

        if let Err(err) = blobs.remove(&key) {
            tracing::debug!(
                target = "disk_cache",
                key = %key,
                error = %err,
                "failed to delete evicted cache entry folder"
            );
        }
        if let Some(entry) = store.remove_entry(&key) {
            report.freed_bytes = report.freed_bytes.saturating_add(entry.size);
        }
        report.evicted.push(key);
    }

    if !report.is_empty() {
        tracing::debug!(
            target = "disk_cache",
            before_bytes = before,
            after_bytes = store.total_size(),
            max_bytes = budget,
            evicted = report.evicted.len(),
            "evicted least recently used cache entries"
        );
    }
    report
}
