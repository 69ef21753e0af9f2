use disk_cache::DiskCache;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

#[test]
fn concurrent_handles_do_not_lose_entries() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let threads = 8;
    let keys_per_thread = 4;
    let mut handles = Vec::with_capacity(threads);
    for t in 0..threads {
        let root = root.clone();
        handles.push(thread::spawn(move || {
            let cache = DiskCache::open(&root, 0).unwrap();
            let mut written = 0u64;
            for k in 0..keys_per_thread {
                let payload = vec![b'x'; t + k + 1];
                written += payload.len() as u64;
                cache.add(&format!("t{t}-k{k}"), [("data", payload)]).unwrap();
            }
            written
        }));
    }

    let expected_total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let cache = DiskCache::open(&root, 0).unwrap();
    assert_eq!(cache.len().unwrap(), threads * keys_per_thread);
    assert_eq!(cache.total_size().unwrap(), expected_total);
    for t in 0..threads {
        for k in 0..keys_per_thread {
            let key = format!("t{t}-k{k}");
            let got = cache.get(&key, &["data"]).unwrap();
            assert_eq!(std::fs::read(&got["data"]).unwrap().len(), t + k + 1);
        }
    }
}

#[test]
fn shared_handle_serializes_writers_to_one_key() {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(DiskCache::open(tmp.path(), 0).unwrap());

    let threads = 16;
    let mut handles = Vec::with_capacity(threads);
    for t in 0..threads {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            cache
                .add("shared", [(format!("item{t}"), vec![b'y'; 3])])
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.keys().unwrap(), vec!["shared"]);
    assert_eq!(cache.entry_size("shared").unwrap(), Some(3 * threads as u64));
    assert_eq!(cache.get("shared", &[]).unwrap().len(), threads);
}

#[test]
fn concurrent_eviction_respects_budget() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let budget = 100;

    let mut handles = Vec::new();
    for t in 0..4 {
        let root = root.clone();
        handles.push(thread::spawn(move || {
            let cache = DiskCache::open(&root, budget).unwrap();
            for k in 0..10 {
                cache.add(&format!("t{t}-k{k}"), [("data", vec![0u8; 10])]).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = DiskCache::open(&root, budget).unwrap();
    assert!(cache.total_size().unwrap() <= budget as u64);
    assert_eq!(cache.len().unwrap(), 10);
    let sum: u64 = cache.entries().unwrap().iter().map(|entry| entry.size).sum();
    assert_eq!(cache.total_size().unwrap(), sum);
}
