#![allow(clippy::unwrap_used, missing_docs)]

//! Correctness tests for the cache index: capacity accounting, LRU-among-
//! evictable eviction, pinning, and stale-copy removal.

use proxyfs::cache::{Cache, CacheEntry, CacheFull, EntryId};

struct Harness {
    cache: Cache,
    _tmp: tempfile::TempDir,
}

async fn cache_with_capacity(capacity: u64) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(&tmp.path().join("cache"), capacity).await.unwrap();
    Harness { cache, _tmp: tmp }
}

impl Harness {
    /// Create the backing file and insert a readable entry for it.
    async fn insert_readable(&self, path: &str, version: i64, size: u64) -> Result<EntryId, CacheFull> {
        let mut guard = self.cache.lock().await;
        let filename = format!("{path}_v{version}");
        std::fs::write(guard.root().join(&filename), vec![0u8; size as usize]).unwrap();
        let result = guard.insert(CacheEntry::new_readable(path, filename.clone(), version, size));
        if result.is_err() {
            std::fs::remove_file(guard.root().join(&filename)).unwrap();
        }
        result
    }

    async fn decref(&self, id: EntryId) {
        self.cache.lock().await.decref(id);
    }

    async fn used(&self) -> u64 {
        self.cache.lock().await.used()
    }

    async fn holds(&self, path: &str) -> bool {
        self.cache.lock().await.lookup_readable(path).is_some()
    }

    async fn file_exists(&self, filename: &str) -> bool {
        let guard = self.cache.lock().await;
        guard.root().join(filename).exists()
    }
}

#[tokio::test]
async fn insert_accumulates_used_bytes() {
    let h = cache_with_capacity(1000).await;

    h.insert_readable("f1", 1, 300).await.unwrap();
    h.insert_readable("f2", 1, 300).await.unwrap();

    assert_eq!(h.used().await, 600);
}

#[tokio::test]
async fn used_bytes_never_exceed_capacity() {
    let h = cache_with_capacity(1000).await;

    for i in 0..8 {
        let id = h.insert_readable(&format!("f{i}"), 1, 300).await.unwrap();
        h.decref(id).await;
        assert!(h.used().await <= 1000, "used {} after insert {i}", h.used().await);
    }
}

#[tokio::test]
async fn eviction_takes_the_least_recently_used_first() {
    let h = cache_with_capacity(1000).await;

    for name in ["f1", "f2", "f3"] {
        let id = h.insert_readable(name, 1, 300).await.unwrap();
        h.decref(id).await;
    }

    // 900 used; 300 more forces out exactly the oldest.
    let id = h.insert_readable("f4", 1, 300).await.unwrap();
    h.decref(id).await;

    assert!(!h.holds("f1").await, "f1 was least recently used");
    assert!(h.holds("f2").await);
    assert!(h.holds("f3").await);
    assert!(h.holds("f4").await);
    assert!(!h.file_exists("f1_v1").await, "evicted copy must leave the disk");
}

#[tokio::test]
async fn pinned_entries_are_skipped_by_eviction() {
    let h = cache_with_capacity(1000).await;

    for name in ["f2", "f3", "f4"] {
        let id = h.insert_readable(name, 1, 300).await.unwrap();
        h.decref(id).await;
    }

    // Re-open f2: it becomes pinned and most recently used.
    let f2 = {
        let mut guard = h.cache.lock().await;
        let id = guard.lookup_readable("f2").unwrap();
        guard.incref(id);
        guard.touch(id);
        id
    };

    // f3 is now the LRU evictable entry; f2 is older than f4 but pinned.
    h.insert_readable("f5", 1, 300).await.unwrap();
    assert!(h.holds("f2").await, "pinned entry must survive");
    assert!(!h.holds("f3").await, "eviction falls to the next unpinned entry");

    h.decref(f2).await;
}

#[tokio::test]
async fn insert_fails_when_only_pinned_entries_remain() {
    let h = cache_with_capacity(500).await;

    // Pinned from birth; never decref'd.
    h.insert_readable("f1", 1, 400).await.unwrap();

    let err = h.insert_readable("f2", 1, 400).await.expect_err("no room");
    assert_eq!(err, CacheFull);

    // The failed insert must leave accounting untouched.
    assert_eq!(h.used().await, 400);
    assert!(h.holds("f1").await);
}

#[tokio::test]
async fn insert_larger_than_capacity_fails_cleanly() {
    let h = cache_with_capacity(100).await;

    let err = h.insert_readable("huge", 1, 5000).await.expect_err("cannot fit");
    assert_eq!(err, CacheFull);
    assert_eq!(h.used().await, 0);
}

#[tokio::test]
async fn lookup_prefers_the_highest_readable_version() {
    let h = cache_with_capacity(10_000).await;

    let v1 = h.insert_readable("f", 1, 10).await.unwrap();
    let v3 = h.insert_readable("f", 3, 10).await.unwrap();
    let v2 = h.insert_readable("f", 2, 10).await.unwrap();

    let guard = h.cache.lock().await;
    let best = guard.lookup_readable("f").unwrap();
    assert_eq!(best, v3);
    assert_eq!(guard.entry(best).version(), 3);
    drop(guard);

    let _ = (v1, v2);
}

#[tokio::test]
async fn writer_private_copies_are_invisible_to_lookup() {
    let h = cache_with_capacity(10_000).await;

    {
        let mut guard = h.cache.lock().await;
        std::fs::write(guard.root().join("f_v1_write_0"), b"x").unwrap();
        guard
            .insert(CacheEntry::new_writer("f", "f_v1_write_0", 1))
            .unwrap();
    }

    assert!(!h.holds("f").await, "uncommitted copies must not be served");
}

#[tokio::test]
async fn remove_stale_spares_pinned_copies() {
    let h = cache_with_capacity(10_000).await;

    // v1 stays pinned (a reader holds it); v2 is unpinned.
    let v1 = h.insert_readable("f", 1, 10).await.unwrap();
    let v2 = h.insert_readable("f", 2, 10).await.unwrap();
    h.decref(v2).await;

    {
        let mut guard = h.cache.lock().await;
        guard.remove_stale("f");
    }

    let guard = h.cache.lock().await;
    assert_eq!(
        guard.lookup_readable("f"),
        Some(v1),
        "only the pinned copy remains"
    );
    drop(guard);
    assert!(!h.file_exists("f_v2").await);
}

#[tokio::test]
async fn update_size_evicts_to_make_room() {
    let h = cache_with_capacity(1000).await;

    let victim = h.insert_readable("old", 1, 600).await.unwrap();
    h.decref(victim).await;
    let growing = h.insert_readable("grow", 1, 300).await.unwrap();

    {
        let mut guard = h.cache.lock().await;
        guard.update_size(growing, 900).unwrap();
    }

    assert!(!h.holds("old").await, "growth must evict the idle entry");
    assert_eq!(h.used().await, 900);
}

#[tokio::test]
async fn infeasible_update_size_changes_nothing() {
    let h = cache_with_capacity(1000).await;

    // Both pinned: nothing can be evicted.
    let a = h.insert_readable("a", 1, 400).await.unwrap();
    let b = h.insert_readable("b", 1, 400).await.unwrap();

    {
        let mut guard = h.cache.lock().await;
        let err = guard.update_size(a, 900).expect_err("cannot fit");
        assert_eq!(err, CacheFull);
        assert_eq!(guard.entry(a).size(), 400, "size must be unchanged");
        assert_eq!(guard.used(), 800, "accounting must be unchanged");
    }

    let _ = b;
}

#[tokio::test]
async fn remove_deletes_the_backing_file() {
    let h = cache_with_capacity(1000).await;

    let id = h.insert_readable("f", 1, 100).await.unwrap();
    assert!(h.file_exists("f_v1").await);

    {
        let mut guard = h.cache.lock().await;
        guard.decref(id);
        guard.remove(id);
    }

    assert!(!h.file_exists("f_v1").await);
    assert_eq!(h.used().await, 0);
}

#[tokio::test]
async fn foreign_cache_directory_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("foreign.txt"), b"data").unwrap();

    let result = Cache::new(tmp.path(), 1000).await;
    assert!(result.is_err(), "must refuse a non-empty unmarked directory");
}

#[tokio::test]
async fn marked_cache_directory_is_wiped_and_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("cache");

    {
        let _cache = Cache::new(&root, 1000).await.unwrap();
        std::fs::write(root.join("leftover_v1"), b"stale").unwrap();
    }

    let _cache = Cache::new(&root, 1000).await.unwrap();
    assert!(!root.join("leftover_v1").exists(), "stale copies are wiped on restart");
}
