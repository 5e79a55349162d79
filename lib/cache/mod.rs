//! Byte-bounded whole-file cache with LRU eviction and pinning.
//!
//! The cache maps logical paths to sets of versioned on-disk copies. Recency
//! is tracked across *all* copies in a single order; eviction walks that order
//! from least- to most-recently-used and skips pinned entries (those with open
//! handles), so the policy is LRU among evictable entries rather than strict
//! LRU.
//!
//! Every mutating operation serializes under one async mutex. The lock is
//! deliberately held across the origin round-trip of an `open` so that
//! concurrent opens of the same path observe a single, consistent version
//! decision; see [`Cache::lock`].

pub mod entry;

use std::path::{Path, PathBuf};

use hashlink::LinkedHashMap;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

pub use entry::{CacheEntry, EntryId, UNCOMMITTED};

/// Error thrown during construction of a [`Cache`] describing why the root
/// directory is unusable.
#[derive(Debug, Error)]
pub enum InvalidRootError {
    /// The root path exists but isn't a directory.
    #[error("cache root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The root path is a non-empty directory without our marker file, so the
    /// data in it appears to come from something other than this application.
    #[error("cache root contains foreign data: {0}")]
    ForeignData(PathBuf),

    /// An IO error occurred while preparing the root.
    #[error("io error while preparing cache root: {0}")]
    Io(#[from] std::io::Error),
}

/// Insertion or growth would exceed capacity even after evicting every
/// unpinned entry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cache capacity exhausted")]
pub struct CacheFull;

/// The whole-file cache. Cheap to share behind an `Arc`; all state lives
/// under a single mutex.
pub struct Cache {
    state: Mutex<CacheState>,
}

/// The cache's guarded state. Obtained through [`Cache::lock`]; every method
/// on this type runs under the cache-wide mutex.
pub struct CacheState {
    root: PathBuf,
    capacity: u64,
    used: u64,
    next_id: EntryId,
    entries: FxHashMap<EntryId, CacheEntry>,
    /// Recency order over entry ids: front is least recently used.
    recency: LinkedHashMap<EntryId, ()>,
    /// Logical path -> ids of every copy (readable and writer-private).
    buckets: FxHashMap<String, Vec<EntryId>>,
}

/// Marker file that identifies a directory as one of our cache roots, so a
/// restart can safely wipe leftovers instead of refusing foreign data.
const MARKER_FILE: &str = ".proxyfs_cache";

impl Cache {
    /// Prepare `root` as the cache directory and create an empty cache with
    /// the given byte `capacity`.
    ///
    /// If `root` exists it must be empty or carry the marker file from a
    /// previous run, in which case stale contents are removed.
    pub async fn new(root: &Path, capacity: u64) -> Result<Self, InvalidRootError> {
        let root = match tokio::fs::canonicalize(root).await {
            Ok(canonical) => {
                if !tokio::fs::metadata(&canonical).await?.is_dir() {
                    return Err(InvalidRootError::NotADirectory(canonical));
                }

                let mut dir = tokio::fs::read_dir(&canonical).await?;
                let is_empty = dir.next_entry().await?.is_none();
                let marker_exists = tokio::fs::try_exists(canonical.join(MARKER_FILE)).await?;
                if !(is_empty || marker_exists) {
                    return Err(InvalidRootError::ForeignData(canonical));
                }

                remove_dir_contents(&canonical).await?;
                canonical
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(root).await?;
                tokio::fs::canonicalize(root).await?
            }
            Err(e) => return Err(e.into()),
        };

        tokio::fs::write(root.join(MARKER_FILE), b"").await?;
        debug!(root = %root.display(), capacity, "cache root prepared");

        Ok(Self {
            state: Mutex::new(CacheState {
                root,
                capacity,
                used: 0,
                next_id: 0,
                entries: FxHashMap::default(),
                recency: LinkedHashMap::new(),
                buckets: FxHashMap::default(),
            }),
        })
    }

    /// Acquire the cache-wide mutex.
    ///
    /// Sessions hold the guard for a single bookkeeping call, except during
    /// `open`, which keeps it across the freshness RPC and the whole-file
    /// fetch so that the version decision for a path is serialized.
    pub async fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().await
    }
}

impl CacheState {
    /// The on-disk root every entry's `filename` is relative to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sum of sizes of all entries currently held.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Access an entry's record. Panics on a dangling id, which would be a
    /// bookkeeping bug: sessions only hold ids of pinned entries, and pinned
    /// entries are never removed.
    #[must_use]
    pub fn entry(&self, id: EntryId) -> &CacheEntry {
        self.entries
            .get(&id)
            .unwrap_or_else(|| unreachable!("dangling cache entry id {id}"))
    }

    /// Among readable copies of `path`, the one with the highest version.
    #[must_use]
    pub fn lookup_readable(&self, path: &str) -> Option<EntryId> {
        let bucket = self.buckets.get(path)?;
        bucket
            .iter()
            .copied()
            .filter(|id| self.entry(*id).readable())
            .max_by_key(|id| self.entry(*id).version())
    }

    /// Add `entry`, evicting least-recently-used unpinned entries until it
    /// fits. Fails without touching any state if the cache cannot make room.
    /// The new entry lands at the most-recently-used position.
    pub fn insert(&mut self, entry: CacheEntry) -> Result<EntryId, CacheFull> {
        let victims = self.eviction_plan(entry.size())?;
        for victim in victims {
            self.evict(victim);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.used += entry.size();
        self.recency.insert(id, ());
        self.buckets.entry(entry.path().to_owned()).or_default().push(id);
        debug!(id, path = entry.path(), filename = entry.filename(), size = entry.size(), "cache insert");
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Move an entry to the most-recently-used position.
    pub fn touch(&mut self, id: EntryId) {
        if self.recency.remove(&id).is_some() {
            self.recency.insert(id, ());
        }
    }

    pub fn incref(&mut self, id: EntryId) {
        self.entry_mut(id).incref();
    }

    pub fn decref(&mut self, id: EntryId) {
        self.entry_mut(id).decref();
    }

    /// Commit a writer-private entry under its origin-assigned version and
    /// renamed file. The rename itself is the caller's I/O; this updates the
    /// metadata so future lookups see the copy.
    pub fn mark_readable(&mut self, id: EntryId, version: i64, filename: String) {
        self.entry_mut(id).mark_readable(version, filename);
    }

    /// Remove every evictable copy of `path`. Called after a newer version is
    /// installed; copies still pinned by readers linger until their close.
    pub fn remove_stale(&mut self, path: &str) {
        let Some(bucket) = self.buckets.get(path) else {
            return;
        };
        let stale: Vec<EntryId> = bucket
            .iter()
            .copied()
            .filter(|id| self.entry(*id).is_evictable())
            .collect();
        for id in stale {
            debug!(id, path, "removing stale copy");
            self.remove(id);
        }
    }

    /// Adjust capacity accounting for an entry whose on-disk file changed
    /// size, evicting as needed. On failure the accounting (and eviction
    /// state) is left untouched.
    pub fn update_size(&mut self, id: EntryId, new_size: u64) -> Result<(), CacheFull> {
        let old_size = self.entry(id).size();
        if new_size > old_size {
            let victims = self.eviction_plan(new_size - old_size)?;
            for victim in victims {
                self.evict(victim);
            }
        }
        self.used = self.used - old_size + new_size;
        self.entry_mut(id).update_size(new_size);
        self.touch(id);
        Ok(())
    }

    /// Unlink an entry from the recency order and its bucket and delete its
    /// on-disk file. File deletion is best-effort: the in-memory entry goes
    /// away regardless so the size invariant holds.
    pub fn remove(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.recency.remove(&id);
        if let Some(bucket) = self.buckets.get_mut(entry.path()) {
            bucket.retain(|other| *other != id);
            if bucket.is_empty() {
                self.buckets.remove(entry.path());
            }
        }
        self.used -= entry.size();
        self.delete_file(entry.filename());
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut CacheEntry {
        self.entries
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("dangling cache entry id {id}"))
    }

    /// Choose the least-recently-used evictable entries whose removal makes
    /// room for `incoming` additional bytes. Returns ids in eviction order,
    /// or [`CacheFull`] if even evicting everything unpinned would not
    /// suffice. Nothing is mutated here, so a failed plan leaves the cache
    /// exactly as it was.
    fn eviction_plan(&self, incoming: u64) -> Result<Vec<EntryId>, CacheFull> {
        if self.used + incoming <= self.capacity {
            return Ok(Vec::new());
        }

        let mut victims = Vec::new();
        let mut reclaimed = 0;
        for (id, _) in &self.recency {
            let entry = self.entry(*id);
            if !entry.is_evictable() {
                continue;
            }
            victims.push(*id);
            reclaimed += entry.size();
            if self.used - reclaimed + incoming <= self.capacity {
                return Ok(victims);
            }
        }
        Err(CacheFull)
    }

    fn evict(&mut self, id: EntryId) {
        debug_assert!(self.entry(id).is_evictable(), "evicting a pinned entry");
        debug!(id, filename = self.entry(id).filename(), "evicting");
        self.remove(id);
    }

    /// Delete an entry's backing file. A file that is already gone is fine;
    /// anything else is logged and swallowed so the in-memory removal that
    /// triggered us cannot be undone halfway.
    fn delete_file(&self, filename: &str) {
        match std::fs::remove_file(self.root.join(filename)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(filename, error = %e, "failed to delete cache file");
            }
        }
    }
}

/// Remove all files and directories in the given directory, but not the
/// directory itself.
async fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}
