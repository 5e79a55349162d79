//! Per-copy cache entry records.
//!
//! A [`CacheEntry`] describes one on-disk copy of one logical path. Committed
//! copies carry the version the origin assigned them and are visible to every
//! future opener; writer-private copies carry the `-1` sentinel version and
//! stay invisible until the owning session's close commits them.

/// Sentinel version for a copy that has not been committed to the origin yet.
pub const UNCOMMITTED: i64 = -1;

/// Identifier of a cache entry within its [`Cache`](super::Cache).
///
/// The recency list and the per-path buckets refer to entries through these
/// ids rather than owning references; the list is inherently cyclic and ids
/// sidestep that.
pub type EntryId = u64;

/// Synthesize the on-disk name for a committed copy of `path` at `version`.
#[must_use]
pub fn version_filename(path: &str, version: i64) -> String {
    format!("{path}_v{version}")
}

/// Synthesize the on-disk name for a writer-private copy derived from the
/// committed copy named `base`, owned by handle `handle`.
#[must_use]
pub fn writer_filename(base: &str, handle: u64) -> String {
    format!("{base}_write_{handle}")
}

/// Metadata for a single on-disk copy of a logical path.
#[derive(Debug)]
pub struct CacheEntry {
    path: String,
    filename: String,
    version: i64,
    size: u64,
    refcount: u32,
    readable: bool,
}

impl CacheEntry {
    /// A committed, readable copy. Born pinned (`refcount == 1`) because the
    /// opener that materialized it holds it.
    #[must_use]
    pub fn new_readable(path: impl Into<String>, filename: impl Into<String>, version: i64, size: u64) -> Self {
        Self {
            path: path.into(),
            filename: filename.into(),
            version,
            size,
            refcount: 1,
            readable: true,
        }
    }

    /// A writer-private copy created by copy-on-write. Invisible to other
    /// sessions until [`mark_readable`](Self::mark_readable).
    #[must_use]
    pub fn new_writer(path: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            filename: filename.into(),
            version: UNCOMMITTED,
            size,
            refcount: 1,
            readable: false,
        }
    }

    /// The logical path this copy belongs to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The on-disk file name, relative to the cache root.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The origin-assigned version, or [`UNCOMMITTED`].
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Current byte length of the on-disk copy.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of open handles currently using this copy.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Whether future openers may see this copy.
    #[must_use]
    pub fn readable(&self) -> bool {
        self.readable
    }

    /// An entry with no open handles may be evicted.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.refcount == 0
    }

    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    pub fn decref(&mut self) {
        debug_assert!(self.refcount > 0, "decref below zero on {}", self.filename);
        self.refcount = self.refcount.saturating_sub(1);
    }

    /// Commit a writer-private copy: adopt the origin-assigned `version`, take
    /// the renamed on-disk `filename`, and become visible to future openers.
    pub fn mark_readable(&mut self, version: i64, filename: impl Into<String>) {
        self.version = version;
        self.filename = filename.into();
        self.readable = true;
    }

    pub fn update_size(&mut self, new_size: u64) {
        self.size = new_size;
    }
}
