//! Per-client session: the open/read/write/close/lseek/unlink state machine.
//!
//! Each client connection owns one `Session`. A session maps integer handles
//! to open cache files and enforces the consistency protocol: check-on-open
//! against the origin, copy-on-write isolation for writers, and close-time
//! write-back with last-writer-wins semantics.
//!
//! A handle's cache entry changes identity at most once, on the first write
//! to a handle that was sharing a readable copy:
//!
//! ```text
//!         open                   first write
//!  (none) ────▶ READER_SHARED ──────────────▶ WRITER_PRIVATE
//!                    │ close                       │ close (commit)
//!                    ▼                             ▼
//!                  (none)                        (none)
//! ```

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::cache::entry::{version_filename, writer_filename};
use crate::cache::{Cache, CacheEntry, CacheFull, CacheState, EntryId, UNCOMMITTED};
use crate::path::{PathEscape, normalize};
use crate::rpc::client::{OriginRpc, RpcError};
use crate::rpc::{CHUNK_SIZE, OpenMode, OriginResponse, Whence};

/// Why a session operation failed. Converts onto the negative errno contract
/// the client wire speaks.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    PathEscape(#[from] PathEscape),

    #[error("unknown file handle")]
    BadHandle,

    #[error("handle is open read-only")]
    ReadOnly,

    #[error("handle designates a directory")]
    IsDirectory,

    #[error("seek resolves before the start of the file")]
    InvalidSeek,

    #[error(transparent)]
    CacheFull(#[from] CacheFull),

    /// The origin rejected the operation; carries the negative errno it sent.
    #[error("origin rejected the operation ({0})")]
    Origin(i32),

    #[error("local io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("read failed: {0}")]
    ReadFailed(std::io::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("unexpected response from the origin")]
    Protocol,
}

impl From<&SessionError> for i32 {
    fn from(e: &SessionError) -> Self {
        match e {
            SessionError::PathEscape(_) | SessionError::Io(_) => -libc::EPERM,
            SessionError::BadHandle | SessionError::ReadOnly => -libc::EBADF,
            SessionError::IsDirectory => -libc::EISDIR,
            SessionError::InvalidSeek => -libc::EINVAL,
            SessionError::CacheFull(_) => -libc::EBUSY,
            SessionError::Origin(errno) => *errno,
            SessionError::ReadFailed(_) => -libc::ENOMEM,
            SessionError::Rpc(_) | SessionError::Protocol => -libc::EIO,
        }
    }
}

/// One open handle: the cache entry it pins and the open file on it.
struct Handle {
    entry: EntryId,
    file: tokio::fs::File,
    read_only: bool,
    /// Whether `entry` is this handle's private copy-on-write copy.
    writer: bool,
    /// Directory handles are reserved in the protocol; nothing materializes
    /// one today, but read must answer EISDIR if one ever appears.
    is_dir: bool,
}

/// Per-client state machine. One per connection; operations are serialized
/// by the owning connection task.
pub struct Session<O: OriginRpc> {
    cache: Arc<Cache>,
    origin: Arc<O>,
    next_handle: u64,
    handles: FxHashMap<u64, Handle>,
}

impl<O: OriginRpc> Session<O> {
    #[must_use]
    pub fn new(cache: Arc<Cache>, origin: Arc<O>) -> Self {
        Self {
            cache,
            origin,
            next_handle: 0,
            handles: FxHashMap::default(),
        }
    }

    /// Number of currently open handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Open `raw` in `mode` and return a new handle.
    ///
    /// Holds the cache mutex for the entire operation — including the
    /// freshness RPC and any whole-file fetch — so concurrent opens of the
    /// same path observe one consistent version decision.
    #[instrument(name = "Session::open", skip(self))]
    pub async fn open(&mut self, raw: &str, mode: OpenMode) -> Result<u64, SessionError> {
        let path = normalize(raw)?;
        let mut cache = self.cache.lock().await;

        // Mirror the path's directory structure under the cache root lazily.
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(cache.root().join(parent)).await?;
            }
        }

        let local = cache.lookup_readable(&path);
        let known = local.map_or(UNCOMMITTED, |id| cache.entry(id).version());

        let handle = match self.origin.fetch(&path, mode, known, 0).await? {
            OriginResponse::Invalid { errno } => return Err(SessionError::Origin(errno)),
            OriginResponse::UpToDate { version } => {
                // The origin can only confirm a version we told it about.
                let id = local.ok_or(SessionError::Protocol)?;
                debug!(path, version, "cache hit");
                let file = tokio::fs::File::open(cache.root().join(cache.entry(id).filename())).await?;
                cache.incref(id);
                cache.touch(id);
                Handle {
                    entry: id,
                    file,
                    read_only: mode == OpenMode::Read,
                    writer: false,
                    is_dir: false,
                }
            }
            OriginResponse::Chunk {
                version,
                file_size,
                bytes,
            } => {
                self.materialize(&mut cache, &path, mode, known, version, file_size, bytes)
                    .await?
            }
            OriginResponse::Written { .. } | OriginResponse::Unlinked => {
                return Err(SessionError::Protocol);
            }
        };

        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, handle);
        Ok(id)
    }

    /// Install a fresh copy of `path` at `version`: write the first chunk,
    /// pull the rest of the file, and insert a pinned readable entry. A
    /// failure at any point removes the partial file and leaves the cache
    /// untouched.
    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        cache: &mut CacheState,
        path: &str,
        mode: OpenMode,
        known: i64,
        version: i64,
        file_size: u64,
        first: Bytes,
    ) -> Result<Handle, SessionError> {
        let filename = version_filename(path, version);
        let abs = cache.root().join(&filename);
        debug!(path, version, file_size, "fetching from origin");

        let file = match self.fill_from_origin(&abs, path, mode, known, file_size, first).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tokio::fs::remove_file(&abs).await;
                return Err(e);
            }
        };

        cache.remove_stale(path);
        let entry = CacheEntry::new_readable(path, filename, version, file_size);
        match cache.insert(entry) {
            Ok(id) => Ok(Handle {
                entry: id,
                file,
                read_only: mode == OpenMode::Read,
                writer: false,
                is_dir: false,
            }),
            Err(full) => {
                let _ = tokio::fs::remove_file(&abs).await;
                Err(full.into())
            }
        }
    }

    async fn fill_from_origin(
        &self,
        abs: &Path,
        path: &str,
        mode: OpenMode,
        known: i64,
        file_size: u64,
        first: Bytes,
    ) -> Result<tokio::fs::File, SessionError> {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(abs)
            .await?;

        file.write_all(&first).await?;
        let mut offset = first.len() as u64;
        while offset < file_size {
            match self.origin.fetch(path, mode, known, offset).await? {
                OriginResponse::Chunk { bytes, .. } => {
                    if bytes.is_empty() {
                        // The origin claims more bytes exist but sent none;
                        // bail rather than spin.
                        return Err(SessionError::Protocol);
                    }
                    file.write_all(&bytes).await?;
                    offset += bytes.len() as u64;
                }
                OriginResponse::Invalid { errno } => return Err(SessionError::Origin(errno)),
                _ => return Err(SessionError::Protocol),
            }
        }

        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(file)
    }

    /// Read up to `len` bytes from the handle's current position. Returns an
    /// empty buffer at EOF.
    pub async fn read(&mut self, handle: u64, len: usize) -> Result<Bytes, SessionError> {
        let h = self.handles.get_mut(&handle).ok_or(SessionError::BadHandle)?;
        if h.is_dir {
            return Err(SessionError::IsDirectory);
        }

        let mut buf = vec![0u8; len];
        let n = h.file.read(&mut buf).await.map_err(SessionError::ReadFailed)?;
        buf.truncate(n);

        self.cache.lock().await.touch(h.entry);
        Ok(Bytes::from(buf))
    }

    /// Write `buf` at the handle's current position, detaching onto a
    /// private copy first if the handle still shares a readable one.
    pub async fn write(&mut self, handle: u64, buf: &[u8]) -> Result<u64, SessionError> {
        let h = self.handles.get_mut(&handle).ok_or(SessionError::BadHandle)?;
        if h.read_only {
            return Err(SessionError::ReadOnly);
        }

        if !h.writer {
            Self::detach_writer(&self.cache, &mut *h, handle).await?;
        }

        h.file.write_all(buf).await?;
        let new_size = h.file.metadata().await?.len();

        self.cache.lock().await.update_size(h.entry, new_size)?;
        Ok(buf.len() as u64)
    }

    /// Copy-on-write: clone the shared readable copy into a file owned by
    /// this handle alone, preserving the file position, and switch the handle
    /// onto the new writer-private entry.
    async fn detach_writer(cache: &Cache, h: &mut Handle, handle: u64) -> Result<(), SessionError> {
        let (path, src_filename, src_size, root) = {
            let guard = cache.lock().await;
            let entry = guard.entry(h.entry);
            (
                entry.path().to_owned(),
                entry.filename().to_owned(),
                entry.size(),
                guard.root().to_owned(),
            )
        };

        let new_filename = writer_filename(&src_filename, handle);
        let abs = root.join(&new_filename);
        debug!(path, filename = new_filename, "copy-on-write detach");

        let pos = h.file.stream_position().await?;
        let mut private = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&abs)
            .await?;

        h.file.seek(SeekFrom::Start(0)).await?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = h.file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            private.write_all(&chunk[..n]).await?;
        }
        private.flush().await?;
        private.seek(SeekFrom::Start(pos)).await?;

        let mut guard = cache.lock().await;
        match guard.insert(CacheEntry::new_writer(path, new_filename, src_size)) {
            Ok(new_id) => {
                guard.decref(h.entry);
                h.entry = new_id;
                h.writer = true;
                h.file = private;
                Ok(())
            }
            Err(full) => {
                drop(guard);
                let _ = tokio::fs::remove_file(&abs).await;
                Err(full.into())
            }
        }
    }

    /// Close a handle. A writer-private copy is streamed back to the origin
    /// first; the origin's final version is adopted and the copy becomes
    /// visible to future openers. The handle is released even when the
    /// write-back fails.
    #[instrument(name = "Session::close", skip(self))]
    pub async fn close(&mut self, handle: u64) -> Result<(), SessionError> {
        let mut h = self.handles.remove(&handle).ok_or(SessionError::BadHandle)?;

        let result = if h.writer {
            self.commit(&mut h).await
        } else {
            Ok(())
        };

        let mut cache = self.cache.lock().await;
        cache.touch(h.entry);
        cache.decref(h.entry);
        result
    }

    /// Stream the writer-private copy to the origin in chunks, adopt the
    /// committed version, and publish the copy under its versioned name.
    async fn commit(&self, h: &mut Handle) -> Result<(), SessionError> {
        let (path, old_filename) = {
            let guard = self.cache.lock().await;
            let entry = guard.entry(h.entry);
            (entry.path().to_owned(), entry.filename().to_owned())
        };

        h.file.flush().await?;
        let file_size = h.file.metadata().await?.len();
        h.file.seek(SeekFrom::Start(0)).await?;

        let mut version = UNCOMMITTED;
        let mut offset = 0u64;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        // At least one round even for an empty file: the offset-zero write is
        // what makes the origin commit a new version.
        loop {
            // min() with CHUNK_SIZE bounds the cast.
            #[expect(clippy::cast_possible_truncation)]
            let want = (file_size - offset).min(CHUNK_SIZE as u64) as usize;
            h.file.read_exact(&mut chunk[..want]).await?;
            match self
                .origin
                .write(&path, Bytes::copy_from_slice(&chunk[..want]), offset)
                .await?
            {
                OriginResponse::Written { version: committed } => version = committed,
                OriginResponse::Invalid { errno } => return Err(SessionError::Origin(errno)),
                _ => return Err(SessionError::Protocol),
            }
            offset += want as u64;
            if offset >= file_size {
                break;
            }
        }

        debug!(path, version, file_size, "write-back committed");

        let new_filename = version_filename(&path, version);
        let mut cache = self.cache.lock().await;
        // An earlier write may have grown the file after its own size update
        // failed. Reconcile before publishing; a copy the cache cannot
        // account for must not become readable.
        cache.update_size(h.entry, file_size)?;
        tokio::fs::rename(
            cache.root().join(&old_filename),
            cache.root().join(&new_filename),
        )
        .await?;
        cache.mark_readable(h.entry, version, new_filename);
        cache.remove_stale(&path);
        Ok(())
    }

    /// Reposition the handle. `End` resolves against the entry's current
    /// size, `Current` against the handle's cursor.
    pub async fn lseek(&mut self, handle: u64, pos: i64, whence: Whence) -> Result<u64, SessionError> {
        let h = self.handles.get_mut(&handle).ok_or(SessionError::BadHandle)?;

        let base = match whence {
            Whence::Start => 0,
            Whence::Current => i64::try_from(h.file.stream_position().await?)
                .map_err(|_| SessionError::InvalidSeek)?,
            Whence::End => {
                let guard = self.cache.lock().await;
                i64::try_from(guard.entry(h.entry).size()).map_err(|_| SessionError::InvalidSeek)?
            }
        };

        let target = base.checked_add(pos).ok_or(SessionError::InvalidSeek)?;
        if target < 0 {
            return Err(SessionError::InvalidSeek);
        }

        // target >= 0 was just checked.
        #[expect(clippy::cast_sign_loss)]
        let target = target as u64;
        h.file.seek(SeekFrom::Start(target)).await?;

        self.cache.lock().await.touch(h.entry);
        Ok(target)
    }

    /// Delete the authoritative copy of `raw`. Cache copies are invalidated
    /// lazily: the next open's version check will refetch or fail.
    #[instrument(name = "Session::unlink", skip(self))]
    pub async fn unlink(&mut self, raw: &str) -> Result<(), SessionError> {
        let path = normalize(raw)?;
        match self.origin.unlink(&path).await? {
            OriginResponse::Unlinked => Ok(()),
            OriginResponse::Invalid { errno } => Err(SessionError::Origin(errno)),
            _ => Err(SessionError::Protocol),
        }
    }

    /// Close every open handle through the normal close path (dirty data
    /// propagates) and reset the session.
    pub async fn clientdone(&mut self) {
        let open: Vec<u64> = self.handles.keys().copied().collect();
        for handle in open {
            if let Err(e) = self.close(handle).await {
                warn!(handle, error = %e, "close during clientdone failed");
            }
        }
        self.handles.clear();
        self.next_handle = 0;
    }
}
