//! The authoritative origin server.
//!
//! The origin owns the canonical copy of every file and the per-path version
//! counters. Versions only move forward: a committed write-back bumps the
//! counter once (on its offset-zero chunk), and an unlink bumps it too so
//! that proxies holding a cached copy of the deleted file can never mistake
//! it for current.
//!
//! Request handling is serialized under a single store mutex, which gives
//! each path single-threaded-equivalent semantics without per-path locking.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::path::normalize;
use crate::rpc::{CHUNK_SIZE, OpenMode, OriginRequest, OriginResponse, read_frame, write_frame};

/// The origin's store: a root directory plus the version counter per path.
pub struct OriginServer {
    root: PathBuf,
    store: Mutex<HashMap<String, i64>>,
}

impl OriginServer {
    /// Serve files out of `root`, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        info!(root = %root.display(), "origin store ready");
        Ok(Self {
            root,
            store: Mutex::new(HashMap::new()),
        })
    }

    /// Handle one request. Never fails at this layer; every problem becomes
    /// an [`OriginResponse::Invalid`] for the proxy to forward.
    pub async fn handle(&self, request: OriginRequest) -> OriginResponse {
        match request {
            OriginRequest::Fetch {
                path,
                mode,
                known_version,
                offset,
            } => self.fetch(&path, mode, known_version, offset).await,
            OriginRequest::Write {
                path,
                bytes,
                offset,
            } => self.write(&path, &bytes, offset).await,
            OriginRequest::Unlink { path } => self.unlink(&path).await,
        }
    }

    async fn fetch(&self, raw: &str, mode: OpenMode, known_version: i64, offset: u64) -> OriginResponse {
        let Ok(path) = normalize(raw) else {
            return invalid(libc::EPERM);
        };
        let abs = self.root.join(&path);
        let mut versions = self.store.lock().await;

        // Continuation of a chunked download: the freshness decision was made
        // by the offset-zero request, so just stream bytes.
        if offset != 0 {
            let version = versions.get(&path).copied().unwrap_or(1);
            return match read_chunk(&abs, offset).await {
                Ok((file_size, bytes)) => OriginResponse::Chunk {
                    version,
                    file_size,
                    bytes,
                },
                Err(e) => {
                    warn!(path, offset, error = %e, "chunk read failed");
                    invalid(libc::EPERM)
                }
            };
        }

        let meta = tokio::fs::metadata(&abs).await;
        let exists = meta.is_ok();
        let is_dir = meta.as_ref().is_ok_and(std::fs::Metadata::is_dir);

        match mode {
            OpenMode::CreateNew => {
                if is_dir {
                    return invalid(libc::EISDIR);
                }
                if exists {
                    return invalid(libc::EEXIST);
                }
                // The file will exist once the close-time write-back commits;
                // hand back the path's last-known counter so the proxy can
                // name its empty copy.
                OriginResponse::Chunk {
                    version: versions.get(&path).copied().unwrap_or(0),
                    file_size: 0,
                    bytes: Bytes::new(),
                }
            }
            OpenMode::Create if !exists => OriginResponse::Chunk {
                version: versions.get(&path).copied().unwrap_or(0),
                file_size: 0,
                bytes: Bytes::new(),
            },
            OpenMode::Read | OpenMode::Write | OpenMode::Create => {
                if !exists {
                    return invalid(libc::ENOENT);
                }
                if is_dir {
                    return invalid(libc::EISDIR);
                }
                // A file that predates us gets version 1 on first contact.
                let version = *versions.entry(path.clone()).or_insert(1);
                if version == known_version {
                    return OriginResponse::UpToDate { version };
                }
                match read_chunk(&abs, 0).await {
                    Ok((file_size, bytes)) => OriginResponse::Chunk {
                        version,
                        file_size,
                        bytes,
                    },
                    Err(e) => {
                        warn!(path, error = %e, "fetch read failed");
                        invalid(libc::EPERM)
                    }
                }
            }
        }
    }

    async fn write(&self, raw: &str, bytes: &[u8], offset: u64) -> OriginResponse {
        let Ok(path) = normalize(raw) else {
            return invalid(libc::EPERM);
        };
        let mut versions = self.store.lock().await;

        // One version bump per committed close: the offset-zero chunk starts
        // the new version, later chunks of the same write-back reuse it.
        let version = if offset == 0 {
            let next = versions.get(&path).copied().unwrap_or(0) + 1;
            versions.insert(path.clone(), next);
            next
        } else {
            versions.get(&path).copied().unwrap_or(1)
        };

        match write_chunk(&self.root.join(&path), bytes, offset).await {
            Ok(()) => {
                debug!(path, offset, len = bytes.len(), version, "write-back chunk applied");
                OriginResponse::Written { version }
            }
            Err(e) => {
                warn!(path, offset, error = %e, "write-back failed");
                invalid(libc::EPERM)
            }
        }
    }

    async fn unlink(&self, raw: &str) -> OriginResponse {
        let Ok(path) = normalize(raw) else {
            return invalid(libc::EPERM);
        };
        let abs = self.root.join(&path);
        let mut versions = self.store.lock().await;

        match tokio::fs::metadata(&abs).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return invalid(libc::ENOENT),
            Err(e) => {
                warn!(path, error = %e, "unlink stat failed");
                return invalid(libc::EPERM);
            }
            Ok(meta) if meta.is_dir() => return invalid(libc::EISDIR),
            Ok(_) => {}
        }

        // Bump so cached readers see staleness on their next open.
        if let Some(version) = versions.get_mut(&path) {
            *version += 1;
        }

        match tokio::fs::remove_file(&abs).await {
            Ok(()) => {
                debug!(path, "unlinked");
                OriginResponse::Unlinked
            }
            Err(e) => {
                warn!(path, error = %e, "unlink failed");
                invalid(libc::EPERM)
            }
        }
    }
}

fn invalid(errno: i32) -> OriginResponse {
    OriginResponse::Invalid { errno: -errno }
}

/// Read up to one chunk of `abs` starting at `offset`, along with the file's
/// full length.
async fn read_chunk(abs: &Path, offset: u64) -> std::io::Result<(u64, Bytes)> {
    let mut file = tokio::fs::File::open(abs).await?;
    let file_size = file.metadata().await?.len();
    file.seek(SeekFrom::Start(offset)).await?;

    // min() bounds the cast to CHUNK_SIZE.
    #[expect(clippy::cast_possible_truncation)]
    let want = (file_size.saturating_sub(offset)).min(CHUNK_SIZE as u64) as usize;
    let mut buf = vec![0u8; want];
    file.read_exact(&mut buf).await?;
    Ok((file_size, Bytes::from(buf)))
}

/// Apply one write-back chunk at `offset`, creating the file if needed.
async fn write_chunk(abs: &Path, bytes: &[u8], offset: u64) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(abs)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Accept proxy connections forever, one task per connection.
pub async fn serve(listener: TcpListener, server: Arc<OriginServer>) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "origin listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "proxy connected");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, server).await {
                warn!(%peer, error = %e, "origin connection error");
            }
            debug!(%peer, "proxy disconnected");
        });
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    server: Arc<OriginServer>,
) -> Result<(), crate::rpc::FrameError> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<OriginRequest, _>(&mut stream).await? {
        let response = server.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
