//! Wire vocabulary and framing shared by the proxy, its clients, and the
//! origin server.
//!
//! Every message is a bincode-encoded payload behind a little-endian `u32`
//! length prefix. The same framing carries both protocols: the client-facing
//! file API (see [`crate::dispatcher`]) and the proxy↔origin RPC below.

pub mod client;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload of a single fetch or write-back RPC, in bytes. Fixed and
/// identical on both sides of the wire.
pub const CHUNK_SIZE: usize = 400_000;

/// Upper bound on an encoded frame: one chunk plus generous header slack.
/// Anything larger is a corrupt or hostile stream.
pub const MAX_FRAME_LEN: usize = CHUNK_SIZE + 4096;

/// How a client wants a file opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Read-only; the file must exist.
    Read,
    /// Read-write; the file must exist.
    Write,
    /// Read-write; create the file if it does not exist.
    Create,
    /// Read-write; fail with EEXIST if the file already exists.
    CreateNew,
}

/// Anchor for an lseek operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A request from the proxy to the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OriginRequest {
    /// Check-on-open freshness probe and chunked download.
    ///
    /// `known_version` is the proxy's cached version for the path, `-1` if it
    /// has none. At `offset == 0` the origin answers [`OriginResponse::UpToDate`]
    /// when the versions match; nonzero offsets always stream bytes.
    Fetch {
        path: String,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    },
    /// Write-back of one chunk at `offset`. An `offset` of zero starts a new
    /// committed version; later chunks of the same close reuse it.
    Write {
        path: String,
        bytes: Bytes,
        offset: u64,
    },
    /// Delete the authoritative copy.
    Unlink { path: String },
}

/// The origin's answer to an [`OriginRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OriginResponse {
    /// The operation is invalid for this path; `errno` is negative.
    Invalid { errno: i32 },
    /// The proxy's copy matches the current version; no bytes follow.
    UpToDate { version: i64 },
    /// One chunk of file content, at most [`CHUNK_SIZE`] bytes. `file_size`
    /// is the full length; the caller re-fetches at successive offsets until
    /// it has accumulated that many bytes.
    Chunk {
        version: i64,
        file_size: u64,
        bytes: Bytes,
    },
    /// A write-back chunk was applied; `version` is the committed version.
    Written { version: i64 },
    /// The unlink succeeded.
    Unlinked,
}

/// Framing or encoding failure on either side of a connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error on the wire: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode a frame: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    TooLarge(usize),
}

/// Write one length-prefixed message.
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    // The length check above bounds the cast.
    #[expect(clippy::cast_possible_truncation)]
    let len = (payload.len() as u32).to_le_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message. Returns `None` on a clean EOF at a frame
/// boundary (the peer hung up between messages).
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
