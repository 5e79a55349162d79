//! Typed RPC client for the origin server.
//!
//! [`OriginRpc`] is the seam sessions talk through; [`OriginClient`] is the
//! production implementation over a single TCP connection. Requests are
//! strictly request/response, so the connection is serialized behind a mutex
//! and shared process-wide.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::debug;

use super::{FrameError, OpenMode, OriginRequest, OriginResponse, read_frame, write_frame};

/// Transport-level RPC failure. Origin-side rejections are not errors at this
/// layer; they arrive as [`OriginResponse::Invalid`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error talking to the origin: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error talking to the origin: {0}")]
    Frame(#[from] FrameError),

    #[error("origin closed the connection mid-request")]
    Disconnected,
}

/// The three operations the origin exposes.
#[async_trait]
pub trait OriginRpc: Send + Sync {
    /// Freshness probe plus chunked download; see [`OriginRequest::Fetch`].
    async fn fetch(
        &self,
        path: &str,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    ) -> Result<OriginResponse, RpcError>;

    /// Write one chunk back at `offset`; the response carries the committed
    /// version.
    async fn write(&self, path: &str, bytes: Bytes, offset: u64) -> Result<OriginResponse, RpcError>;

    /// Delete the authoritative copy of `path`.
    async fn unlink(&self, path: &str) -> Result<OriginResponse, RpcError>;
}

/// RPC client over one TCP connection to the origin.
pub struct OriginClient {
    stream: Mutex<TcpStream>,
}

impl OriginClient {
    /// Connect to the origin server.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected to origin");
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    async fn call(&self, request: OriginRequest) -> Result<OriginResponse, RpcError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request).await?;
        read_frame(&mut *stream).await?.ok_or(RpcError::Disconnected)
    }
}

#[async_trait]
impl OriginRpc for OriginClient {
    async fn fetch(
        &self,
        path: &str,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    ) -> Result<OriginResponse, RpcError> {
        self.call(OriginRequest::Fetch {
            path: path.to_owned(),
            mode,
            known_version,
            offset,
        })
        .await
    }

    async fn write(&self, path: &str, bytes: Bytes, offset: u64) -> Result<OriginResponse, RpcError> {
        self.call(OriginRequest::Write {
            path: path.to_owned(),
            bytes,
            offset,
        })
        .await
    }

    async fn unlink(&self, path: &str) -> Result<OriginResponse, RpcError> {
        self.call(OriginRequest::Unlink {
            path: path.to_owned(),
        })
        .await
    }
}
