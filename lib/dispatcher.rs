//! Session dispatcher: accepts client connections and drives one
//! [`Session`] per client.
//!
//! The client wire protocol mirrors the file API one-to-one. Requests are
//! answered in order on the same connection, which is what serializes a
//! client's operations; clients never observe their own operations
//! interleaved. Disconnecting (cleanly or not) runs `clientdone`, so dirty
//! handles propagate their data before the session state is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::rpc::client::OriginRpc;
use crate::rpc::{CHUNK_SIZE, FrameError, OpenMode, Whence, read_frame, write_frame};
use crate::session::Session;

/// A file operation from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Open { path: String, mode: OpenMode },
    Read { handle: u64, len: u64 },
    Write { handle: u64, bytes: Bytes },
    Close { handle: u64 },
    Lseek { handle: u64, pos: i64, whence: Whence },
    Unlink { path: String },
}

/// The proxy's answer. Failures carry the negative errno of the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    Opened { handle: u64 },
    Data { bytes: Bytes },
    Written { len: u64 },
    Closed,
    Sought { pos: u64 },
    Unlinked,
    Error { errno: i32 },
}

/// Tracks live client sessions, for logging and introspection.
#[derive(Default)]
struct SessionRegistry {
    sessions: scc::HashMap<u64, std::net::SocketAddr>,
    next_id: AtomicU64,
}

/// Accept client connections forever; each gets its own session task.
pub async fn serve<O: OriginRpc + 'static>(
    listener: TcpListener,
    cache: Arc<Cache>,
    origin: Arc<O>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "proxy listening");
    let registry = Arc::new(SessionRegistry::default());

    loop {
        let (stream, peer) = listener.accept().await?;
        let session_id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = registry.sessions.insert_async(session_id, peer).await;
        info!(session_id, %peer, live = registry.sessions.len(), "client connected");

        let cache = Arc::clone(&cache);
        let origin = Arc::clone(&origin);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, cache, origin).await {
                warn!(session_id, error = %e, "client connection error");
            }
            let _ = registry.sessions.remove_async(&session_id).await;
            info!(session_id, live = registry.sessions.len(), "client disconnected");
        });
    }
}

async fn handle_client<O: OriginRpc>(
    mut stream: TcpStream,
    cache: Arc<Cache>,
    origin: Arc<O>,
) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let mut session = Session::new(cache, origin);

    let result = drive(&mut stream, &mut session).await;
    // Runs on clean disconnect and on wire errors alike: open handles must
    // flush their dirty data through the normal close path.
    session.clientdone().await;
    result
}

async fn drive<O: OriginRpc>(
    stream: &mut TcpStream,
    session: &mut Session<O>,
) -> Result<(), FrameError> {
    while let Some(request) = read_frame::<ClientRequest, _>(stream).await? {
        let reply = dispatch(session, request).await;
        write_frame(stream, &reply).await?;
    }
    Ok(())
}

async fn dispatch<O: OriginRpc>(session: &mut Session<O>, request: ClientRequest) -> ClientReply {
    match request {
        ClientRequest::Open { path, mode } => match session.open(&path, mode).await {
            Ok(handle) => ClientReply::Opened { handle },
            Err(ref e) => error_reply(e),
        },
        ClientRequest::Read { handle, len } => {
            // Bounded by the frame size; a client wanting more re-reads.
            #[expect(clippy::cast_possible_truncation)]
            let len = (len.min(CHUNK_SIZE as u64)) as usize;
            match session.read(handle, len).await {
                Ok(bytes) => ClientReply::Data { bytes },
                Err(ref e) => error_reply(e),
            }
        }
        ClientRequest::Write { handle, bytes } => match session.write(handle, &bytes).await {
            Ok(len) => ClientReply::Written { len },
            Err(ref e) => error_reply(e),
        },
        ClientRequest::Close { handle } => match session.close(handle).await {
            Ok(()) => ClientReply::Closed,
            Err(ref e) => error_reply(e),
        },
        ClientRequest::Lseek {
            handle,
            pos,
            whence,
        } => match session.lseek(handle, pos, whence).await {
            Ok(pos) => ClientReply::Sought { pos },
            Err(ref e) => error_reply(e),
        },
        ClientRequest::Unlink { path } => match session.unlink(&path).await {
            Ok(()) => ClientReply::Unlinked,
            Err(ref e) => error_reply(e),
        },
    }
}

fn error_reply(e: &crate::session::SessionError) -> ClientReply {
    debug!(error = %e, "operation failed");
    ClientReply::Error { errno: e.into() }
}

/// Client-side failure of a proxied file operation.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The proxy rejected the operation; carries the negative errno.
    #[error("proxy returned errno {0}")]
    Errno(i32),

    #[error("unexpected reply from the proxy")]
    Protocol,

    #[error("proxy closed the connection")]
    Disconnected,
}

/// A connected client of the proxy's file API. One request in flight at a
/// time, matching the per-session serialization of the server side.
pub struct ProxyClient {
    stream: TcpStream,
}

impl ProxyClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(FrameError::Io)?;
        stream.set_nodelay(true).map_err(FrameError::Io)?;
        Ok(Self { stream })
    }

    async fn call(&mut self, request: ClientRequest) -> Result<ClientReply, ClientError> {
        write_frame(&mut self.stream, &request).await?;
        match read_frame(&mut self.stream).await? {
            Some(ClientReply::Error { errno }) => Err(ClientError::Errno(errno)),
            Some(reply) => Ok(reply),
            None => Err(ClientError::Disconnected),
        }
    }

    pub async fn open(&mut self, path: &str, mode: OpenMode) -> Result<u64, ClientError> {
        match self
            .call(ClientRequest::Open {
                path: path.to_owned(),
                mode,
            })
            .await?
        {
            ClientReply::Opened { handle } => Ok(handle),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn read(&mut self, handle: u64, len: u64) -> Result<Bytes, ClientError> {
        match self.call(ClientRequest::Read { handle, len }).await? {
            ClientReply::Data { bytes } => Ok(bytes),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn write(&mut self, handle: u64, bytes: &[u8]) -> Result<u64, ClientError> {
        match self
            .call(ClientRequest::Write {
                handle,
                bytes: Bytes::copy_from_slice(bytes),
            })
            .await?
        {
            ClientReply::Written { len } => Ok(len),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn close(&mut self, handle: u64) -> Result<(), ClientError> {
        match self.call(ClientRequest::Close { handle }).await? {
            ClientReply::Closed => Ok(()),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn lseek(&mut self, handle: u64, pos: i64, whence: Whence) -> Result<u64, ClientError> {
        match self
            .call(ClientRequest::Lseek {
                handle,
                pos,
                whence,
            })
            .await?
        {
            ClientReply::Sought { pos } => Ok(pos),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn unlink(&mut self, path: &str) -> Result<(), ClientError> {
        match self
            .call(ClientRequest::Unlink {
                path: path.to_owned(),
            })
            .await?
        {
            ClientReply::Unlinked => Ok(()),
            _ => Err(ClientError::Protocol),
        }
    }
}
