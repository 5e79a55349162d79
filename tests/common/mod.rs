//! Shared helpers for the integration tests: an origin server on an
//! ephemeral port, a temp-dir cache, and sessions wired to both.
#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;

use proxyfs::cache::Cache;
use proxyfs::origin::{self, OriginServer};
use proxyfs::rpc::client::{OriginClient, OriginRpc, RpcError};
use proxyfs::rpc::{OpenMode, OriginResponse};
use proxyfs::session::Session;

/// A live origin server rooted in a temp directory.
pub struct TestOrigin {
    pub addr: SocketAddr,
    root: PathBuf,
    _tmp: tempfile::TempDir,
}

impl TestOrigin {
    /// Spawn an origin server on an ephemeral port.
    pub async fn spawn() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("store");
        let server = Arc::new(OriginServer::new(&root).await.expect("origin"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(origin::serve(listener, server));
        Self {
            addr,
            root,
            _tmp: tmp,
        }
    }

    /// Place a file directly into the authoritative store.
    pub fn seed(&self, path: &str, contents: &[u8]) {
        let abs = self.root.join(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(abs, contents).expect("seed");
    }

    /// Read a file straight out of the authoritative store.
    pub fn read(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.root.join(path)).expect("read store file")
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }
}

/// A proxy-side cache in a temp directory, shared by the test's sessions.
pub struct TestCache {
    pub cache: Arc<Cache>,
    _tmp: tempfile::TempDir,
}

impl TestCache {
    pub async fn with_capacity(capacity: u64) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(
            Cache::new(&tmp.path().join("cache"), capacity)
                .await
                .expect("cache"),
        );
        Self { cache, _tmp: tmp }
    }

    pub async fn new() -> Self {
        Self::with_capacity(64 << 20).await
    }

    /// A session with its own connection to the origin, like a fresh client.
    pub async fn session(&self, origin: &TestOrigin) -> Session<OriginClient> {
        let client = Arc::new(OriginClient::connect(origin.addr).await.expect("connect"));
        Session::new(Arc::clone(&self.cache), client)
    }

    /// A session whose RPC traffic is counted.
    pub async fn counted_session(
        &self,
        origin: &TestOrigin,
    ) -> (Arc<CountingOrigin>, Session<CountingOrigin>) {
        let client = OriginClient::connect(origin.addr).await.expect("connect");
        let counting = Arc::new(CountingOrigin::new(client));
        let session = Session::new(Arc::clone(&self.cache), Arc::clone(&counting));
        (counting, session)
    }
}

/// Wraps an [`OriginClient`] and counts fetches and the file data they move,
/// so tests can assert that cache hits perform no bulk transfer.
pub struct CountingOrigin {
    inner: OriginClient,
    pub fetch_calls: AtomicU64,
    pub fetched_bytes: AtomicU64,
}

impl CountingOrigin {
    pub fn new(inner: OriginClient) -> Self {
        Self {
            inner,
            fetch_calls: AtomicU64::new(0),
            fetched_bytes: AtomicU64::new(0),
        }
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    pub fn fetched_bytes(&self) -> u64 {
        self.fetched_bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OriginRpc for CountingOrigin {
    async fn fetch(
        &self,
        path: &str,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    ) -> Result<OriginResponse, RpcError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        let response = self.inner.fetch(path, mode, known_version, offset).await?;
        if let OriginResponse::Chunk { bytes, .. } = &response {
            self.fetched_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        Ok(response)
    }

    async fn write(
        &self,
        path: &str,
        bytes: Bytes,
        offset: u64,
    ) -> Result<OriginResponse, RpcError> {
        self.inner.write(path, bytes, offset).await
    }

    async fn unlink(&self, path: &str) -> Result<OriginResponse, RpcError> {
        self.inner.unlink(path).await
    }
}
