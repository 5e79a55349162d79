//! proxyfs shared library.
//!
//! A caching file proxy that sits between clients and a single authoritative
//! origin server. Files are cached whole on local disk with version-stamped
//! copies; an AFS-1 style check-on-open protocol keeps them fresh, and writes
//! propagate back to the origin at close time with last-writer-wins semantics.

/// Whole-file cache with LRU eviction and pinning.
pub mod cache;
/// Session dispatcher and client-facing wire protocol.
pub mod dispatcher;
/// Authoritative origin store and its request handler.
pub mod origin;
/// Logical path normalization for the proxy namespace.
pub mod path;
/// Wire types and framing shared between proxy and origin.
pub mod rpc;
/// Per-client file-handle state machine.
pub mod session;
