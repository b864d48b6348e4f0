//! Contracts for the upstream session collaborators.
//!
//! The core never talks to the network directly. Everything it needs from
//! the upstream service goes through two traits:
//!
//! - [`ContentSession`]: endpoints, keys, manifests, chunks and app descriptors
//! - [`ChangeFeed`]: "changes since X" notices
//!
//! Both traits use boxed futures so they can be shared as `Arc<dyn ...>`
//! between the pool, the fetch layer and the change detector.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{
    AppDescriptor, AppId, ChangeNotice, ChangeNumber, ChunkDescriptor, DepotId, DepotKey,
    Endpoint, Manifest, ManifestId,
};

#[cfg(test)]
pub(crate) mod testing;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors reported by session collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The upstream call did not answer in time.
    #[error("upstream call timed out after {0}s")]
    Timeout(u64),

    /// The transport failed to move the bytes.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream refused or does not have the requested item.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Upstream content session.
///
/// Implementations own authentication, decryption and decompression. The
/// bytes returned by [`ContentSession::download_chunk`] are the plain chunk
/// contents.
pub trait ContentSession: Send + Sync {
    /// Current list of candidate download endpoints.
    fn endpoints(&self) -> BoxFuture<'_, SessionResult<Vec<Endpoint>>>;

    /// Decryption key for a depot of an app. `Ok(None)` when access is denied.
    fn depot_key(&self, app: AppId, depot: DepotId) -> BoxFuture<'_, SessionResult<Option<DepotKey>>>;

    /// One-time request code needed to download a manifest.
    fn manifest_request_code<'a>(
        &'a self,
        depot: DepotId,
        app: AppId,
        manifest: ManifestId,
        branch: &'a str,
    ) -> BoxFuture<'a, SessionResult<u64>>;

    /// Download and decode a manifest from one endpoint.
    fn download_manifest<'a>(
        &'a self,
        depot: DepotId,
        manifest: ManifestId,
        request_code: u64,
        endpoint: &'a Endpoint,
        key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Manifest>>;

    /// Download one chunk from one endpoint.
    fn download_chunk<'a>(
        &'a self,
        depot: DepotId,
        chunk: &'a ChunkDescriptor,
        endpoint: &'a Endpoint,
        key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Vec<u8>>>;

    /// Full current description of an app. `Ok(None)` when the app is unknown.
    fn app_descriptor(
        &self,
        app: AppId,
        expected_change: Option<ChangeNumber>,
    ) -> BoxFuture<'_, SessionResult<Option<AppDescriptor>>>;
}

/// Upstream change notification source.
pub trait ChangeFeed: Send + Sync {
    /// Changes recorded upstream since `since`.
    fn changes_since(&self, since: ChangeNumber) -> BoxFuture<'_, SessionResult<ChangeNotice>>;
}
