//! Fetch layer.
//!
//! Retrieves manifests and chunks through the session, one pooled endpoint
//! per attempt. Each failed attempt releases its endpoint and the next one
//! takes a new endpoint, so retries rotate across servers.
//!
//! - [`Fetcher::fetch_manifest`]: exhausting attempts is an error
//! - [`Fetcher::fetch_chunk`]: exhausting attempts yields `None`; the caller
//!   decides whether that is fatal
//! - [`KeyRing`]: depot key cache keyed by app and depot

mod keys;
mod policy;

pub use keys::KeyRing;
pub use policy::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{AppId, ChunkDescriptor, ContentDescriptor, DepotId, DepotKey, Manifest};
use crate::pool::{EndpointPool, PoolError, PooledEndpoint};
use crate::session::{ContentSession, SessionError};

/// Result type for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors from the fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every manifest download attempt failed.
    #[error("manifest unavailable for {descriptor} after {attempts} attempts: {last_error}")]
    ManifestUnavailable {
        descriptor: ContentDescriptor,
        attempts: u32,
        last_error: String,
    },

    /// The session refused to issue a manifest request code.
    #[error("failed to get request code for {descriptor}: {source}")]
    RequestCode {
        descriptor: ContentDescriptor,
        #[source]
        source: SessionError,
    },

    /// No decryption key is available for the depot.
    #[error("no decryption key for app {app} depot {depot}")]
    KeyUnavailable { app: AppId, depot: DepotId },

    /// The key lookup itself failed.
    #[error("key lookup failed for app {app} depot {depot}: {source}")]
    KeyLookup {
        app: AppId,
        depot: DepotId,
        #[source]
        source: SessionError,
    },
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("chunk bytes do not match length {expected_len} and checksum {expected_checksum:08x}")]
    ChunkMismatch {
        expected_len: u32,
        expected_checksum: u32,
    },
}

/// Retrying fetcher over the endpoint pool.
pub struct Fetcher {
    session: Arc<dyn ContentSession>,
    pool: Arc<EndpointPool>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(session: Arc<dyn ContentSession>, pool: Arc<EndpointPool>, policy: RetryPolicy) -> Self {
        Self {
            session,
            pool,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Take an endpoint, kicking off a background refill when the pool is dry.
    fn take_endpoint(&self) -> Result<PooledEndpoint, AttemptError> {
        self.pool.take().map_err(|e| {
            if self.pool.spawn_refill() {
                info!("Endpoint pool exhausted, refilling in background");
            }
            AttemptError::from(e)
        })
    }

    async fn backoff(&self, attempt: u32) {
        if let Some(delay) = self.policy.delay_for_attempt(attempt) {
            tokio::time::sleep(delay).await;
        }
    }

    /// Download and decode the manifest for `descriptor`.
    ///
    /// The request code is obtained once and reused by every attempt.
    pub async fn fetch_manifest(
        &self,
        descriptor: ContentDescriptor,
        key: &DepotKey,
        branch: &str,
    ) -> FetchResult<Manifest> {
        let request_code = self
            .session
            .manifest_request_code(descriptor.depot, descriptor.app, descriptor.manifest, branch)
            .await
            .map_err(|source| FetchError::RequestCode { descriptor, source })?;

        let attempts = self.policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.manifest_attempt(descriptor, request_code, key).await {
                Ok(manifest) => {
                    debug!(
                        descriptor = %descriptor,
                        attempt,
                        files = manifest.files.len(),
                        "Manifest downloaded"
                    );
                    return Ok(manifest);
                }
                Err(e) => {
                    warn!(descriptor = %descriptor, attempt, error = %e, "Manifest download attempt failed");
                    last_error = e.to_string();
                }
            }
            self.backoff(attempt).await;
        }

        error!(descriptor = %descriptor, attempts, "Manifest unavailable");
        Err(FetchError::ManifestUnavailable {
            descriptor,
            attempts,
            last_error,
        })
    }

    async fn manifest_attempt(
        &self,
        descriptor: ContentDescriptor,
        request_code: u64,
        key: &DepotKey,
    ) -> Result<Manifest, AttemptError> {
        let pooled = self.take_endpoint()?;
        let result = self
            .session
            .download_manifest(
                descriptor.depot,
                descriptor.manifest,
                request_code,
                pooled.endpoint(),
                key,
            )
            .await;
        self.pool.release(pooled);
        Ok(result?)
    }

    /// Download one chunk, validated against its descriptor.
    ///
    /// Returns `None` once every attempt has failed.
    pub async fn fetch_chunk(
        &self,
        depot: DepotId,
        chunk: &ChunkDescriptor,
        key: &DepotKey,
    ) -> Option<Vec<u8>> {
        let attempts = self.policy.max_attempts();

        for attempt in 1..=attempts {
            match self.chunk_attempt(depot, chunk, key).await {
                Ok(data) => return Some(data),
                Err(e) => {
                    warn!(
                        depot = %depot,
                        chunk = %chunk.id,
                        offset = chunk.offset,
                        attempt,
                        error = %e,
                        "Chunk download attempt failed"
                    );
                }
            }
            self.backoff(attempt).await;
        }

        error!(depot = %depot, chunk = %chunk.id, attempts, "Chunk unavailable");
        None
    }

    async fn chunk_attempt(
        &self,
        depot: DepotId,
        chunk: &ChunkDescriptor,
        key: &DepotKey,
    ) -> Result<Vec<u8>, AttemptError> {
        let pooled = self.take_endpoint()?;
        let result = self
            .session
            .download_chunk(depot, chunk, pooled.endpoint(), key)
            .await;
        self.pool.release(pooled);

        let data = result?;
        if !chunk.matches(&data) {
            return Err(AttemptError::ChunkMismatch {
                expected_len: chunk.uncompressed_len,
                expected_checksum: chunk.checksum,
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::model::{ManifestId, TransportKind};
    use crate::pool::PoolConfig;
    use crate::session::testing::{endpoint, file_entry, FakeSession};

    const APP: AppId = AppId(10);
    const DEPOT: DepotId = DepotId(11);

    async fn setup(hosts: &[&str]) -> (Arc<FakeSession>, Arc<EndpointPool>, Fetcher) {
        let session = Arc::new(FakeSession::new());
        session.push_endpoints(hosts.iter().map(|h| endpoint(h)).collect());
        let pool = Arc::new(EndpointPool::new(
            APP,
            session.clone(),
            PoolConfig {
                min_endpoints: hosts.len(),
                refill_backoff: Duration::from_millis(1),
                refill_timeout: Duration::from_millis(50),
            },
        ));
        pool.refill().await;
        let fetcher = Fetcher::new(
            session.clone(),
            pool.clone(),
            RetryPolicy::fixed(3, Duration::ZERO),
        );
        (session, pool, fetcher)
    }

    fn manifest() -> Manifest {
        let (entry, _) = file_entry("a.txt", b"hello", 4);
        Manifest {
            depot: DEPOT,
            id: ManifestId(7),
            files: vec![entry],
            names_encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_fetch_manifest_rotates_past_bad_endpoint() {
        let (session, pool, fetcher) = setup(&["bad", "good"]).await;
        session.fail_host("bad");
        session.add_manifest(manifest());

        let descriptor = ContentDescriptor::new(APP, DEPOT, ManifestId(7));
        let fetched = fetcher
            .fetch_manifest(descriptor, &DepotKey(vec![0]), "public")
            .await
            .unwrap();

        assert_eq!(fetched, manifest());
        assert_eq!(session.manifest_requests.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_manifest_exhausts_attempts() {
        let (session, pool, fetcher) = setup(&["a", "b"]).await;
        session.fail_host("a");
        session.fail_host("b");

        let descriptor = ContentDescriptor::new(APP, DEPOT, ManifestId(7));
        let err = fetcher
            .fetch_manifest(descriptor, &DepotKey(vec![0]), "public")
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::ManifestUnavailable { attempts: 3, .. }));
        assert_eq!(session.manifest_requests.load(Ordering::SeqCst), 3);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_chunk_validates_bytes() {
        let (session, _pool, fetcher) = setup(&["a"]).await;
        let (entry, payloads) = file_entry("a.bin", b"0123456789", 10);
        session.add_chunks(payloads);
        session.corrupt_chunk(entry.chunks[0].id);

        let result = fetcher
            .fetch_chunk(DEPOT, &entry.chunks[0], &DepotKey(vec![0]))
            .await;

        assert!(result.is_none());
        assert_eq!(session.chunk_request_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_chunk_success() {
        let (session, _pool, fetcher) = setup(&["a"]).await;
        let (entry, payloads) = file_entry("a.bin", b"0123456789", 4);
        session.add_chunks(payloads);

        let data = fetcher
            .fetch_chunk(DEPOT, &entry.chunks[1], &DepotKey(vec![0]))
            .await
            .unwrap();
        assert_eq!(data, b"4567");
    }

    #[tokio::test]
    async fn test_fetch_chunk_on_exhausted_pool_spawns_refill() {
        let session = Arc::new(FakeSession::new());
        let pool = Arc::new(EndpointPool::new(
            APP,
            session.clone(),
            PoolConfig {
                min_endpoints: 1,
                refill_backoff: Duration::from_millis(1),
                refill_timeout: Duration::from_millis(50),
            },
        ));
        let fetcher = Fetcher::new(
            session.clone(),
            pool.clone(),
            RetryPolicy::fixed(1, Duration::ZERO),
        );
        let (entry, payloads) = file_entry("a.bin", b"abc", 4);
        session.add_chunks(payloads);
        session.push_endpoints(vec![crate::model::Endpoint::new(
            "late",
            80,
            TransportKind::Http,
        )]);

        assert!(fetcher
            .fetch_chunk(DEPOT, &entry.chunks[0], &DepotKey(vec![0]))
            .await
            .is_none());
        assert_eq!(session.chunk_request_count(), 0);

        for _ in 0..100 {
            if !pool.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.len(), 1);
        assert!(fetcher
            .fetch_chunk(DEPOT, &entry.chunks[0], &DepotKey(vec![0]))
            .await
            .is_some());
    }
}
