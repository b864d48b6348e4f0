//! In-memory session fake for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{BoxFuture, ChangeFeed, ContentSession, SessionError, SessionResult};
use crate::model::{
    AppDescriptor, AppId, ChangeNotice, ChangeNumber, ChunkDescriptor, ChunkId, ContentHash,
    DepotId, DepotKey, Endpoint, FileEntry, FileFlags, Manifest, ManifestId, TransportKind,
};

/// Split `data` into chunks of `chunk_size` and build the matching entry.
///
/// Chunk ids are derived from the chunk contents, so identical bytes at the
/// same offset produce identical ids across versions.
pub(crate) fn file_entry(
    path: &str,
    data: &[u8],
    chunk_size: usize,
) -> (FileEntry, Vec<(ChunkId, Vec<u8>)>) {
    let mut chunks = Vec::new();
    let mut payloads = Vec::new();

    for (index, piece) in data.chunks(chunk_size).enumerate() {
        let digest = Sha256::digest(piece);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest[..20]);
        let descriptor = ChunkDescriptor {
            id: ChunkId(id),
            offset: (index * chunk_size) as u64,
            compressed_len: piece.len() as u32,
            uncompressed_len: piece.len() as u32,
            checksum: ChunkDescriptor::block_checksum(piece),
        };
        chunks.push(descriptor);
        payloads.push((descriptor.id, piece.to_vec()));
    }

    let entry = FileEntry {
        path: path.to_string(),
        size: data.len() as u64,
        flags: FileFlags::default(),
        hash: ContentHash::compute(data),
        chunks,
    };
    (entry, payloads)
}

pub(crate) fn endpoint(host: &str) -> Endpoint {
    Endpoint::new(host, 443, TransportKind::Https)
}

/// Scriptable fake implementing both session traits.
#[derive(Default)]
pub(crate) struct FakeSession {
    endpoint_batches: Mutex<VecDeque<Vec<Endpoint>>>,
    pub endpoint_calls: AtomicUsize,
    pub hang_endpoints: AtomicBool,
    keys: Mutex<HashMap<(AppId, DepotId), DepotKey>>,
    manifests: Mutex<HashMap<(DepotId, ManifestId), Manifest>>,
    chunks: Mutex<HashMap<ChunkId, Vec<u8>>>,
    corrupt_chunks: Mutex<HashSet<ChunkId>>,
    failing_hosts: Mutex<HashSet<String>>,
    pub chunk_requests: Mutex<Vec<ChunkId>>,
    pub manifest_requests: AtomicUsize,
    descriptor: Mutex<Option<AppDescriptor>>,
    pub descriptor_requests: AtomicUsize,
    notices: Mutex<VecDeque<ChangeNotice>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_endpoints(&self, batch: Vec<Endpoint>) {
        self.endpoint_batches.lock().push_back(batch);
    }

    pub fn set_key(&self, app: AppId, depot: DepotId, key: DepotKey) {
        self.keys.lock().insert((app, depot), key);
    }

    pub fn add_manifest(&self, manifest: Manifest) {
        self.manifests
            .lock()
            .insert((manifest.depot, manifest.id), manifest);
    }

    pub fn add_chunks(&self, payloads: Vec<(ChunkId, Vec<u8>)>) {
        self.chunks.lock().extend(payloads);
    }

    pub fn corrupt_chunk(&self, id: ChunkId) {
        self.corrupt_chunks.lock().insert(id);
    }

    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().insert(host.to_string());
    }

    pub fn set_descriptor(&self, descriptor: Option<AppDescriptor>) {
        *self.descriptor.lock() = descriptor;
    }

    pub fn push_notice(&self, notice: ChangeNotice) {
        self.notices.lock().push_back(notice);
    }

    pub fn chunk_request_count(&self) -> usize {
        self.chunk_requests.lock().len()
    }

    fn check_host(&self, endpoint: &Endpoint) -> SessionResult<()> {
        if self.failing_hosts.lock().contains(&endpoint.host) {
            return Err(SessionError::Transport(format!(
                "connection refused by {}",
                endpoint.host
            )));
        }
        Ok(())
    }
}

impl ContentSession for FakeSession {
    fn endpoints(&self) -> BoxFuture<'_, SessionResult<Vec<Endpoint>>> {
        Box::pin(async move {
            self.endpoint_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_endpoints.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.endpoint_batches.lock().pop_front().unwrap_or_default())
        })
    }

    fn depot_key(
        &self,
        app: AppId,
        depot: DepotId,
    ) -> BoxFuture<'_, SessionResult<Option<DepotKey>>> {
        Box::pin(async move { Ok(self.keys.lock().get(&(app, depot)).cloned()) })
    }

    fn manifest_request_code<'a>(
        &'a self,
        _depot: DepotId,
        _app: AppId,
        manifest: ManifestId,
        _branch: &'a str,
    ) -> BoxFuture<'a, SessionResult<u64>> {
        Box::pin(async move { Ok(manifest.get() ^ 0x5a5a) })
    }

    fn download_manifest<'a>(
        &'a self,
        depot: DepotId,
        manifest: ManifestId,
        _request_code: u64,
        endpoint: &'a Endpoint,
        _key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Manifest>> {
        Box::pin(async move {
            self.manifest_requests.fetch_add(1, Ordering::SeqCst);
            self.check_host(endpoint)?;
            self.manifests
                .lock()
                .get(&(depot, manifest))
                .cloned()
                .ok_or_else(|| SessionError::Unavailable(format!("manifest {}", manifest)))
        })
    }

    fn download_chunk<'a>(
        &'a self,
        _depot: DepotId,
        chunk: &'a ChunkDescriptor,
        endpoint: &'a Endpoint,
        _key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Vec<u8>>> {
        Box::pin(async move {
            self.chunk_requests.lock().push(chunk.id);
            self.check_host(endpoint)?;
            let mut data = self
                .chunks
                .lock()
                .get(&chunk.id)
                .cloned()
                .ok_or_else(|| SessionError::Unavailable(format!("chunk {}", chunk.id)))?;
            if self.corrupt_chunks.lock().contains(&chunk.id) {
                if let Some(first) = data.first_mut() {
                    *first ^= 0xff;
                }
            }
            Ok(data)
        })
    }

    fn app_descriptor(
        &self,
        _app: AppId,
        _expected_change: Option<ChangeNumber>,
    ) -> BoxFuture<'_, SessionResult<Option<AppDescriptor>>> {
        Box::pin(async move {
            self.descriptor_requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.descriptor.lock().clone())
        })
    }
}

impl ChangeFeed for FakeSession {
    fn changes_since(&self, since: ChangeNumber) -> BoxFuture<'_, SessionResult<ChangeNotice>> {
        Box::pin(async move {
            Ok(self.notices.lock().pop_front().unwrap_or(ChangeNotice {
                current_change: since,
                ..ChangeNotice::default()
            }))
        })
    }
}
