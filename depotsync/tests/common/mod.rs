//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use depotsync::model::{
    AppDescriptor, AppId, BranchInfo, ChangeNotice, ChangeNumber, ChunkDescriptor, ChunkId,
    ContentHash, DepotDescriptor, DepotId, DepotKey, Endpoint, FileEntry, FileFlags, Manifest,
    ManifestId, TransportKind,
};
use depotsync::publish::{PublishError, PublishResult, Publisher};
use depotsync::session::{BoxFuture, ChangeFeed, ContentSession, SessionError, SessionResult};

pub const APP: AppId = AppId(440);
pub const BRANCH: &str = "public";
pub const CHUNK_SIZE: usize = 4096;

/// Chunked file entry plus the chunk payloads it refers to.
pub fn file_entry(path: &str, data: &[u8], chunk_size: usize) -> (FileEntry, Vec<(ChunkId, Vec<u8>)>) {
    let mut chunks = Vec::new();
    let mut payloads = Vec::new();
    for (index, piece) in data.chunks(chunk_size).enumerate() {
        let digest = Sha256::digest(piece);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest[..20]);
        let chunk = ChunkDescriptor {
            id: ChunkId(id),
            offset: (index * chunk_size) as u64,
            compressed_len: piece.len() as u32,
            uncompressed_len: piece.len() as u32,
            checksum: ChunkDescriptor::block_checksum(piece),
        };
        chunks.push(chunk);
        payloads.push((chunk.id, piece.to_vec()));
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

/// Deterministic pseudo-random bytes.
pub fn bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) as u8)
        .collect()
}

/// In-memory upstream serving one app.
#[derive(Default)]
pub struct FakeUpstream {
    endpoints: Mutex<Vec<Endpoint>>,
    keys: Mutex<HashMap<(AppId, DepotId), DepotKey>>,
    manifests: Mutex<HashMap<(DepotId, ManifestId), Manifest>>,
    chunks: Mutex<HashMap<ChunkId, Vec<u8>>>,
    withheld: Mutex<HashSet<ChunkId>>,
    descriptor: Mutex<Option<AppDescriptor>>,
    notices: Mutex<VecDeque<ChangeNotice>>,
    pub chunk_requests: Mutex<Vec<ChunkId>>,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        let upstream = Self::default();
        *upstream.endpoints.lock() = (1..=3)
            .map(|i| Endpoint::new(format!("cache{}.example", i), 443, TransportKind::Https))
            .collect();
        Arc::new(upstream)
    }

    pub fn set_key(&self, depot: DepotId) {
        self.keys
            .lock()
            .insert((APP, depot), DepotKey(vec![depot.get() as u8; 32]));
    }

    /// Publish a depot manifest built from `files`, returning its chunk ids.
    pub fn add_manifest(&self, depot: DepotId, id: ManifestId, files: &[(&str, Vec<u8>)]) -> Vec<ChunkId> {
        let mut entries = Vec::new();
        let mut ids = Vec::new();
        for (path, data) in files {
            let (entry, payloads) = file_entry(path, data, CHUNK_SIZE);
            ids.extend(payloads.iter().map(|(id, _)| *id));
            self.chunks.lock().extend(payloads);
            entries.push(entry);
        }
        self.insert_manifest(Manifest {
            depot,
            id,
            files: entries,
            names_encrypted: false,
        });
        ids
    }

    pub fn insert_manifest(&self, manifest: Manifest) {
        self.manifests
            .lock()
            .insert((manifest.depot, manifest.id), manifest);
    }

    pub fn add_chunks(&self, payloads: Vec<(ChunkId, Vec<u8>)>) {
        self.chunks.lock().extend(payloads);
    }

    /// Make chunks unavailable until [`FakeUpstream::release_chunks`].
    pub fn withhold_chunks(&self, ids: &[ChunkId]) {
        self.withheld.lock().extend(ids.iter().copied());
    }

    pub fn release_chunks(&self) {
        self.withheld.lock().clear();
    }

    /// Announce a new change whose descriptor lists `depots`.
    pub fn announce(&self, change: u32, build_id: u32, depots: &[(DepotId, ManifestId)]) {
        self.set_descriptor(change, build_id, depots);
        self.notices.lock().push_back(ChangeNotice {
            current_change: ChangeNumber(change),
            requires_full_update: false,
            app_changes: BTreeMap::from([(APP, ChangeNumber(change))]),
        });
    }

    pub fn set_descriptor(&self, change: u32, build_id: u32, depots: &[(DepotId, ManifestId)]) {
        *self.descriptor.lock() = Some(AppDescriptor {
            app: APP,
            change_number: ChangeNumber(change),
            depots: depots
                .iter()
                .map(|(depot, manifest)| DepotDescriptor {
                    depot: *depot,
                    manifests: BTreeMap::from([(BRANCH.to_string(), *manifest)]),
                })
                .collect(),
            branches: BTreeMap::from([(
                BRANCH.to_string(),
                BranchInfo {
                    build_id,
                    time_updated: 1_700_000_000,
                },
            )]),
        });
    }

    pub fn push_notice(&self, notice: ChangeNotice) {
        self.notices.lock().push_back(notice);
    }

    pub fn chunk_request_count(&self) -> usize {
        self.chunk_requests.lock().len()
    }
}

impl ContentSession for FakeUpstream {
    fn endpoints(&self) -> BoxFuture<'_, SessionResult<Vec<Endpoint>>> {
        Box::pin(async move { Ok(self.endpoints.lock().clone()) })
    }

    fn depot_key(&self, app: AppId, depot: DepotId) -> BoxFuture<'_, SessionResult<Option<DepotKey>>> {
        Box::pin(async move { Ok(self.keys.lock().get(&(app, depot)).cloned()) })
    }

    fn manifest_request_code<'a>(
        &'a self,
        _depot: DepotId,
        _app: AppId,
        manifest: ManifestId,
        _branch: &'a str,
    ) -> BoxFuture<'a, SessionResult<u64>> {
        Box::pin(async move { Ok(manifest.get().rotate_left(7)) })
    }

    fn download_manifest<'a>(
        &'a self,
        depot: DepotId,
        manifest: ManifestId,
        _request_code: u64,
        _endpoint: &'a Endpoint,
        _key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Manifest>> {
        Box::pin(async move {
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
        _endpoint: &'a Endpoint,
        _key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Vec<u8>>> {
        Box::pin(async move {
            self.chunk_requests.lock().push(chunk.id);
            if self.withheld.lock().contains(&chunk.id) {
                return Err(SessionError::Unavailable(format!("chunk {}", chunk.id)));
            }
            self.chunks
                .lock()
                .get(&chunk.id)
                .cloned()
                .ok_or_else(|| SessionError::Unavailable(format!("chunk {}", chunk.id)))
        })
    }

    fn app_descriptor(
        &self,
        _app: AppId,
        _expected_change: Option<ChangeNumber>,
    ) -> BoxFuture<'_, SessionResult<Option<AppDescriptor>>> {
        Box::pin(async move { Ok(self.descriptor.lock().clone()) })
    }
}

impl ChangeFeed for FakeUpstream {
    fn changes_since(&self, since: ChangeNumber) -> BoxFuture<'_, SessionResult<ChangeNotice>> {
        Box::pin(async move {
            Ok(self.notices.lock().pop_front().unwrap_or(ChangeNotice {
                current_change: since,
                ..ChangeNotice::default()
            }))
        })
    }
}

/// Publisher that records commit messages.
#[derive(Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(&'a self, _dir: &'a Path, message: &'a str) -> BoxFuture<'a, PublishResult<()>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PublishError::Git {
                    step: "commit",
                    code: Some(128),
                    stderr: "fatal: unable to write new index file".to_string(),
                });
            }
            self.messages.lock().push(message.to_string());
            Ok(())
        })
    }
}
