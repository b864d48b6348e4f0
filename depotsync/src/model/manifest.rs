//! Manifests, file entries and chunk descriptors.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{AppId, DepotId, ManifestId};

/// Identity of one manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub app: AppId,
    pub depot: DepotId,
    pub manifest: ManifestId,
}

impl ContentDescriptor {
    pub fn new(app: AppId, depot: DepotId, manifest: ManifestId) -> Self {
        Self {
            app,
            depot,
            manifest,
        }
    }
}

impl fmt::Display for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app {} depot {} manifest {}",
            self.app, self.depot, self.manifest
        )
    }
}

/// Content-addressed chunk identifier (SHA-1 sized).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId(#[serde(with = "hex::serde")] pub [u8; 20]);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

/// Whole-file SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(#[serde(with = "hex::serde")] pub [u8; 32]);

impl ContentHash {
    /// Hash an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

/// Depot decryption key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotKey(#[serde(with = "hex::serde")] pub Vec<u8>);

impl DepotKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DepotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepotKey(<{} bytes>)", self.0.len())
    }
}

/// Per-file flags from the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileFlags(pub u32);

impl FileFlags {
    pub const DIRECTORY: u32 = 0x40;

    pub fn directory() -> Self {
        Self(Self::DIRECTORY)
    }

    pub fn is_directory(&self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }
}

/// One contiguous byte range of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: ChunkId,
    /// Byte offset of the chunk inside the file.
    pub offset: u64,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    /// CRC-32 of the uncompressed chunk bytes.
    pub checksum: u32,
}

impl ChunkDescriptor {
    /// Block checksum of a chunk-sized buffer.
    pub fn block_checksum(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }

    /// Whether `data` has this chunk's length and block checksum.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() == self.uncompressed_len as usize && Self::block_checksum(data) == self.checksum
    }

    /// Exclusive end offset of the chunk.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.uncompressed_len)
    }
}

/// One file inside a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the content root, `/` or `\` separated.
    pub path: String,
    /// Total size in bytes.
    pub size: u64,
    #[serde(default)]
    pub flags: FileFlags,
    pub hash: ContentHash,
    #[serde(default)]
    pub chunks: Vec<ChunkDescriptor>,
}

impl FileEntry {
    pub fn is_directory(&self) -> bool {
        self.flags.is_directory()
    }

    /// Chunk recorded at exactly `offset`, if any.
    pub fn chunk_at(&self, offset: u64) -> Option<&ChunkDescriptor> {
        self.chunks.iter().find(|c| c.offset == offset)
    }

    /// Validated relative path of this entry.
    pub fn relative_path(&self) -> Result<PathBuf, UnsafePathError> {
        normalize_manifest_path(&self.path)
    }
}

/// File listing for one depot at one version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub depot: DepotId,
    pub id: ManifestId,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub names_encrypted: bool,
}

impl Manifest {
    /// A manifest can be materialized only with plain names and at least one file.
    pub fn is_usable(&self) -> bool {
        !self.names_encrypted && !self.files.is_empty()
    }

    /// Index of the file entries by path.
    pub fn index_by_path(&self) -> HashMap<&str, &FileEntry> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }

    /// Total number of chunks across all files.
    pub fn chunk_count(&self) -> usize {
        self.files.iter().map(|f| f.chunks.len()).sum()
    }
}

/// A manifest path that would escape the output directory.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsafe manifest path '{path}'")]
pub struct UnsafePathError {
    pub path: String,
}

/// Convert a manifest path into a safe relative path.
///
/// Backslashes are treated as separators. Absolute paths, drive prefixes
/// and `..` components are rejected.
pub fn normalize_manifest_path(path: &str) -> Result<PathBuf, UnsafePathError> {
    let unified = path.replace('\\', "/");
    let mut normalized = PathBuf::new();

    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnsafePathError {
                    path: path.to_string(),
                })
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(UnsafePathError {
            path: path.to_string(),
        });
    }

    Ok(normalized)
}
