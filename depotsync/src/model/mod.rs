//! Domain types shared by every component.
//!
//! - Identifiers (`ids`): app, depot, manifest and change numbers
//! - Endpoints (`endpoint`): download servers circulated by the pool
//! - Manifests (`manifest`): file listings with per-file chunk layout
//! - App state (`app`): app descriptors, change notices and version rows

mod app;
mod endpoint;
mod ids;
mod manifest;

pub use app::{AppDescriptor, BranchInfo, BuildInfo, ChangeNotice, DepotDescriptor, DepotVersion};
pub use endpoint::{Endpoint, TransportKind};
pub use ids::{AppId, ChangeNumber, DepotId, ManifestId};
pub use manifest::{
    normalize_manifest_path, ChunkDescriptor, ChunkId, ContentDescriptor, ContentHash, DepotKey,
    FileEntry, FileFlags, Manifest, UnsafePathError,
};
