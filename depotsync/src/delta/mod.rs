//! Delta download engine.
//!
//! Materializes a manifest into a directory, reusing bytes from the last
//! synchronized content tree wherever they are provably identical.
//!
//! # Per-file flow
//!
//! ```text
//! Plan ──► Fetch ──► Verify ──► Verified
//!                      │ mismatch
//!                      ▼
//!            full re-download ──► Verify ──► Verified | CorruptionAfterRetry
//! ```
//!
//! Whole-file reuse (same content hash as the previous version) copies the
//! previous file and goes straight to Verify. Directories are created empty.
//! Files already present at the destination are left alone.

mod checksum;
mod plan;

pub use checksum::{hash_file, hash_file_blocking};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::fetch::Fetcher;
use crate::model::{
    ChunkDescriptor, ChunkId, ContentDescriptor, ContentHash, DepotId, DepotKey, FileEntry,
    Manifest, UnsafePathError,
};

/// Default number of chunk downloads in flight per file.
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 16;

/// Result type for delta operations.
pub type DeltaResult<T> = Result<T, DeltaError>;

/// Errors from the delta engine.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    UnsafePath(#[from] UnsafePathError),

    /// A chunk could not be obtained after every fetch attempt.
    #[error("chunk {chunk} at offset {offset} of '{file}' unavailable")]
    ChunkUnavailable {
        file: String,
        chunk: ChunkId,
        offset: u64,
    },

    /// The file failed hash verification twice.
    #[error("'{file}' failed verification after full re-download: expected {expected}, got {actual}")]
    CorruptionAfterRetry {
        file: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl DeltaError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Engine tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaConfig {
    pub chunk_concurrency: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
        }
    }
}

/// Previous version of a depot that is present on disk.
#[derive(Clone, Copy, Debug)]
pub struct Baseline<'a> {
    pub manifest: &'a Manifest,
    pub root: &'a Path,
}

/// Counters for one materialized manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestReport {
    pub files_verified: usize,
    pub files_reused_whole: usize,
    pub files_skipped: usize,
    pub files_retried: usize,
    pub directories: usize,
    pub chunks_reused: usize,
    pub chunks_downloaded: usize,
}

impl ManifestReport {
    fn absorb(&mut self, outcome: &FileOutcome) {
        self.chunks_reused += outcome.chunks_reused;
        self.chunks_downloaded += outcome.chunks_downloaded;
        if outcome.reused_whole {
            self.files_reused_whole += 1;
        }
    }
}

#[derive(Debug, Default)]
struct FileOutcome {
    reused_whole: bool,
    chunks_reused: usize,
    chunks_downloaded: usize,
}

/// Materializes manifests through the fetch layer.
pub struct DeltaEngine {
    fetcher: Arc<Fetcher>,
    config: DeltaConfig,
}

impl DeltaEngine {
    pub fn new(fetcher: Arc<Fetcher>, config: DeltaConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Fetch a baseline manifest, degrading to `None` on any failure.
    pub async fn load_baseline(
        &self,
        descriptor: ContentDescriptor,
        key: &DepotKey,
        branch: &str,
    ) -> Option<Manifest> {
        match self.fetcher.fetch_manifest(descriptor, key, branch).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(
                    descriptor = %descriptor,
                    error = %e,
                    "Baseline manifest unavailable, falling back to full download"
                );
                None
            }
        }
    }

    /// Materialize `manifest` into `out`.
    ///
    /// On any error the whole `out` directory is removed before the error is
    /// returned.
    pub async fn materialize(
        &self,
        manifest: &Manifest,
        key: &DepotKey,
        baseline: Option<Baseline<'_>>,
        out: &Path,
    ) -> DeltaResult<ManifestReport> {
        let started = Instant::now();
        match self.materialize_files(manifest, key, baseline, out).await {
            Ok(report) => {
                info!(
                    depot = %manifest.depot,
                    manifest = %manifest.id,
                    files_verified = report.files_verified,
                    files_reused_whole = report.files_reused_whole,
                    files_skipped = report.files_skipped,
                    files_retried = report.files_retried,
                    chunks_reused = report.chunks_reused,
                    chunks_downloaded = report.chunks_downloaded,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Manifest materialized"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    depot = %manifest.depot,
                    manifest = %manifest.id,
                    error = %e,
                    "Manifest materialization failed, removing output"
                );
                if let Err(rm) = tokio::fs::remove_dir_all(out).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %out.display(), error = %rm, "Failed to remove partial output");
                    }
                }
                Err(e)
            }
        }
    }

    async fn materialize_files(
        &self,
        manifest: &Manifest,
        key: &DepotKey,
        baseline: Option<Baseline<'_>>,
        out: &Path,
    ) -> DeltaResult<ManifestReport> {
        let mut entries = Vec::with_capacity(manifest.files.len());
        for entry in &manifest.files {
            entries.push((entry.relative_path()?, entry));
        }

        let mut directories = BTreeSet::new();
        directories.insert(out.to_path_buf());
        for (relative, entry) in &entries {
            let path = out.join(relative);
            if entry.is_directory() {
                directories.insert(path);
            } else if let Some(parent) = path.parent() {
                directories.insert(parent.to_path_buf());
            }
        }
        for dir in &directories {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DeltaError::io(dir, e))?;
        }

        let previous: HashMap<PathBuf, &FileEntry> = baseline
            .map(|b| {
                b.manifest
                    .files
                    .iter()
                    .filter(|f| !f.is_directory())
                    .filter_map(|f| f.relative_path().ok().map(|p| (p, f)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = ManifestReport::default();
        for (relative, entry) in entries {
            if entry.is_directory() {
                report.directories += 1;
                continue;
            }

            let output = out.join(&relative);
            if tokio::fs::try_exists(&output).await.unwrap_or(false) {
                debug!(file = %entry.path, "Already present, skipping");
                report.files_skipped += 1;
                continue;
            }

            let prior = match (baseline, previous.get(&relative)) {
                (Some(b), Some(prev)) => Some((*prev, b.root.join(&relative))),
                _ => None,
            };

            self.materialize_file(manifest.depot, entry, key, prior, &output, &mut report)
                .await?;
        }

        Ok(report)
    }

    async fn materialize_file(
        &self,
        depot: DepotId,
        entry: &FileEntry,
        key: &DepotKey,
        previous: Option<(&FileEntry, PathBuf)>,
        output: &Path,
        report: &mut ManifestReport,
    ) -> DeltaResult<()> {
        let outcome = self.build_file(depot, entry, key, previous, output).await?;
        report.absorb(&outcome);

        let actual = hash_file_blocking(output.to_path_buf()).await?;
        if actual == entry.hash {
            report.files_verified += 1;
            return Ok(());
        }

        warn!(
            file = %entry.path,
            expected = %entry.hash,
            actual = %actual,
            "Hash mismatch, re-downloading without baseline"
        );
        report.files_retried += 1;

        let outcome = self.build_file(depot, entry, key, None, output).await?;
        report.absorb(&outcome);

        let actual = hash_file_blocking(output.to_path_buf()).await?;
        if actual != entry.hash {
            error!(
                file = %entry.path,
                expected = %entry.hash,
                actual = %actual,
                "Hash mismatch after full re-download"
            );
            return Err(DeltaError::CorruptionAfterRetry {
                file: entry.path.clone(),
                expected: entry.hash,
                actual,
            });
        }

        report.files_verified += 1;
        Ok(())
    }

    /// Write `entry` to `output` from the previous file and fresh chunks.
    async fn build_file(
        &self,
        depot: DepotId,
        entry: &FileEntry,
        key: &DepotKey,
        previous: Option<(&FileEntry, PathBuf)>,
        output: &Path,
    ) -> DeltaResult<FileOutcome> {
        if let Some((prev, prev_path)) = &previous {
            if prev.hash == entry.hash {
                match tokio::fs::copy(prev_path, output).await {
                    Ok(_) => {
                        debug!(file = %entry.path, "Unchanged, copied from previous version");
                        return Ok(FileOutcome {
                            reused_whole: true,
                            ..FileOutcome::default()
                        });
                    }
                    Err(e) => {
                        debug!(file = %entry.path, error = %e, "Whole-file copy failed, planning chunks");
                    }
                }
            }
        }

        let plan = {
            let target = entry.clone();
            let output = output.to_path_buf();
            let previous = previous.map(|(prev, path)| (prev.clone(), path));
            tokio::task::spawn_blocking(move || {
                plan::prepare_file(
                    &target,
                    &output,
                    previous.as_ref().map(|(prev, path)| (prev, path.as_path())),
                )
            })
            .await
            .map_err(|e| DeltaError::Task(e.to_string()))??
        };

        let downloaded = plan.pending.len();
        if downloaded > 0 {
            self.fetch_chunks(depot, entry, key, plan.pending, output)
                .await?;
        }

        debug!(
            file = %entry.path,
            chunks_reused = plan.reused,
            chunks_downloaded = downloaded,
            "File assembled"
        );
        Ok(FileOutcome {
            reused_whole: false,
            chunks_reused: plan.reused,
            chunks_downloaded: downloaded,
        })
    }

    /// Fetch `pending` concurrently and write each chunk at its offset.
    async fn fetch_chunks(
        &self,
        depot: DepotId,
        entry: &FileEntry,
        key: &DepotKey,
        pending: Vec<ChunkDescriptor>,
        output: &Path,
    ) -> DeltaResult<()> {
        let file = plan::open_for_writes(output)?;
        let mut file = tokio::fs::File::from_std(file);

        let fetcher = &self.fetcher;
        let mut downloads = stream::iter(pending.into_iter().map(|chunk| async move {
            let data = fetcher.fetch_chunk(depot, &chunk, key).await;
            (chunk, data)
        }))
        .buffer_unordered(self.config.chunk_concurrency.max(1));

        while let Some((chunk, data)) = downloads.next().await {
            let data = data.ok_or_else(|| DeltaError::ChunkUnavailable {
                file: entry.path.clone(),
                chunk: chunk.id,
                offset: chunk.offset,
            })?;
            file.seek(std::io::SeekFrom::Start(chunk.offset))
                .await
                .map_err(|e| DeltaError::io(output, e))?;
            file.write_all(&data)
                .await
                .map_err(|e| DeltaError::io(output, e))?;
        }

        file.flush().await.map_err(|e| DeltaError::io(output, e))?;
        Ok(())
    }
}
