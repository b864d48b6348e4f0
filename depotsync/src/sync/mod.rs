//! Synchronization passes.
//!
//! A pass walks every recorded change above the last-synced cursor in
//! ascending order. For each change:
//!
//! 1. Materialize every watched depot into a fresh temp directory, using the
//!    last synced content tree as the delta baseline
//! 2. Run the post-processor into a second temp directory
//! 3. Swap the processed tree into the repository and the raw tree into the
//!    content directory
//! 4. Publish
//! 5. Advance the last-synced cursor
//!
//! Any error aborts the pass. The temp directory of the failing change is
//! removed and the cursor stays on the last change that fully succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::DateTime;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::delta::{Baseline, DeltaEngine, DeltaError};
use crate::detect::SyncTrigger;
use crate::fetch::{FetchError, KeyRing};
use crate::model::{AppId, BuildInfo, ChangeNumber, ContentDescriptor, DepotId, ManifestId};
use crate::process::{copy_tree, PostProcessor, ProcessError};
use crate::publish::{PublishError, Publisher};
use crate::store::{load_cursor, Cursor, StoreError, StoreTransaction, VersionStore};

/// Result type for synchronization.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that abort a synchronization pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error("post-processing failed: {0}")]
    Process(#[from] ProcessError),

    #[error("publishing failed: {0}")]
    Publish(#[from] PublishError),

    #[error("no build information recorded for change {change}")]
    MissingBuildInfo { change: ChangeNumber },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Synchronizer settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub app: AppId,
    pub branch: String,
    /// Depots to download. Empty means every depot.
    pub depots: Vec<DepotId>,
    /// Scratch space for in-progress changes. Cleared at startup.
    pub temp_dir: PathBuf,
    /// Raw content of the last synced change. Baseline for deltas.
    pub content_dir: PathBuf,
    /// Repository handed to the publisher.
    pub repo_dir: PathBuf,
    /// Directory inside the repository that receives processed content.
    pub repo_content_subdir: String,
}

/// Result of one synchronization pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: Vec<ChangeNumber>,
}

/// Drives synchronization passes. At most one pass runs at a time.
pub struct Synchronizer {
    config: SyncConfig,
    store: Arc<dyn VersionStore>,
    keys: Arc<KeyRing>,
    engine: Arc<DeltaEngine>,
    processor: Arc<dyn PostProcessor>,
    publisher: Arc<dyn Publisher>,
    run_lock: tokio::sync::Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn VersionStore>,
        keys: Arc<KeyRing>,
        engine: Arc<DeltaEngine>,
        processor: Arc<dyn PostProcessor>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            config,
            store,
            keys,
            engine,
            processor,
            publisher,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Clear the temp root and make sure the working directories exist.
    pub async fn prepare_dirs(&self) -> SyncResult<()> {
        let temp = &self.config.temp_dir;
        match tokio::fs::remove_dir_all(temp).await {
            Ok(()) => debug!(path = %temp.display(), "Cleared temp directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(temp, e)),
        }

        for dir in [temp, &self.config.content_dir, &self.config.repo_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SyncError::io(dir, e))?;
        }
        Ok(())
    }

    /// Recorded changes that still need to be synchronized.
    pub fn pending_changes(&self) -> SyncResult<Vec<ChangeNumber>> {
        let last_synced = load_cursor(self.store.as_ref(), Cursor::LastSynced)?.unwrap_or_default();
        Ok(self.store.changes_after(self.config.app, last_synced)?)
    }

    /// Whether a pass is running right now.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Wait until no pass is running.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    /// Start a pass in the background.
    pub fn spawn_run(self: &Arc<Self>) -> JoinHandle<()> {
        let synchronizer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = synchronizer.run_synchronization().await {
                error!(error = %e, "Synchronization failed");
            }
        })
    }

    /// Synchronize every pending change, oldest first.
    pub async fn run_synchronization(&self) -> SyncResult<SyncSummary> {
        let _guard = self.run_lock.lock().await;

        let mut last_synced = load_cursor(self.store.as_ref(), Cursor::LastSynced)?;
        let changes = self
            .store
            .changes_after(self.config.app, last_synced.unwrap_or_default())?;

        if changes.is_empty() {
            debug!("Nothing to synchronize");
            return Ok(SyncSummary::default());
        }
        info!(pending = changes.len(), "Starting synchronization");

        let mut summary = SyncSummary::default();
        for change in changes {
            if let Err(e) = self.sync_change(change, last_synced).await {
                error!(change = %change, error = %e, "Change failed, cursor stays put");
                return Err(e);
            }

            self.store
                .apply(StoreTransaction::new().set_cursor(Cursor::LastSynced, change))?;
            last_synced = Some(change);
            summary.synced.push(change);
        }

        info!(synced = summary.synced.len(), "Synchronization complete");
        Ok(summary)
    }

    async fn sync_change(
        &self,
        change: ChangeNumber,
        previous: Option<ChangeNumber>,
    ) -> SyncResult<()> {
        let started = Instant::now();
        let app = self.config.app;
        let build = self
            .store
            .build_info(change)?
            .ok_or(SyncError::MissingBuildInfo { change })?;

        let depots = self.watched_depots(change)?;
        let baselines = match previous {
            Some(previous) => self.store.depot_manifests(previous, app)?,
            None => BTreeMap::new(),
        };
        info!(change = %change, build = build.build_id, depots = depots.len(), "Synchronizing change");

        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| SyncError::io(&self.config.temp_dir, e))?;
        let work = tempfile::Builder::new()
            .prefix(&format!("change-{}-", change))
            .tempdir_in(&self.config.temp_dir)
            .map_err(|e| SyncError::io(&self.config.temp_dir, e))?;
        let download = work.path().join("download");
        let processed = work.path().join("processed");
        for dir in [&download, &processed] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SyncError::io(dir, e))?;
        }

        for (depot, manifest) in depots {
            self.download_depot(depot, manifest, baselines.get(&depot).copied(), &download)
                .await?;
        }
        let downloaded = started.elapsed();

        self.processor.process(&download, &processed).await?;
        let processed_at = started.elapsed();

        let published = self.config.repo_dir.join(&self.config.repo_content_subdir);
        replace_dir(&processed, &published).await?;
        replace_dir(&download, &self.config.content_dir).await?;

        // Both trees are already in place, so a publish failure leaves the
        // content dir one change ahead of the cursor. Hash checks recover it.
        if let Err(e) = self
            .publisher
            .publish(&self.config.repo_dir, &commit_message(&build))
            .await
        {
            warn!(change = %change, "Publish failed after swap, baseline tree is ahead of cursor");
            return Err(e.into());
        }

        info!(
            change = %change,
            download_ms = downloaded.as_millis() as u64,
            process_ms = (processed_at - downloaded).as_millis() as u64,
            publish_ms = (started.elapsed() - processed_at).as_millis() as u64,
            processor = self.processor.name(),
            "Change synchronized"
        );
        Ok(())
    }

    fn watched_depots(&self, change: ChangeNumber) -> SyncResult<BTreeMap<DepotId, ManifestId>> {
        let mut depots = self.store.depot_manifests(change, self.config.app)?;
        if !self.config.depots.is_empty() {
            depots.retain(|depot, _| self.config.depots.contains(depot));
        }
        Ok(depots)
    }

    async fn download_depot(
        &self,
        depot: DepotId,
        manifest: ManifestId,
        baseline: Option<ManifestId>,
        out: &Path,
    ) -> SyncResult<()> {
        let app = self.config.app;
        let branch = &self.config.branch;
        let key = self.keys.key(app, depot).await?;

        let target = self
            .engine
            .fetcher()
            .fetch_manifest(ContentDescriptor::new(app, depot, manifest), &key, branch)
            .await?;
        if !target.is_usable() {
            warn!(
                depot = %depot,
                manifest = %manifest,
                files = target.files.len(),
                names_encrypted = target.names_encrypted,
                "Manifest has no usable files, skipping depot"
            );
            return Ok(());
        }

        let content_root = &self.config.content_dir;
        let previous = match baseline {
            Some(id) if content_root.is_dir() => {
                self.engine
                    .load_baseline(ContentDescriptor::new(app, depot, id), &key, branch)
                    .await
            }
            _ => None,
        };

        self.engine
            .materialize(
                &target,
                &key,
                previous.as_ref().map(|m| Baseline {
                    manifest: m,
                    root: content_root,
                }),
                out,
            )
            .await?;
        Ok(())
    }
}

impl SyncTrigger for Arc<Synchronizer> {
    fn trigger(&self) {
        self.spawn_run();
    }
}

/// Commit message for a synchronized build.
pub fn commit_message(build: &BuildInfo) -> String {
    match DateTime::from_timestamp(build.time_updated, 0) {
        Some(time) => format!("build {} on {}", build.build_id, time.to_rfc2822()),
        None => format!("build {} on {}", build.build_id, build.time_updated),
    }
}

/// Replace `dest` with `src`, renaming when possible.
async fn replace_dir(src: &Path, dest: &Path) -> SyncResult<()> {
    match tokio::fs::remove_dir_all(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::io(dest, e)),
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }

    if let Err(e) = tokio::fs::rename(src, dest).await {
        debug!(from = %src.display(), to = %dest.display(), error = %e, "Rename failed, copying");
        let (from, to) = (src.to_path_buf(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| SyncError::Process(ProcessError::Task(e.to_string())))??;
    }
    Ok(())
}
