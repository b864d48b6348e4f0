//! Change detector.
//!
//! Polls the change feed, decides whether the watched app really changed,
//! records version rows and advances the last-seen cursor in one
//! transaction, then triggers a synchronization pass.
//!
//! ```text
//! Idle ──start_polling──► Polling ──notice──► handle_notice
//!                            ▲                    │
//!                            └──── poll_interval ◄┘ (trigger on Recorded)
//! ```
//!
//! Polling loops are stopped through a [`CancellationToken`]. Cancellation
//! is only observed between polls, so an upstream call that is already in
//! flight always completes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{AppDescriptor, AppId, BuildInfo, ChangeNotice, ChangeNumber, DepotVersion};
use crate::session::{ChangeFeed, ContentSession, SessionError};
use crate::store::{load_cursor, Cursor, StoreError, StoreTransaction, VersionStore};

/// Default pause between two change feed polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Result type for detection.
pub type DetectResult<T> = Result<T, DetectError>;

/// Errors from the change detector.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("change feed request failed: {0}")]
    Feed(#[source] SessionError),

    #[error("failed to fetch descriptor of app {app}: {source}")]
    Descriptor {
        app: AppId,
        #[source]
        source: SessionError,
    },

    #[error("app {app} is unknown upstream")]
    DescriptorMissing { app: AppId },

    #[error("app {app} has no build information for branch '{branch}'")]
    MissingBranchInfo { app: AppId, branch: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Receives "a new version was recorded" signals.
pub trait SyncTrigger: Send + Sync {
    /// Request a synchronization pass. Must not block.
    fn trigger(&self);
}

/// What [`ChangeDetector::handle_notice`] did with a notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// The notice's change number equals last-seen.
    AlreadySeen,
    /// The watched app was not part of the notice.
    NotAffected,
    /// The app was listed but its depot manifests did not change.
    FalsePositive,
    /// New version rows were recorded under this change number.
    Recorded(ChangeNumber),
}

/// Detector settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectorConfig {
    pub app: AppId,
    pub branch: String,
    pub poll_interval: Duration,
}

impl DetectorConfig {
    pub fn new(app: AppId, branch: impl Into<String>) -> Self {
        Self {
            app,
            branch: branch.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Polls for upstream changes of one app.
pub struct ChangeDetector {
    config: DetectorConfig,
    feed: Arc<dyn ChangeFeed>,
    session: Arc<dyn ContentSession>,
    store: Arc<dyn VersionStore>,
    trigger: Arc<dyn SyncTrigger>,
    last_seen: Mutex<ChangeNumber>,
    polling: Mutex<Option<CancellationToken>>,
    handling: tokio::sync::Mutex<()>,
}

impl ChangeDetector {
    /// Create a detector, restoring last-seen from the store.
    ///
    /// Last-seen starts at the stored cursor, else the newest recorded
    /// change of the app, else 1.
    pub fn new(
        config: DetectorConfig,
        feed: Arc<dyn ChangeFeed>,
        session: Arc<dyn ContentSession>,
        store: Arc<dyn VersionStore>,
        trigger: Arc<dyn SyncTrigger>,
    ) -> DetectResult<Self> {
        let last_seen = match load_cursor(store.as_ref(), Cursor::LastSeen)? {
            Some(change) if change.get() > 0 => change,
            _ => store
                .latest_change(config.app)?
                .unwrap_or(ChangeNumber(1)),
        };
        info!(app = %config.app, last_seen = %last_seen, "Previous change number restored");

        Ok(Self {
            config,
            feed,
            session,
            store,
            trigger,
            last_seen: Mutex::new(last_seen),
            polling: Mutex::new(None),
            handling: tokio::sync::Mutex::new(()),
        })
    }

    /// Last change number handled.
    pub fn last_seen(&self) -> ChangeNumber {
        *self.last_seen.lock()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Whether a polling loop is active.
    pub fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Start a polling loop, stopping any previous one.
    pub fn start_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.polling.lock().replace(token.clone()) {
            previous.cancel();
        }

        let detector = Arc::clone(self);
        tokio::spawn(async move { detector.poll(token).await })
    }

    /// Stop the current polling loop after its in-flight poll.
    pub fn stop_polling(&self) {
        if let Some(token) = self.polling.lock().take() {
            token.cancel();
            info!("Polling stopped");
        }
    }

    /// Poll until `token` is cancelled.
    pub async fn poll(&self, token: CancellationToken) {
        info!(
            app = %self.config.app,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Polling for changes"
        );

        while !token.is_cancelled() {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Change poll failed");
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        debug!("Polling loop exited");
    }

    /// Ask the feed for changes since last-seen and handle the answer.
    pub async fn poll_once(&self) -> DetectResult<NoticeOutcome> {
        let notice = self
            .feed
            .changes_since(self.last_seen())
            .await
            .map_err(DetectError::Feed)?;
        self.handle_notice(notice).await
    }

    /// Handle one change notice.
    ///
    /// Version rows, build info and the last-seen cursor are committed in a
    /// single transaction. When the descriptor cannot be fetched nothing is
    /// committed and last-seen stays put, so the next poll sees the change
    /// again.
    pub async fn handle_notice(&self, notice: ChangeNotice) -> DetectResult<NoticeOutcome> {
        let _guard = self.handling.lock().await;
        let app = self.config.app;

        if notice.current_change == self.last_seen() {
            return Ok(NoticeOutcome::AlreadySeen);
        }

        let app_change = notice.app_changes.get(&app).copied();
        if notice.requires_full_update {
            info!(change = %notice.current_change, "Full app update required");
        }
        let needs_update = notice.requires_full_update || app_change.is_some();

        let mut transaction = StoreTransaction::new();
        let mut outcome = NoticeOutcome::NotAffected;

        if needs_update {
            let descriptor = self.fetch_descriptor(app_change).await?;
            let change = descriptor.change_number;

            if self.differs_from_previous(&descriptor)? {
                transaction = self.record(transaction, &descriptor)?;
                outcome = NoticeOutcome::Recorded(change);
            } else {
                info!(change = %change, "Depot manifests unchanged, ignoring notice");
                outcome = NoticeOutcome::FalsePositive;
            }
        }

        transaction = transaction.set_cursor(Cursor::LastSeen, notice.current_change);
        self.store.apply(transaction)?;
        *self.last_seen.lock() = notice.current_change;

        if let NoticeOutcome::Recorded(change) = outcome {
            info!(change = %change, "Update needed");
            self.trigger.trigger();
        }
        Ok(outcome)
    }

    async fn fetch_descriptor(
        &self,
        expected: Option<ChangeNumber>,
    ) -> DetectResult<AppDescriptor> {
        let app = self.config.app;
        let descriptor = self
            .session
            .app_descriptor(app, expected)
            .await
            .map_err(|source| DetectError::Descriptor { app, source })?
            .ok_or(DetectError::DescriptorMissing { app })?;

        if let Some(expected) = expected {
            if descriptor.change_number != expected {
                warn!(
                    expected = %expected,
                    actual = %descriptor.change_number,
                    "Descriptor change number differs from notice"
                );
            }
        }
        Ok(descriptor)
    }

    /// Compare against the newest change recorded at or below this one.
    ///
    /// A full-update notice can return a descriptor for a change that is
    /// already recorded, in which case that change is its own baseline.
    fn differs_from_previous(&self, descriptor: &AppDescriptor) -> DetectResult<bool> {
        let app = self.config.app;
        let current = descriptor.depot_manifests(&self.config.branch);

        let mut previous = self.store.depot_manifests(descriptor.change_number, app)?;
        if previous.is_empty() {
            if let Some(change) = self
                .store
                .latest_change_before(app, descriptor.change_number)?
            {
                previous = self.store.depot_manifests(change, app)?;
            }
        }

        if current.len() != previous.len() {
            return Ok(true);
        }
        Ok(current
            .iter()
            .any(|(depot, manifest)| previous.get(depot) != Some(manifest)))
    }

    fn record(
        &self,
        mut transaction: StoreTransaction,
        descriptor: &AppDescriptor,
    ) -> DetectResult<StoreTransaction> {
        let app = self.config.app;
        let branch = &self.config.branch;
        let change = descriptor.change_number;

        let info = descriptor
            .branch_info(branch)
            .ok_or_else(|| DetectError::MissingBranchInfo {
                app,
                branch: branch.clone(),
            })?;

        for (depot, manifest) in descriptor.depot_manifests(branch) {
            debug!(change = %change, depot = %depot, manifest = %manifest, "Recording depot version");
            transaction = transaction.upsert_depot_version(DepotVersion {
                change,
                app,
                depot,
                manifest,
            });
        }

        Ok(transaction.upsert_build_info(BuildInfo {
            change,
            branch: branch.clone(),
            build_id: info.build_id,
            time_updated: info.time_updated,
        }))
    }
}
