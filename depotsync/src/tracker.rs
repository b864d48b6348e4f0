//! Top-level wiring of the tracker.
//!
//! [`Tracker`] owns every component for one watched app and coordinates
//! startup, operation and shutdown.
//!
//! # Startup sequence
//!
//! 1. Working directories are prepared (temp root cleared)
//! 2. The endpoint pool is filled
//! 3. Changes recorded but not yet synchronized are picked up
//! 4. The change detector starts polling
//!
//! # Example
//!
//! ```ignore
//! let config = ConfigFile::load(&path)?;
//! let tracker = Tracker::from_config(&config)?;
//! tracker.start().await?;
//! // ...
//! tracker.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigFile};
use crate::delta::{DeltaConfig, DeltaEngine};
use crate::detect::{ChangeDetector, DetectError, DetectorConfig, NoticeOutcome, SyncTrigger};
use crate::fetch::{Fetcher, KeyRing, RetryPolicy};
use crate::gateway::{GatewayConfig, GatewaySession};
use crate::model::{AppId, ChangeNumber};
use crate::pool::{EndpointPool, PoolConfig};
use crate::process::{CommandProcessor, MirrorProcessor, PostProcessor};
use crate::publish::{GitPublisher, NoopPublisher, Publisher};
use crate::session::{ChangeFeed, ContentSession, SessionError};
use crate::store::{load_cursor, Cursor, LocalStore, StoreError, VersionStore};
use crate::sync::{SyncConfig, SyncError, Synchronizer};

/// Result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors from building or driving the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up upstream session: {0}")]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Component settings, usually derived from a [`ConfigFile`].
#[derive(Clone, Debug)]
pub struct TrackerSettings {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub delta: DeltaConfig,
    pub detector: DetectorConfig,
    pub sync: SyncConfig,
}

impl TrackerSettings {
    pub fn from_config(config: &ConfigFile) -> TrackerResult<Self> {
        Ok(Self {
            pool: config.pool_config(),
            retry: config.retry_policy(),
            delta: config.delta_config(),
            detector: config.detector_config()?,
            sync: config.sync_config()?,
        })
    }
}

/// External collaborators the tracker is built around.
pub struct TrackerParts {
    pub session: Arc<dyn ContentSession>,
    pub feed: Arc<dyn ChangeFeed>,
    pub store: Arc<dyn VersionStore>,
    pub processor: Arc<dyn PostProcessor>,
    pub publisher: Arc<dyn Publisher>,
}

/// Cursor positions and the synchronization backlog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerStatus {
    pub app: AppId,
    pub last_seen: Option<ChangeNumber>,
    pub last_synced: Option<ChangeNumber>,
    /// Recorded changes not yet synchronized, oldest first.
    pub pending: Vec<ChangeNumber>,
}

/// Read the tracker status straight from a store.
pub fn read_status(store: &dyn VersionStore, app: AppId) -> TrackerResult<TrackerStatus> {
    let last_seen = load_cursor(store, Cursor::LastSeen)?;
    let last_synced = load_cursor(store, Cursor::LastSynced)?;
    let pending = store.changes_after(app, last_synced.unwrap_or_default())?;
    Ok(TrackerStatus {
        app,
        last_seen,
        last_synced,
        pending,
    })
}

/// Starts a background pass only while the tracker is watching.
///
/// One-shot passes run the synchronizer themselves after detection.
struct WatchTrigger {
    synchronizer: Arc<Synchronizer>,
    armed: AtomicBool,
}

impl SyncTrigger for WatchTrigger {
    fn trigger(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.synchronizer.trigger();
        } else {
            debug!("Not watching, synchronization left to caller");
        }
    }
}

/// Owns and coordinates the components for one app.
pub struct Tracker {
    store: Arc<dyn VersionStore>,
    pool: Arc<EndpointPool>,
    synchronizer: Arc<Synchronizer>,
    detector: Arc<ChangeDetector>,
    trigger: Arc<WatchTrigger>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Build a tracker from a config file, using the HTTP gateway, the local
    /// store file and the configured processor and publisher.
    pub fn from_config(config: &ConfigFile) -> TrackerResult<Self> {
        let settings = TrackerSettings::from_config(config)?;

        let gateway = Arc::new(GatewaySession::new(GatewayConfig {
            base_url: config.gateway.url.clone(),
            timeout: config.gateway.timeout,
        })?);
        let store = Arc::new(LocalStore::open(config.paths.store_file())?);

        let processor: Arc<dyn PostProcessor> = match &config.processor.command {
            Some(program) => {
                let mut processor =
                    CommandProcessor::new(program).with_args(config.processor.args.clone());
                if let Some(dir) = &config.processor.working_dir {
                    processor = processor.with_working_dir(dir);
                }
                Arc::new(processor)
            }
            None => Arc::new(MirrorProcessor),
        };

        let publisher: Arc<dyn Publisher> = if config.publisher.enabled {
            Arc::new(GitPublisher::new(config.publisher.git.clone()))
        } else {
            Arc::new(NoopPublisher)
        };

        Self::assemble(
            settings,
            TrackerParts {
                session: gateway.clone(),
                feed: gateway,
                store,
                processor,
                publisher,
            },
        )
    }

    /// Wire the components together.
    pub fn assemble(settings: TrackerSettings, parts: TrackerParts) -> TrackerResult<Self> {
        let app = settings.sync.app;
        let pool = Arc::new(EndpointPool::new(app, parts.session.clone(), settings.pool));
        let fetcher = Arc::new(Fetcher::new(
            parts.session.clone(),
            Arc::clone(&pool),
            settings.retry,
        ));
        let keys = Arc::new(KeyRing::new(parts.session.clone()));
        let engine = Arc::new(DeltaEngine::new(fetcher, settings.delta));

        let synchronizer = Arc::new(Synchronizer::new(
            settings.sync,
            parts.store.clone(),
            keys,
            engine,
            parts.processor,
            parts.publisher,
        ));
        let trigger = Arc::new(WatchTrigger {
            synchronizer: Arc::clone(&synchronizer),
            armed: AtomicBool::new(false),
        });

        let detector = Arc::new(ChangeDetector::new(
            settings.detector,
            parts.feed,
            parts.session,
            parts.store.clone(),
            trigger.clone(),
        )?);

        Ok(Self {
            store: parts.store,
            pool,
            synchronizer,
            detector,
            trigger,
            poll_task: Mutex::new(None),
        })
    }

    pub fn app(&self) -> AppId {
        self.synchronizer.config().app
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    /// Current cursors and backlog.
    pub fn status(&self) -> TrackerResult<TrackerStatus> {
        read_status(self.store.as_ref(), self.app())
    }

    async fn prepare(&self) -> TrackerResult<()> {
        self.synchronizer.prepare_dirs().await?;
        let endpoints = self.pool.refill().await;
        info!(endpoints, "Endpoint pool ready");
        Ok(())
    }

    /// Start watching: prepare, catch up on recorded changes, then poll.
    pub async fn start(&self) -> TrackerResult<()> {
        self.prepare().await?;
        self.trigger.armed.store(true, Ordering::SeqCst);

        let pending = self.synchronizer.pending_changes()?;
        if !pending.is_empty() {
            info!(pending = pending.len(), "Resuming unsynchronized changes");
            self.synchronizer.spawn_run();
        }

        let handle = self.detector.start_polling();
        if let Some(previous) = self.poll_task.lock().replace(handle) {
            previous.abort();
        }
        info!(app = %self.app(), "Tracker started");
        Ok(())
    }

    /// One detection poll followed by a synchronization pass.
    ///
    /// Returns the changes that were synchronized.
    pub async fn sync_once(&self) -> TrackerResult<Vec<ChangeNumber>> {
        self.prepare().await?;

        match self.detector.poll_once().await {
            Ok(NoticeOutcome::Recorded(change)) => info!(change = %change, "New change recorded"),
            Ok(outcome) => info!(?outcome, "No new change recorded"),
            Err(e) => warn!(error = %e, "Change poll failed, syncing recorded changes only"),
        }

        let summary = self.synchronizer.run_synchronization().await?;
        Ok(summary.synced)
    }

    /// Stop polling and wait for an active synchronization to finish.
    pub async fn shutdown(&self) {
        self.trigger.armed.store(false, Ordering::SeqCst);
        self.detector.stop_polling();
        let handle = self.poll_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Polling task ended abnormally");
            }
        }
        if self.synchronizer.is_running() {
            info!("Waiting for active synchronization");
        }
        self.synchronizer.wait_idle().await;
        info!("Tracker stopped");
    }
}
