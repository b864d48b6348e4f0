//! Endpoint pool.
//!
//! Owns the set of interchangeable download servers. Fetches take one
//! endpoint per attempt and hand it back afterwards, so a single bad server
//! never keeps failing the same operation.
//!
//! A refill collects a batch off to the side and merges it into the live
//! queue only once it holds at least `min_endpoints` distinct hosts. Takers
//! keep drawing from the live queue while a refill is running. Endpoints on
//! loan during a refill are still returned to the queue on release; the next
//! refill folds any duplicate hosts back out.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{AppId, Endpoint};
use crate::session::ContentSession;

/// Default minimum number of distinct endpoints a refill must collect.
pub const DEFAULT_MIN_ENDPOINTS: usize = 8;

/// Default pause between two endpoint list requests during a refill.
pub const DEFAULT_REFILL_BACKOFF: Duration = Duration::from_millis(1500);

/// Default hard timeout for a single endpoint list request.
pub const DEFAULT_REFILL_TIMEOUT: Duration = Duration::from_secs(15);

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors from the endpoint pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No endpoint is available right now. Retryable.
    #[error("endpoint pool exhausted")]
    PoolExhausted,
}

/// Refill tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_endpoints: usize,
    pub refill_backoff: Duration,
    pub refill_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_endpoints: DEFAULT_MIN_ENDPOINTS,
            refill_backoff: DEFAULT_REFILL_BACKOFF,
            refill_timeout: DEFAULT_REFILL_TIMEOUT,
        }
    }
}

/// An endpoint on loan from the pool.
#[derive(Clone, Debug)]
pub struct PooledEndpoint {
    endpoint: Endpoint,
}

impl PooledEndpoint {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Thread-safe pool of download endpoints for one app.
pub struct EndpointPool {
    app: AppId,
    session: Arc<dyn ContentSession>,
    config: PoolConfig,
    endpoints: Mutex<VecDeque<Endpoint>>,
    refilling: AtomicBool,
}

impl EndpointPool {
    /// Create an empty pool. Call [`EndpointPool::refill`] before use.
    pub fn new(app: AppId, session: Arc<dyn ContentSession>, config: PoolConfig) -> Self {
        Self {
            app,
            session,
            config,
            endpoints: Mutex::new(VecDeque::new()),
            refilling: AtomicBool::new(false),
        }
    }

    /// Number of endpoints currently available.
    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a background refill is running.
    pub fn is_refilling(&self) -> bool {
        self.refilling.load(Ordering::SeqCst)
    }

    /// Rebuild the pool from the upstream endpoint list.
    ///
    /// Keeps requesting endpoint lists until at least `min_endpoints`
    /// distinct hosts serving this app have been collected. A request that
    /// fails or exceeds `refill_timeout` counts as an empty batch.
    ///
    /// The batch is merged behind the endpoints already queued, keeping one
    /// entry per host. Returns the size of the pool after the merge.
    pub async fn refill(&self) -> usize {
        let mut seen_hosts = HashSet::new();
        let mut collected: Vec<Endpoint> = Vec::new();

        loop {
            match tokio::time::timeout(self.config.refill_timeout, self.session.endpoints()).await
            {
                Ok(Ok(batch)) => {
                    for endpoint in batch {
                        if endpoint.serves(self.app) && seen_hosts.insert(endpoint.host.clone()) {
                            collected.push(endpoint);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Endpoint list request failed");
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.config.refill_timeout.as_secs_f64(),
                        "Endpoint list request timed out"
                    );
                }
            }

            if collected.len() >= self.config.min_endpoints {
                break;
            }

            debug!(
                collected = collected.len(),
                required = self.config.min_endpoints,
                "Not enough endpoints yet, backing off"
            );
            tokio::time::sleep(self.config.refill_backoff).await;
        }

        for endpoint in &collected {
            debug!(endpoint = %endpoint, transport = endpoint.transport.scheme(), "Pooled endpoint");
        }

        let collected_count = collected.len();
        let size = {
            let mut endpoints = self.endpoints.lock();
            let mut hosts = HashSet::new();
            let merged: VecDeque<Endpoint> = endpoints
                .drain(..)
                .chain(collected)
                .filter(|endpoint| hosts.insert(endpoint.host.clone()))
                .collect();
            *endpoints = merged;
            endpoints.len()
        };

        info!(collected = collected_count, endpoints = size, "Endpoint pool refilled");
        size
    }

    /// Start a background refill unless one is already running.
    ///
    /// Returns `true` if a new refill task was spawned.
    pub fn spawn_refill(self: &Arc<Self>) -> bool {
        if self
            .refilling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.refill().await;
            pool.refilling.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Take one endpoint out of the pool.
    pub fn take(&self) -> PoolResult<PooledEndpoint> {
        self.endpoints
            .lock()
            .pop_front()
            .map(|endpoint| PooledEndpoint { endpoint })
            .ok_or(PoolError::PoolExhausted)
    }

    /// Return an endpoint to the back of the pool. No health scoring is done.
    pub fn release(&self, pooled: PooledEndpoint) {
        self.endpoints.lock().push_back(pooled.endpoint);
    }
}
