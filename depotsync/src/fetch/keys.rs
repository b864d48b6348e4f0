//! Depot key cache.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{FetchError, FetchResult};
use crate::model::{AppId, DepotId, DepotKey};
use crate::session::ContentSession;

/// Caches depot decryption keys per `(app, depot)`.
///
/// The same depot id may appear under more than one app, so the app is part
/// of the key.
pub struct KeyRing {
    session: Arc<dyn ContentSession>,
    keys: DashMap<(AppId, DepotId), DepotKey>,
}

impl KeyRing {
    pub fn new(session: Arc<dyn ContentSession>) -> Self {
        Self {
            session,
            keys: DashMap::new(),
        }
    }

    /// Key for `depot` of `app`, asking the session on a cache miss.
    pub async fn key(&self, app: AppId, depot: DepotId) -> FetchResult<DepotKey> {
        if let Some(key) = self.keys.get(&(app, depot)) {
            return Ok(key.clone());
        }

        let key = self
            .session
            .depot_key(app, depot)
            .await
            .map_err(|source| FetchError::KeyLookup { app, depot, source })?
            .ok_or(FetchError::KeyUnavailable { app, depot })?;

        debug!(app = %app, depot = %depot, "Cached depot key");
        self.keys.insert((app, depot), key.clone());
        Ok(key)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
