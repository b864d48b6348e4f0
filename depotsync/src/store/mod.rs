//! Persisted version records and cursors.
//!
//! The rest of the crate talks to storage only through [`VersionStore`]:
//! named string values (the cursors), append-only depot version rows keyed
//! by `(change, depot)`, and build metadata keyed by change.
//!
//! Writes that belong to one state transition are grouped in a
//! [`StoreTransaction`] and applied atomically.

mod cursor;
mod local;

pub use cursor::{load_cursor, Cursor};
pub use local::LocalStore;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{AppId, BuildInfo, ChangeNumber, DepotId, DepotVersion, ManifestId};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the version store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store snapshot at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode store snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored value could not be parsed.
    #[error("invalid value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },
}

/// One write inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    SetValue { key: String, value: String },
    /// Insert-if-absent on `(change, depot)`.
    UpsertDepotVersion(DepotVersion),
    /// Insert-if-absent on `change`.
    UpsertBuildInfo(BuildInfo),
}

/// Batch of writes applied all-or-nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreTransaction {
    ops: Vec<StoreOp>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(StoreOp::SetValue {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_cursor(self, cursor: Cursor, change: ChangeNumber) -> Self {
        self.set_value(cursor.key(), change.to_string())
    }

    pub fn upsert_depot_version(mut self, version: DepotVersion) -> Self {
        self.ops.push(StoreOp::UpsertDepotVersion(version));
        self
    }

    pub fn upsert_build_info(mut self, info: BuildInfo) -> Self {
        self.ops.push(StoreOp::UpsertBuildInfo(info));
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Storage contract for version rows and cursors.
pub trait VersionStore: Send + Sync {
    /// Read a named value.
    fn get_value(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a named value.
    fn set_value(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Apply every op of `transaction` or none of them.
    fn apply(&self, transaction: StoreTransaction) -> StoreResult<()>;

    /// Most recent recorded change of `app` strictly below `change`.
    fn latest_change_before(
        &self,
        app: AppId,
        change: ChangeNumber,
    ) -> StoreResult<Option<ChangeNumber>>;

    /// Depot to manifest pairs recorded for `(change, app)`.
    fn depot_manifests(
        &self,
        change: ChangeNumber,
        app: AppId,
    ) -> StoreResult<BTreeMap<DepotId, ManifestId>>;

    /// Recorded changes of `app` strictly above `change`, ascending.
    fn changes_after(&self, app: AppId, change: ChangeNumber) -> StoreResult<Vec<ChangeNumber>>;

    /// Most recent recorded change of `app`.
    fn latest_change(&self, app: AppId) -> StoreResult<Option<ChangeNumber>>;

    /// Build metadata recorded for `change`.
    fn build_info(&self, change: ChangeNumber) -> StoreResult<Option<BuildInfo>>;
}
