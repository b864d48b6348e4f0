//! In-memory store with an optional JSON snapshot on disk.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{StoreError, StoreOp, StoreResult, StoreTransaction, VersionStore};
use crate::model::{AppId, BuildInfo, ChangeNumber, DepotId, DepotVersion, ManifestId};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    depot_versions: BTreeMap<ChangeNumber, BTreeMap<DepotId, DepotVersion>>,
    #[serde(default)]
    build_info: BTreeMap<ChangeNumber, BuildInfo>,
}

impl Tables {
    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::SetValue { key, value } => {
                self.values.insert(key, value);
            }
            StoreOp::UpsertDepotVersion(version) => {
                self.depot_versions
                    .entry(version.change)
                    .or_default()
                    .entry(version.depot)
                    .or_insert(version);
            }
            StoreOp::UpsertBuildInfo(info) => {
                self.build_info.entry(info.change).or_insert(info);
            }
        }
    }

    fn app_changes(&self, app: AppId) -> impl DoubleEndedIterator<Item = ChangeNumber> + '_ {
        self.depot_versions
            .iter()
            .filter(move |(_, depots)| depots.values().any(|v| v.app == app))
            .map(|(change, _)| *change)
    }
}

/// Version store kept in memory and snapshotted to a JSON file.
///
/// Every committed write rewrites the snapshot through a temp file and a
/// rename, so a crash leaves either the old or the new state on disk.
pub struct LocalStore {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl LocalStore {
    /// Store without persistence.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Open the snapshot at `path`, starting empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let tables = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No store snapshot yet, starting empty");
                Tables::default()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            tables: RwLock::new(tables),
        })
    }

    /// Snapshot location, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, tables: &Tables) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        serde_json::to_writer_pretty(&mut tmp, tables).map_err(StoreError::Encode)?;
        tmp.flush().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        debug!(path = %path.display(), "Store snapshot written");
        Ok(())
    }

    fn commit(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let mut next = tables.clone();
        for op in ops {
            next.apply(op);
        }
        self.persist(&next)?;
        *tables = next;
        Ok(())
    }
}

impl VersionStore for LocalStore {
    fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.tables.read().values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: &str) -> StoreResult<()> {
        self.commit(vec![StoreOp::SetValue {
            key: key.to_string(),
            value: value.to_string(),
        }])
    }

    fn apply(&self, transaction: StoreTransaction) -> StoreResult<()> {
        if transaction.is_empty() {
            return Ok(());
        }
        self.commit(transaction.into_ops())
    }

    fn latest_change_before(
        &self,
        app: AppId,
        change: ChangeNumber,
    ) -> StoreResult<Option<ChangeNumber>> {
        Ok(self
            .tables
            .read()
            .app_changes(app)
            .rev()
            .find(|c| *c < change))
    }

    fn depot_manifests(
        &self,
        change: ChangeNumber,
        app: AppId,
    ) -> StoreResult<BTreeMap<DepotId, ManifestId>> {
        Ok(self
            .tables
            .read()
            .depot_versions
            .get(&change)
            .map(|depots| {
                depots
                    .values()
                    .filter(|v| v.app == app)
                    .map(|v| (v.depot, v.manifest))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn changes_after(&self, app: AppId, change: ChangeNumber) -> StoreResult<Vec<ChangeNumber>> {
        Ok(self
            .tables
            .read()
            .app_changes(app)
            .filter(|c| *c > change)
            .collect())
    }

    fn latest_change(&self, app: AppId) -> StoreResult<Option<ChangeNumber>> {
        Ok(self.tables.read().app_changes(app).next_back())
    }

    fn build_info(&self, change: ChangeNumber) -> StoreResult<Option<BuildInfo>> {
        Ok(self.tables.read().build_info.get(&change).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const APP: AppId = AppId(100);

    fn row(change: u32, depot: u32, manifest: u64) -> DepotVersion {
        DepotVersion {
            change: ChangeNumber(change),
            app: APP,
            depot: DepotId(depot),
            manifest: ManifestId(manifest),
        }
    }

    fn seeded() -> LocalStore {
        let store = LocalStore::in_memory();
        store
            .apply(
                StoreTransaction::new()
                    .upsert_depot_version(row(10, 101, 1))
                    .upsert_depot_version(row(10, 102, 2))
                    .upsert_depot_version(row(20, 101, 3))
                    .upsert_depot_version(row(30, 101, 4)),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_upsert_is_insert_if_absent() {
        let store = seeded();
        store
            .apply(StoreTransaction::new().upsert_depot_version(row(10, 101, 999)))
            .unwrap();
        assert_eq!(
            store.depot_manifests(ChangeNumber(10), APP).unwrap()[&DepotId(101)],
            ManifestId(1)
        );
    }

    #[test]
    fn test_latest_change_before_is_strict() {
        let store = seeded();
        assert_eq!(
            store.latest_change_before(APP, ChangeNumber(30)).unwrap(),
            Some(ChangeNumber(20))
        );
        assert_eq!(
            store.latest_change_before(APP, ChangeNumber(31)).unwrap(),
            Some(ChangeNumber(30))
        );
        assert_eq!(store.latest_change_before(APP, ChangeNumber(10)).unwrap(), None);
    }

    #[test]
    fn test_changes_after_is_ascending_and_distinct() {
        let store = seeded();
        assert_eq!(
            store.changes_after(APP, ChangeNumber(5)).unwrap(),
            vec![ChangeNumber(10), ChangeNumber(20), ChangeNumber(30)]
        );
        assert_eq!(
            store.changes_after(APP, ChangeNumber(20)).unwrap(),
            vec![ChangeNumber(30)]
        );
    }

    #[test]
    fn test_queries_ignore_other_apps() {
        let store = seeded();
        assert!(store.changes_after(AppId(7), ChangeNumber(0)).unwrap().is_empty());
        assert_eq!(store.latest_change(AppId(7)).unwrap(), None);
        assert_eq!(store.latest_change(APP).unwrap(), Some(ChangeNumber(30)));
    }

    #[test]
    fn test_build_info_first_write_wins() {
        let store = LocalStore::in_memory();
        let info = |build_id| BuildInfo {
            change: ChangeNumber(5),
            branch: "public".to_string(),
            build_id,
            time_updated: 1,
        };
        store
            .apply(StoreTransaction::new().upsert_build_info(info(1)))
            .unwrap();
        store
            .apply(StoreTransaction::new().upsert_build_info(info(2)))
            .unwrap();
        assert_eq!(store.build_info(ChangeNumber(5)).unwrap().unwrap().build_id, 1);
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/store.json");

        {
            let store = LocalStore::open(&path).unwrap();
            store
                .apply(
                    StoreTransaction::new()
                        .upsert_depot_version(row(10, 101, 1))
                        .set_value("lastSeenChangeNumber", "10"),
                )
                .unwrap();
        }

        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_value("lastSeenChangeNumber").unwrap(),
            Some("10".to_string())
        );
        assert_eq!(reopened.latest_change(APP).unwrap(), Some(ChangeNumber(10)));
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            LocalStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_failed_persist_leaves_memory_unchanged() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().join("state");
        let store = LocalStore::open(state.join("store.json")).unwrap();
        std::fs::write(&state, b"file, not a dir").unwrap();

        assert!(store.set_value("k", "v").is_err());
        assert_eq!(store.get_value("k").unwrap(), None);
    }
}
