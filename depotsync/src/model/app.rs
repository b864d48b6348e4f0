//! App descriptors, change notices and persisted version rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{AppId, ChangeNumber, DepotId, ManifestId};

/// Build metadata for one branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub build_id: u32,
    /// Unix timestamp (seconds) of the last branch update.
    pub time_updated: i64,
}

/// One depot as listed by the app descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotDescriptor {
    pub depot: DepotId,
    /// Manifest id per branch name. Empty for shared or encrypted depots.
    #[serde(default)]
    pub manifests: BTreeMap<String, ManifestId>,
}

/// Full current description of an app.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub app: AppId,
    pub change_number: ChangeNumber,
    pub depots: Vec<DepotDescriptor>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchInfo>,
}

impl AppDescriptor {
    /// Depot to manifest mapping for `branch`.
    ///
    /// Depots without a manifest on that branch are left out.
    pub fn depot_manifests(&self, branch: &str) -> BTreeMap<DepotId, ManifestId> {
        self.depots
            .iter()
            .filter_map(|d| d.manifests.get(branch).map(|m| (d.depot, *m)))
            .collect()
    }

    /// Build metadata recorded for `branch`.
    pub fn branch_info(&self, branch: &str) -> Option<BranchInfo> {
        self.branches.get(branch).copied()
    }
}

/// Result of a "changes since" query.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeNotice {
    /// Current catalog change number.
    pub current_change: ChangeNumber,
    /// Upstream demands a full refresh of every app.
    #[serde(default)]
    pub requires_full_update: bool,
    /// Per-app change numbers included in this notice.
    #[serde(default)]
    pub app_changes: BTreeMap<AppId, ChangeNumber>,
}

/// Persisted version row keyed by `(change, depot)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotVersion {
    pub change: ChangeNumber,
    pub app: AppId,
    pub depot: DepotId,
    pub manifest: ManifestId,
}

/// Persisted build metadata keyed by change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub change: ChangeNumber,
    pub branch: String,
    pub build_id: u32,
    pub time_updated: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AppDescriptor {
        AppDescriptor {
            app: AppId(100),
            change_number: ChangeNumber(5),
            depots: vec![
                DepotDescriptor {
                    depot: DepotId(101),
                    manifests: BTreeMap::from([
                        ("public".to_string(), ManifestId(1)),
                        ("beta".to_string(), ManifestId(2)),
                    ]),
                },
                DepotDescriptor {
                    depot: DepotId(102),
                    manifests: BTreeMap::from([("beta".to_string(), ManifestId(3))]),
                },
                DepotDescriptor {
                    depot: DepotId(103),
                    manifests: BTreeMap::new(),
                },
            ],
            branches: BTreeMap::from([(
                "public".to_string(),
                BranchInfo {
                    build_id: 42,
                    time_updated: 1_700_000_000,
                },
            )]),
        }
    }

    #[test]
    fn test_depot_manifests_filters_by_branch() {
        let desc = descriptor();
        let public = desc.depot_manifests("public");
        assert_eq!(public.len(), 1);
        assert_eq!(public[&DepotId(101)], ManifestId(1));

        let beta = desc.depot_manifests("beta");
        assert_eq!(beta.len(), 2);
        assert_eq!(beta[&DepotId(102)], ManifestId(3));
    }

    #[test]
    fn test_branch_info_missing_branch() {
        let desc = descriptor();
        assert_eq!(desc.branch_info("public").unwrap().build_id, 42);
        assert!(desc.branch_info("beta").is_none());
    }

    #[test]
    fn test_change_notice_deserializes_with_defaults() {
        let notice: ChangeNotice = serde_json::from_str(r#"{"current_change": 77}"#).unwrap();
        assert_eq!(notice.current_change, ChangeNumber(77));
        assert!(!notice.requires_full_update);
        assert!(notice.app_changes.is_empty());
    }
}
