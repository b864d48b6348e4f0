//! Detection and synchronization watermarks.

use std::fmt;

use super::{StoreError, StoreResult, VersionStore};
use crate::model::ChangeNumber;

/// The two persisted watermarks.
///
/// `LastSynced` never runs ahead of `LastSeen`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cursor {
    /// Last change number handled by the change detector.
    LastSeen,
    /// Last change number fully synchronized and published.
    LastSynced,
}

impl Cursor {
    /// Key under which the cursor is stored.
    pub fn key(&self) -> &'static str {
        match self {
            Self::LastSeen => "lastSeenChangeNumber",
            Self::LastSynced => "lastProcessedChangeNumber",
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Read a cursor. `Ok(None)` when it was never written.
pub fn load_cursor(store: &dyn VersionStore, cursor: Cursor) -> StoreResult<Option<ChangeNumber>> {
    match store.get_value(cursor.key())? {
        None => Ok(None),
        Some(raw) => raw
            .parse::<ChangeNumber>()
            .map(Some)
            .map_err(|_| StoreError::InvalidValue {
                key: cursor.key().to_string(),
                value: raw,
            }),
    }
}
