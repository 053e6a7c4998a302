use crate::table::patch::PatchConflict;
use thiserror::Error;

/// Stable string codes for every conflict reason, exported through
/// `RuntimeMeta` conflict stats and the transaction journal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    SheetVersionConflict,
    RowVersionConflict,
    RowLocked,
    CellLocked,
    SourceNotAllowed,
}

impl ConflictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictReason::SheetVersionConflict => "sheet_version_conflict",
            ConflictReason::RowVersionConflict => "row_version_conflict",
            ConflictReason::RowLocked => "row_locked",
            ConflictReason::CellLocked => "cell_locked",
            ConflictReason::SourceNotAllowed => "source_not_allowed",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing row id for key field '{key_field}' on sheet '{sheet_id}'")]
    MissingRowId { sheet_id: String, key_field: String },
    #[error("missing row payload for upsert patch on sheet '{sheet_id}'")]
    MissingRowPayload { sheet_id: String },
    #[error("cell lock on sheet '{sheet_id}' has an empty field name")]
    EmptyLockField { sheet_id: String },
    #[error("patch conflict: {0}")]
    Conflict(PatchConflict),
}

impl StoreError {
    /// Returns the structured conflict when this error wraps one.
    pub fn conflict(&self) -> Option<&PatchConflict> {
        match self {
            StoreError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}
