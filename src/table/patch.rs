use crate::error::ConflictReason;
use crate::table::types::{RowId, SheetId, TableRow};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Upsert,
    Delete,
}

/// A proposed mutation for one row, optionally carrying OCC preconditions.
///
/// `expected_sheet_version` / `expected_row_version` are checked against the
/// store's counters at apply time; `lock_owner` is the writer identity used
/// for row/cell lock checks; `changed_fields` scopes cell-lock checks (empty
/// means the patch touches everything); `source` identifies the producing
/// subsystem for gated sheets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetPatch {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub operation: PatchOp,
    #[serde(default)]
    pub row: Option<TableRow>,
    #[serde(default)]
    pub expected_sheet_version: Option<u64>,
    #[serde(default)]
    pub expected_row_version: Option<u64>,
    #[serde(default)]
    pub changed_fields: SmallVec<[CompactString; 4]>,
    #[serde(default)]
    pub lock_owner: Option<CompactString>,
    #[serde(default)]
    pub source: Option<CompactString>,
}

impl SheetPatch {
    pub fn upsert(sheet_id: impl Into<SheetId>, row_id: impl Into<RowId>, row: TableRow) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            operation: PatchOp::Upsert,
            row: Some(row),
            expected_sheet_version: None,
            expected_row_version: None,
            changed_fields: SmallVec::new(),
            lock_owner: None,
            source: None,
        }
    }

    pub fn delete(sheet_id: impl Into<SheetId>, row_id: impl Into<RowId>) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            operation: PatchOp::Delete,
            row: None,
            expected_sheet_version: None,
            expected_row_version: None,
            changed_fields: SmallVec::new(),
            lock_owner: None,
            source: None,
        }
    }

    pub fn with_expected_sheet_version(mut self, version: u64) -> Self {
        self.expected_sheet_version = Some(version);
        self
    }

    pub fn with_expected_row_version(mut self, version: u64) -> Self {
        self.expected_row_version = Some(version);
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<CompactString>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<CompactString>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_changed_fields<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CompactString>,
    {
        self.changed_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Trimmed, non-blank changed-field names; an empty result means the
    /// patch touches every field.
    pub(crate) fn normalized_changed_fields(&self) -> SmallVec<[CompactString; 4]> {
        self.changed_fields
            .iter()
            .map(|field| CompactString::from(field.trim()))
            .filter(|field| !field.is_empty())
            .collect()
    }
}

/// A rejected patch, reported before any mutation happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConflict {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub reason: ConflictReason,
    pub message: String,
    #[serde(default)]
    pub expected: Option<u64>,
    #[serde(default)]
    pub actual: Option<u64>,
    #[serde(default)]
    pub field: Option<CompactString>,
}

impl PatchConflict {
    /// One-line form used in blocked/rollback system log entries.
    pub fn summary_line(&self) -> String {
        match self.reason {
            ConflictReason::SheetVersionConflict | ConflictReason::RowVersionConflict => {
                let expected = self
                    .expected
                    .map_or_else(|| "-".to_string(), |v| v.to_string());
                let actual = self
                    .actual
                    .map_or_else(|| "-".to_string(), |v| v.to_string());
                format!(
                    "{}/{} {} expected={expected} actual={actual}",
                    self.sheet_id, self.row_id, self.reason
                )
            }
            ConflictReason::CellLocked => format!(
                "{}/{} cell_locked field={}",
                self.sheet_id,
                self.row_id,
                self.field.as_deref().unwrap_or("-")
            ),
            ConflictReason::SourceNotAllowed => format!(
                "{}/{} source_not_allowed {}",
                self.sheet_id, self.row_id, self.message
            ),
            ConflictReason::RowLocked => {
                format!("{}/{} {}", self.sheet_id, self.row_id, self.reason)
            }
        }
    }
}

impl std::fmt::Display for PatchConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}: {}",
            self.sheet_id, self.row_id, self.reason, self.message
        )
    }
}

/// Outcome of `TableStore::try_apply_patch`.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub applied: bool,
    pub conflict: Option<PatchConflict>,
}

/// Outcome of `TableStore::apply_patches_with_report`: conflicting patches
/// are skipped and collected while the rest still apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub conflicts: Vec<PatchConflict>,
}
