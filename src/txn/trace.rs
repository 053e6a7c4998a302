use crate::table::patch::{PatchOp, SheetPatch};
use crate::table::types::{RowId, SheetId};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Committed,
    Blocked,
    RolledBack,
}

/// What one patch attempted, stripped of row payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTrace {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub operation: PatchOp,
    #[serde(default)]
    pub changed_fields: Vec<CompactString>,
}

impl PatchTrace {
    pub fn from_patch(patch: &SheetPatch) -> Self {
        Self {
            sheet_id: patch.sheet_id.clone(),
            row_id: patch.row_id.clone(),
            operation: patch.operation,
            changed_fields: patch.normalized_changed_fields().into_vec(),
        }
    }
}

/// One journal entry: enough to reconstruct what was attempted, by whom, and
/// why it failed if it did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub tx_id: CompactString,
    pub timestamp: u64,
    pub status: TxStatus,
    pub command_count: usize,
    pub patch_count: usize,
    #[serde(default)]
    pub patches: Vec<PatchTrace>,
    #[serde(default)]
    pub sources: Vec<CompactString>,
    #[serde(default)]
    pub reason: Option<CompactString>,
}

pub fn patch_traces(patches: &[SheetPatch]) -> Vec<PatchTrace> {
    patches.iter().map(PatchTrace::from_patch).collect()
}
