use crate::error::ConflictReason;
use crate::table::types::{RowId, SheetId, TableRow, now_millis};
use crate::txn::trace::TransactionTrace;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Exclusive claim on a whole row. Only `owner` may write the row while the
/// lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLock {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    #[serde(default)]
    pub owner: Option<CompactString>,
    #[serde(default)]
    pub reason: Option<CompactString>,
    #[serde(default)]
    pub created_at: Option<u64>,
}

impl RowLock {
    pub fn new(
        sheet_id: impl Into<SheetId>,
        row_id: impl Into<RowId>,
        owner: impl Into<CompactString>,
    ) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            owner: Some(owner.into()),
            reason: None,
            created_at: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<CompactString>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Like `RowLock`, scoped to one named field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLock {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub field: CompactString,
    #[serde(default)]
    pub owner: Option<CompactString>,
    #[serde(default)]
    pub reason: Option<CompactString>,
    #[serde(default)]
    pub created_at: Option<u64>,
}

impl CellLock {
    pub fn new(
        sheet_id: impl Into<SheetId>,
        row_id: impl Into<RowId>,
        field: impl Into<CompactString>,
        owner: impl Into<CompactString>,
    ) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            field: field.into(),
            owner: Some(owner.into()),
            reason: None,
            created_at: None,
        }
    }
}

/// Monotonic conflict counters, kept for the life of a store and carried
/// across rehydration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    pub total: u64,
    #[serde(default)]
    pub by_reason: BTreeMap<ConflictReason, u64>,
    #[serde(default)]
    pub updated_at: u64,
}

impl ConflictStats {
    pub fn record(&mut self, reason: ConflictReason) {
        self.record_many(reason, 1);
    }

    pub fn record_many(&mut self, reason: ConflictReason, count: u64) {
        self.total = self.total.saturating_add(count);
        let entry = self.by_reason.entry(reason).or_insert(0);
        *entry = entry.saturating_add(count);
        self.updated_at = now_millis();
    }
}

/// Bookkeeping key for a row version: `"sheetId::rowId"`.
pub fn row_version_key(sheet_id: &str, row_id: &RowId) -> CompactString {
    let mut key = CompactString::from(sheet_id);
    key.push_str("::");
    key.push_str(&row_id.id_key());
    key
}

/// The serializable runtime snapshot of a store: version counters, locks,
/// conflict statistics, and the bounded transaction journal. This is the only
/// state the core needs round-tripped through the host's save/load mechanism.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeMeta {
    #[serde(default)]
    pub sheet_versions: BTreeMap<SheetId, u64>,
    #[serde(default)]
    pub row_versions: BTreeMap<CompactString, u64>,
    #[serde(default)]
    pub row_locks: Vec<RowLock>,
    #[serde(default)]
    pub cell_locks: Vec<CellLock>,
    #[serde(default)]
    pub conflict_stats: ConflictStats,
    #[serde(default)]
    pub tx_journal: VecDeque<TransactionTrace>,
}

impl RuntimeMeta {
    /// Appends one trace, evicting the oldest entries past `limit`.
    pub fn push_trace(&mut self, trace: TransactionTrace, limit: usize) {
        self.tx_journal.push_back(trace);
        while self.tx_journal.len() > limit.max(1) {
            self.tx_journal.pop_front();
        }
    }

    pub fn last_trace(&self) -> Option<&TransactionTrace> {
        self.tx_journal.back()
    }
}

/// Projection of one sheet: key field, cloned rows in insertion order, and
/// the sheet version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetSnapshot {
    pub key_field: CompactString,
    pub rows: Vec<TableRow>,
    pub sheet_version: u64,
}

/// A display-layer table fed into `TableStore::from_projected_tables`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedTable {
    pub id: SheetId,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}
