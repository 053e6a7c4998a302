use crate::error::{ConflictReason, StoreError};
use crate::table::meta::{
    CellLock, ConflictStats, ProjectedTable, RowLock, RuntimeMeta, SheetSnapshot, row_version_key,
};
use crate::table::patch::{ApplyReport, PatchConflict, PatchOp, PatchOutcome, SheetPatch};
use crate::table::types::{RowId, SheetId, TableRow, default_key_field, now_millis, read_row_id};
use compact_str::CompactString;
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct TableState {
    key_field: CompactString,
    rows: Vec<TableRow>,
    index_by_id: HashMap<CompactString, usize>,
    row_versions: HashMap<CompactString, u64>,
    sheet_version: u64,
}

/// Owns all sheets and enforces OCC and locking. Every read returns clones;
/// the only way to mutate held state is through the mutation API, and the
/// only gate that patches pass through is [`TableStore::try_apply_patch`].
#[derive(Debug, Default)]
pub struct TableStore {
    tables: BTreeMap<SheetId, TableState>,
    seed_sheet_versions: BTreeMap<SheetId, u64>,
    seed_row_versions: BTreeMap<CompactString, u64>,
    row_locks: Vec<RowLock>,
    cell_locks: Vec<CellLock>,
    conflict_stats: ConflictStats,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs an equivalent store from a previously exported snapshot:
    /// version counters, locks, and conflict statistics all resume.
    pub fn from_runtime_meta(meta: &RuntimeMeta) -> Self {
        Self {
            tables: BTreeMap::new(),
            seed_sheet_versions: meta.sheet_versions.clone(),
            seed_row_versions: meta.row_versions.clone(),
            row_locks: meta.row_locks.clone(),
            cell_locks: meta.cell_locks.clone(),
            conflict_stats: meta.conflict_stats.clone(),
        }
    }

    /// Seeds a store from display-layer projections. Projection rows are
    /// trusted input: a row with no resolvable id gets a synthetic
    /// `"{sheet}_{index+1}"` id instead of failing the whole load.
    pub fn from_projected_tables(
        tables: &[ProjectedTable],
        meta: Option<&RuntimeMeta>,
    ) -> Result<Self, StoreError> {
        let mut store = meta.map_or_else(Self::new, Self::from_runtime_meta);
        for table in tables {
            let key_field = default_key_field(&table.id);
            for (index, row) in table.rows.iter().enumerate() {
                let row_id = read_row_id(row, key_field)
                    .unwrap_or_else(|| RowId::Text(compact_str::format_compact!(
                        "{}_{}",
                        table.id,
                        index + 1
                    )));
                store.upsert(&table.id, row.clone(), Some(&row_id), Some(key_field))?;
            }
        }
        Ok(store)
    }

    fn get_or_create(&mut self, sheet_id: &str, key_field: Option<&str>) -> &mut TableState {
        let table = match self.tables.entry(SheetId::from(sheet_id)) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let prefix = format!("{sheet_id}::");
                let row_versions = self
                    .seed_row_versions
                    .iter()
                    .filter_map(|(key, version)| {
                        key.strip_prefix(prefix.as_str())
                            .map(|row_key| (CompactString::from(row_key), *version))
                    })
                    .collect();
                slot.insert(TableState {
                    key_field: CompactString::from(
                        key_field.unwrap_or_else(|| default_key_field(sheet_id)),
                    ),
                    rows: Vec::new(),
                    index_by_id: HashMap::new(),
                    row_versions,
                    sheet_version: self.seed_sheet_versions.get(sheet_id).copied().unwrap_or(0),
                })
            }
        };
        if let Some(key_field) = key_field
            && table.key_field != key_field
        {
            table.key_field = CompactString::from(key_field);
        }
        table
    }

    fn resolve_row_id(
        sheet_id: &str,
        key_field: &str,
        row: &TableRow,
        row_id: Option<&RowId>,
    ) -> Result<RowId, StoreError> {
        row_id
            .cloned()
            .or_else(|| read_row_id(row, key_field))
            .ok_or_else(|| StoreError::MissingRowId {
                sheet_id: sheet_id.to_string(),
                key_field: key_field.to_string(),
            })
    }

    fn bump_versions(&mut self, sheet_id: &str, row_id: &RowId) {
        let Some(table) = self.tables.get_mut(sheet_id) else {
            return;
        };
        table.sheet_version += 1;
        let id_key = row_id.id_key();
        let next = table.row_versions.get(&id_key).copied().unwrap_or(0) + 1;
        table.row_versions.insert(id_key, next);
        self.seed_sheet_versions
            .insert(SheetId::from(sheet_id), table.sheet_version);
        self.seed_row_versions
            .insert(row_version_key(sheet_id, row_id), next);
    }

    /// Inserts or replaces a row by id, creating the sheet on first use, then
    /// bumps the sheet and row versions. Returns a clone of the stored row.
    ///
    /// A row whose identity cannot be resolved from `row_id` or the key field
    /// is a configuration error, never silently defaulted.
    pub fn upsert(
        &mut self,
        sheet_id: &str,
        row: TableRow,
        row_id: Option<&RowId>,
        key_field: Option<&str>,
    ) -> Result<TableRow, StoreError> {
        let table = self.get_or_create(sheet_id, key_field);
        let key_field = table.key_field.clone();
        let resolved = Self::resolve_row_id(sheet_id, &key_field, &row, row_id)?;

        let mut stored = row;
        if !stored.contains_key(key_field.as_str()) {
            let id_value = match &resolved {
                RowId::Text(text) => Value::String(text.to_string()),
                RowId::Integer(value) => Value::from(*value),
            };
            stored.insert(key_field.to_string(), id_value);
        }

        let table = self.get_or_create(sheet_id, None);
        let id_key = resolved.id_key();
        if let Some(&index) = table.index_by_id.get(&id_key) {
            if let Some(slot) = table.rows.get_mut(index) {
                *slot = stored.clone();
            }
        } else {
            table.index_by_id.insert(id_key, table.rows.len());
            table.rows.push(stored.clone());
        }
        self.bump_versions(sheet_id, &resolved);
        debug!(sheet = sheet_id, row = %resolved, "row upserted");
        Ok(stored)
    }

    /// Removes the row if present. Returns `false` (and bumps nothing) when
    /// the row is absent; a successful delete still bumps both versions,
    /// since version counters track mutation history, not row count.
    pub fn delete(&mut self, sheet_id: &str, row_id: &RowId, key_field: Option<&str>) -> bool {
        let table = self.get_or_create(sheet_id, key_field);
        let id_key = row_id.id_key();
        let Some(index) = table.index_by_id.remove(&id_key) else {
            return false;
        };
        table.rows.remove(index);
        let key_field = table.key_field.clone();
        table.index_by_id.clear();
        for (idx, row) in table.rows.iter().enumerate() {
            if let Some(next_id) = read_row_id(row, &key_field) {
                table.index_by_id.insert(next_id.id_key(), idx);
            }
        }
        self.bump_versions(sheet_id, row_id);
        debug!(sheet = sheet_id, row = %row_id, "row deleted");
        true
    }

    /// Cloned rows matching `predicate`, in insertion order.
    pub fn select<F>(&self, sheet_id: &str, predicate: F) -> Vec<TableRow>
    where
        F: Fn(&TableRow) -> bool,
    {
        self.tables.get(sheet_id).map_or_else(Vec::new, |table| {
            table
                .rows
                .iter()
                .filter(|row| predicate(row))
                .cloned()
                .collect()
        })
    }

    pub fn select_all(&self, sheet_id: &str) -> Vec<TableRow> {
        self.select(sheet_id, |_| true)
    }

    pub fn get_by_id(&self, sheet_id: &str, row_id: &RowId) -> Option<TableRow> {
        let table = self.tables.get(sheet_id)?;
        let index = *table.index_by_id.get(&row_id.id_key())?;
        table.rows.get(index).cloned()
    }

    pub fn sheet_version(&self, sheet_id: &str) -> u64 {
        self.tables
            .get(sheet_id)
            .map(|table| table.sheet_version)
            .or_else(|| self.seed_sheet_versions.get(sheet_id).copied())
            .unwrap_or(0)
    }

    pub fn row_version(&self, sheet_id: &str, row_id: &RowId) -> u64 {
        if let Some(table) = self.tables.get(sheet_id) {
            return table
                .row_versions
                .get(&row_id.id_key())
                .copied()
                .unwrap_or(0);
        }
        self.seed_row_versions
            .get(&row_version_key(sheet_id, row_id))
            .copied()
            .unwrap_or(0)
    }

    /// Idempotent acquire: a second lock with the same sheet/row/owner leaves
    /// exactly one entry.
    pub fn lock_row(&mut self, mut lock: RowLock) {
        if lock.created_at.is_none() {
            lock.created_at = Some(now_millis());
        }
        let exists = self.row_locks.iter().any(|item| {
            item.sheet_id == lock.sheet_id
                && item.row_id.id_key() == lock.row_id.id_key()
                && item.owner == lock.owner
        });
        if !exists {
            debug!(sheet = %lock.sheet_id, row = %lock.row_id, owner = ?lock.owner, "row lock acquired");
            self.row_locks.push(lock);
        }
    }

    /// Releases row locks on the given row. Without `owner`, all owners'
    /// locks on that row are cleared.
    pub fn unlock_row(&mut self, sheet_id: &str, row_id: &RowId, owner: Option<&str>) {
        let id_key = row_id.id_key();
        self.row_locks.retain(|lock| {
            if lock.sheet_id != sheet_id || lock.row_id.id_key() != id_key {
                return true;
            }
            match owner {
                Some(owner) => lock.owner.as_deref() != Some(owner),
                None => false,
            }
        });
    }

    /// Idempotent acquire scoped to one field. A blank field name is
    /// rejected.
    pub fn lock_cell(&mut self, mut lock: CellLock) -> Result<(), StoreError> {
        lock.field = CompactString::from(lock.field.trim());
        if lock.field.is_empty() {
            return Err(StoreError::EmptyLockField {
                sheet_id: lock.sheet_id.to_string(),
            });
        }
        if lock.created_at.is_none() {
            lock.created_at = Some(now_millis());
        }
        let exists = self.cell_locks.iter().any(|item| {
            item.sheet_id == lock.sheet_id
                && item.row_id.id_key() == lock.row_id.id_key()
                && item.field == lock.field
                && item.owner == lock.owner
        });
        if !exists {
            debug!(sheet = %lock.sheet_id, row = %lock.row_id, field = %lock.field, "cell lock acquired");
            self.cell_locks.push(lock);
        }
        Ok(())
    }

    pub fn unlock_cell(&mut self, sheet_id: &str, row_id: &RowId, field: &str, owner: Option<&str>) {
        let id_key = row_id.id_key();
        self.cell_locks.retain(|lock| {
            if lock.sheet_id != sheet_id || lock.row_id.id_key() != id_key || lock.field != field {
                return true;
            }
            match owner {
                Some(owner) => lock.owner.as_deref() != Some(owner),
                None => false,
            }
        });
    }

    pub fn row_locks(&self) -> &[RowLock] {
        &self.row_locks
    }

    pub fn cell_locks(&self) -> &[CellLock] {
        &self.cell_locks
    }

    pub fn conflict_stats(&self) -> &ConflictStats {
        &self.conflict_stats
    }

    pub(crate) fn record_conflicts(&mut self, reason: ConflictReason, count: u64) {
        self.conflict_stats.record_many(reason, count);
    }

    fn build_conflict(
        &mut self,
        patch: &SheetPatch,
        reason: ConflictReason,
        message: String,
        expected: Option<u64>,
        actual: Option<u64>,
        field: Option<CompactString>,
    ) -> PatchConflict {
        self.conflict_stats.record(reason);
        warn!(sheet = %patch.sheet_id, row = %patch.row_id, %reason, "patch rejected");
        PatchConflict {
            sheet_id: patch.sheet_id.clone(),
            row_id: patch.row_id.clone(),
            reason,
            message,
            expected,
            actual,
            field,
        }
    }

    /// OCC and lock checks, strictly before any mutation. First match wins:
    /// sheet version, then row version, then row lock, then cell lock.
    fn check_patch_conflict(&mut self, patch: &SheetPatch) -> Option<PatchConflict> {
        if let Some(expected) = patch.expected_sheet_version {
            let actual = self.sheet_version(&patch.sheet_id);
            if expected != actual {
                return Some(self.build_conflict(
                    patch,
                    ConflictReason::SheetVersionConflict,
                    format!("sheet version conflict: expected {expected}, actual {actual}"),
                    Some(expected),
                    Some(actual),
                    None,
                ));
            }
        }

        if let Some(expected) = patch.expected_row_version {
            let actual = self.row_version(&patch.sheet_id, &patch.row_id);
            if expected != actual {
                return Some(self.build_conflict(
                    patch,
                    ConflictReason::RowVersionConflict,
                    format!("row version conflict: expected {expected}, actual {actual}"),
                    Some(expected),
                    Some(actual),
                    None,
                ));
            }
        }

        let id_key = patch.row_id.id_key();
        let foreign_row_owner = self
            .row_locks
            .iter()
            .find(|lock| lock.sheet_id == patch.sheet_id && lock.row_id.id_key() == id_key)
            .filter(|lock| lock.owner.as_deref() != patch.lock_owner.as_deref())
            .map(|lock| lock.owner.clone().unwrap_or_else(|| "unknown".into()));
        if let Some(owner) = foreign_row_owner {
            return Some(self.build_conflict(
                patch,
                ConflictReason::RowLocked,
                format!("row locked by {owner}"),
                None,
                None,
                None,
            ));
        }

        let changed = patch.normalized_changed_fields();
        let blocking_cell = self
            .cell_locks
            .iter()
            .filter(|lock| lock.sheet_id == patch.sheet_id && lock.row_id.id_key() == id_key)
            .find(|lock| {
                if lock.owner.as_deref() == patch.lock_owner.as_deref() {
                    return false;
                }
                // Deletes and whole-row patches touch every field.
                patch.operation == PatchOp::Delete
                    || changed.is_empty()
                    || changed.contains(&lock.field)
            })
            .map(|lock| {
                (
                    lock.owner.clone().unwrap_or_else(|| "unknown".into()),
                    lock.field.clone(),
                )
            });
        if let Some((owner, field)) = blocking_cell {
            let message = format!("cell locked by {owner} ({field})");
            return Some(self.build_conflict(
                patch,
                ConflictReason::CellLocked,
                message,
                None,
                None,
                Some(field),
            ));
        }

        None
    }

    /// The sole mutation gate. Returns `applied: false` plus the conflict
    /// when any precondition fails; nothing is mutated in that case.
    pub fn try_apply_patch(
        &mut self,
        patch: &SheetPatch,
        key_field: Option<&str>,
    ) -> Result<PatchOutcome, StoreError> {
        self.get_or_create(&patch.sheet_id, key_field);
        if let Some(conflict) = self.check_patch_conflict(patch) {
            return Ok(PatchOutcome {
                applied: false,
                conflict: Some(conflict),
            });
        }

        match patch.operation {
            PatchOp::Delete => {
                let applied = self.delete(&patch.sheet_id, &patch.row_id, key_field);
                Ok(PatchOutcome {
                    applied,
                    conflict: None,
                })
            }
            PatchOp::Upsert => {
                let row = patch.row.clone().ok_or_else(|| StoreError::MissingRowPayload {
                    sheet_id: patch.sheet_id.to_string(),
                })?;
                self.upsert(&patch.sheet_id, row, Some(&patch.row_id), key_field)?;
                Ok(PatchOutcome {
                    applied: true,
                    conflict: None,
                })
            }
        }
    }

    /// Same gate, but conflicts are fatal to the caller.
    pub fn apply_patch(&mut self, patch: &SheetPatch) -> Result<bool, StoreError> {
        let outcome = self.try_apply_patch(patch, None)?;
        match outcome.conflict {
            Some(conflict) => Err(StoreError::Conflict(conflict)),
            None => Ok(outcome.applied),
        }
    }

    /// Sequential application, stopping at the first conflict.
    pub fn apply_patches(&mut self, patches: &[SheetPatch]) -> Result<(), StoreError> {
        for patch in patches {
            self.apply_patch(patch)?;
        }
        Ok(())
    }

    /// Applies each patch independently: a conflicting patch is skipped and
    /// recorded while unrelated patches in the same call still apply.
    pub fn apply_patches_with_report(&mut self, patches: &[SheetPatch]) -> Result<ApplyReport, StoreError> {
        let mut report = ApplyReport::default();
        for patch in patches {
            let outcome = self.try_apply_patch(patch, None)?;
            if let Some(conflict) = outcome.conflict {
                report.conflicts.push(conflict);
                continue;
            }
            if outcome.applied {
                report.applied += 1;
            }
        }
        Ok(report)
    }

    /// Projection of one sheet, or of every live sheet.
    pub fn snapshot(&self, sheet_id: Option<&str>) -> BTreeMap<SheetId, SheetSnapshot> {
        let mut out = BTreeMap::new();
        let entries: Vec<(&SheetId, &TableState)> = match sheet_id {
            Some(id) => self.tables.get_key_value(id).into_iter().collect(),
            None => self.tables.iter().collect(),
        };
        for (id, table) in entries {
            out.insert(
                id.clone(),
                SheetSnapshot {
                    key_field: table.key_field.clone(),
                    rows: table.rows.clone(),
                    sheet_version: table.sheet_version,
                },
            );
        }
        out
    }

    /// Exports the runtime snapshot. Live counters win over seeded leftovers,
    /// but seeded versions for sheets never touched this session are kept, so
    /// rehydrating and re-exporting loses nothing.
    pub fn export_meta(&self) -> RuntimeMeta {
        let mut sheet_versions = BTreeMap::new();
        let mut row_versions = BTreeMap::new();

        for (sheet_id, table) in &self.tables {
            sheet_versions.insert(sheet_id.clone(), table.sheet_version);
            for (row_key, version) in &table.row_versions {
                let mut key = CompactString::from(sheet_id.as_str());
                key.push_str("::");
                key.push_str(row_key);
                row_versions.insert(key, *version);
            }
        }
        for (sheet_id, version) in &self.seed_sheet_versions {
            sheet_versions.entry(sheet_id.clone()).or_insert(*version);
        }
        for (key, version) in &self.seed_row_versions {
            row_versions.entry(key.clone()).or_insert(*version);
        }

        RuntimeMeta {
            sheet_versions,
            row_versions,
            row_locks: self.row_locks.clone(),
            cell_locks: self.cell_locks.clone(),
            conflict_stats: self.conflict_stats.clone(),
            // The journal lives on the host state's meta; the engine carries
            // it across exports.
            tx_journal: std::collections::VecDeque::new(),
        }
    }
}
