//! The sheet store: versioned, lockable rows with optimistic concurrency
//! bookkeeping and a serializable runtime snapshot.

pub mod meta;
pub mod patch;
pub mod store;
pub mod types;

pub use meta::{CellLock, ConflictStats, ProjectedTable, RowLock, RuntimeMeta, SheetSnapshot};
pub use patch::{ApplyReport, PatchConflict, PatchOp, PatchOutcome, SheetPatch};
pub use store::TableStore;
pub use types::{RowId, SheetId, TableRow, default_key_field, read_row_id};
