//! Embedded, in-memory sheet store with optimistic concurrency control,
//! paired with a turn-based transaction engine.
//!
//! Multiple independent command producers (story, world-state, map, memory
//! writers) each propose patches to the same per-turn game state. The
//! [`TableStore`] guarantees that no partial or stale write ever becomes
//! visible: every mutation funnels through one gate that checks version
//! preconditions and row/cell locks strictly before mutating. The
//! [`TurnEngine`] sits on top, deciding per batch whether commands need
//! atomic grouping, validating the applier's patches, committing or
//! discarding the draft, and journaling every outcome.
//!
//! The core is single-process, single-threaded, and synchronous; callers
//! serialize turns per state object. The only state it asks the host to
//! persist is [`RuntimeMeta`], embedded in the host's game state.
//!
//! ```
//! use turndb::{RowId, TableStore};
//! use serde_json::json;
//!
//! let mut store = TableStore::new();
//! let row = json!({"物品ID": "I1", "数量": 1}).as_object().cloned().unwrap();
//! store.upsert("ITEM_Inventory", row, None, None).unwrap();
//! assert_eq!(store.sheet_version("ITEM_Inventory"), 1);
//! assert_eq!(store.row_version("ITEM_Inventory", &RowId::from("I1")), 1);
//! ```

pub mod config;
pub mod error;
pub mod table;
pub mod txn;

pub use config::{DEFAULT_TRANSACTIONAL_ACTIONS, EngineConfig, TurnOptions};
pub use error::{ConflictReason, StoreError};
pub use table::{
    ApplyReport, CellLock, ConflictStats, PatchConflict, PatchOp, PatchOutcome, ProjectedTable,
    RowId, RowLock, RuntimeMeta, SheetId, SheetPatch, SheetSnapshot, TableRow, TableStore,
};
pub use txn::{
    ApplyResult, Command, LogEntry, PatchTrace, TransactionTrace, TurnEngine, TurnOutcome,
    TurnState, TxStatus, apply_turn_transaction, should_use_transaction,
};
