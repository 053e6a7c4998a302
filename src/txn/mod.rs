//! The turn transaction engine: command routing, fast/atomic application,
//! source gating, and the bounded audit journal.

pub mod command;
pub mod engine;
pub mod log;
pub mod trace;

pub use command::Command;
pub use engine::{
    ApplyResult, TurnEngine, TurnOutcome, TurnState, apply_turn_transaction,
    should_use_transaction,
};
pub use log::LogEntry;
pub use trace::{PatchTrace, TransactionTrace, TxStatus};
