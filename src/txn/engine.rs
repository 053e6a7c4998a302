use crate::config::{DEFAULT_TRANSACTIONAL_ACTIONS, EngineConfig, TurnOptions};
use crate::error::{ConflictReason, StoreError};
use crate::table::meta::{RowLock, RuntimeMeta};
use crate::table::patch::{PatchConflict, PatchOp, SheetPatch};
use crate::table::store::TableStore;
use crate::table::types::now_millis;
use crate::txn::command::Command;
use crate::txn::log::{LogEntry, log_text_reports_error};
use crate::txn::trace::{TransactionTrace, TxStatus, patch_traces};
use compact_str::CompactString;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Host game state as seen by the engine: cloneable (the atomic draft is a
/// deep clone of the base) and carrying the embedded runtime metadata blob.
pub trait TurnState: Clone {
    fn runtime_meta(&self) -> Option<&RuntimeMeta>;
    fn set_runtime_meta(&mut self, meta: RuntimeMeta);
}

/// What the external command applier returns. The applier is a pure function
/// over the state it is handed; it must never mutate shared state itself.
#[derive(Debug, Clone)]
pub struct ApplyResult<S> {
    pub new_state: S,
    pub logs: Vec<LogEntry>,
    pub has_error: bool,
    pub sheet_patches: Vec<SheetPatch>,
}

impl<S> ApplyResult<S> {
    pub fn new(new_state: S) -> Self {
        Self {
            new_state,
            logs: Vec::new(),
            has_error: false,
            sheet_patches: Vec::new(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<LogEntry>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.has_error = true;
        self
    }

    pub fn with_patches(mut self, patches: Vec<SheetPatch>) -> Self {
        self.sheet_patches = patches;
        self
    }
}

/// Terminal result of one turn batch. Always fully populated, whichever path
/// executed; `logs` is the applier's logs followed by synthesized system
/// narration.
#[derive(Debug, Clone)]
pub struct TurnOutcome<S> {
    pub new_state: S,
    pub logs: Vec<LogEntry>,
    pub has_error: bool,
    pub rolled_back: bool,
    pub applied_patches: usize,
}

/// Decides atomic-vs-direct application for a batch.
pub fn should_use_transaction(commands: &[Command], options: &TurnOptions) -> bool {
    if commands.len() <= 1 {
        return false;
    }
    if options.force_atomic {
        return true;
    }
    if commands.iter().any(|cmd| cmd.atomic) {
        return true;
    }

    let mut marker_counts: HashMap<&str, usize> = HashMap::new();
    for command in commands {
        if let Some(marker) = command.transaction_marker.as_deref()
            && !marker.is_empty()
        {
            *marker_counts.entry(marker).or_insert(0) += 1;
        }
    }
    if marker_counts.values().any(|count| *count >= 2) {
        return true;
    }

    let transactional_count = commands
        .iter()
        .filter(|cmd| match &options.transactional_actions {
            Some(actions) => actions.contains(&cmd.action),
            None => DEFAULT_TRANSACTIONAL_ACTIONS.contains(&cmd.action.as_str()),
        })
        .count();
    transactional_count > 1
}

fn has_apply_error<S>(result: &ApplyResult<S>) -> bool {
    result.has_error || result.logs.iter().any(|log| log_text_reports_error(&log.text))
}

enum Validation {
    Ok {
        meta: RuntimeMeta,
        applied: usize,
    },
    Blocked {
        meta: RuntimeMeta,
        conflicts: Vec<PatchConflict>,
        source_gated: bool,
    },
}

/// Applies batches of domain commands to shared game state, guarding every
/// table mutation with the store's OCC and lock checks and journaling each
/// outcome.
#[derive(Debug, Clone, Default)]
pub struct TurnEngine {
    config: EngineConfig,
}

impl TurnEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Entry point: routes the batch, invokes the applier, validates its
    /// patches, and returns the committed or rolled-back state plus the
    /// audit trail.
    ///
    /// Errors only on malformed applier output (an upsert patch without a
    /// row payload); every concurrency outcome is expressed in the returned
    /// `TurnOutcome`.
    pub fn apply<S, F>(
        &self,
        base: &S,
        commands: &[Command],
        apply_commands: F,
        options: &TurnOptions,
    ) -> Result<TurnOutcome<S>, StoreError>
    where
        S: TurnState,
        F: FnOnce(&S, &[Command]) -> ApplyResult<S>,
    {
        let tx_id = build_tx_id();
        let sources = collect_sources(commands);

        if commands.is_empty() {
            return Ok(TurnOutcome {
                new_state: base.clone(),
                logs: Vec::new(),
                has_error: false,
                rolled_back: false,
                applied_patches: 0,
            });
        }

        if !should_use_transaction(commands, options) {
            return self.apply_fast_path(base, commands, apply_commands, &tx_id, sources);
        }
        self.apply_atomic_path(base, commands, apply_commands, &tx_id, sources)
    }

    /// Direct application. The applier result passes through; its patches
    /// are still run through the store for OCC bookkeeping, and a detected
    /// conflict rejects the turn. The returned state is then the base with
    /// corrected metadata only, since the pure applier contract means
    /// nothing else was mutated.
    fn apply_fast_path<S, F>(
        &self,
        base: &S,
        commands: &[Command],
        apply_commands: F,
        tx_id: &str,
        sources: Vec<CompactString>,
    ) -> Result<TurnOutcome<S>, StoreError>
    where
        S: TurnState,
        F: FnOnce(&S, &[Command]) -> ApplyResult<S>,
    {
        let result = apply_commands(base, commands);
        let patch_count = result.sheet_patches.len();

        if has_apply_error(&result) || result.sheet_patches.is_empty() {
            debug!(tx = tx_id, commands = commands.len(), "fast path passthrough");
            return Ok(TurnOutcome {
                new_state: result.new_state,
                logs: result.logs,
                has_error: result.has_error,
                rolled_back: false,
                applied_patches: patch_count,
            });
        }

        match self.validate_patches(base, &result.sheet_patches)? {
            Validation::Ok { meta, applied } => {
                let mut new_state = result.new_state;
                self.install_meta(
                    &mut new_state,
                    base,
                    meta,
                    TransactionTrace {
                        tx_id: CompactString::from(tx_id),
                        timestamp: now_millis(),
                        status: TxStatus::Committed,
                        command_count: commands.len(),
                        patch_count: applied,
                        patches: patch_traces(&result.sheet_patches),
                        sources,
                        reason: None,
                    },
                );
                debug!(tx = tx_id, applied, "fast path committed");
                Ok(TurnOutcome {
                    new_state,
                    logs: result.logs,
                    has_error: result.has_error,
                    rolled_back: false,
                    applied_patches: applied,
                })
            }
            Validation::Blocked {
                meta,
                conflicts,
                source_gated,
            } => {
                let mut logs = result.logs;
                logs.push(self.blocked_log(tx_id, &conflicts, source_gated));
                let mut new_state = base.clone();
                self.install_meta(
                    &mut new_state,
                    base,
                    meta,
                    TransactionTrace {
                        tx_id: CompactString::from(tx_id),
                        timestamp: now_millis(),
                        status: TxStatus::Blocked,
                        command_count: commands.len(),
                        patch_count,
                        patches: patch_traces(&result.sheet_patches),
                        sources,
                        reason: conflicts
                            .first()
                            .map(|conflict| CompactString::from(conflict.reason.as_str())),
                    },
                );
                warn!(tx = tx_id, conflicts = conflicts.len(), "fast path blocked");
                Ok(TurnOutcome {
                    new_state,
                    logs,
                    has_error: true,
                    rolled_back: true,
                    applied_patches: 0,
                })
            }
        }
    }

    /// Snapshot-isolated application: the applier runs against a deep clone
    /// of the base; on any apply error or patch conflict the draft is
    /// discarded wholesale.
    fn apply_atomic_path<S, F>(
        &self,
        base: &S,
        commands: &[Command],
        apply_commands: F,
        tx_id: &str,
        sources: Vec<CompactString>,
    ) -> Result<TurnOutcome<S>, StoreError>
    where
        S: TurnState,
        F: FnOnce(&S, &[Command]) -> ApplyResult<S>,
    {
        let draft = base.clone();
        let applied = apply_commands(&draft, commands);
        let patch_count = applied.sheet_patches.len();

        if has_apply_error(&applied) {
            let mut logs = applied.logs;
            logs.push(LogEntry::system(
                format!("{tx_id}:rollback"),
                format!(
                    "回合事务回滚：命令 {} 条，sheet patch {} 条，已撤销本批次状态变更。",
                    commands.len(),
                    patch_count
                ),
            ));
            let mut new_state = base.clone();
            let meta = base.runtime_meta().cloned().unwrap_or_default();
            self.install_meta(
                &mut new_state,
                base,
                meta,
                TransactionTrace {
                    tx_id: CompactString::from(tx_id),
                    timestamp: now_millis(),
                    status: TxStatus::RolledBack,
                    command_count: commands.len(),
                    patch_count,
                    patches: patch_traces(&applied.sheet_patches),
                    sources,
                    reason: Some(CompactString::from("apply_error")),
                },
            );
            warn!(tx = tx_id, commands = commands.len(), "atomic batch rolled back");
            return Ok(TurnOutcome {
                new_state,
                logs,
                has_error: true,
                rolled_back: true,
                applied_patches: 0,
            });
        }

        match self.validate_patches(base, &applied.sheet_patches)? {
            Validation::Ok { meta, applied: applied_count } => {
                let mut logs = applied.logs;
                logs.push(LogEntry::system(
                    format!("{tx_id}:commit"),
                    format!(
                        "回合事务提交成功：命令 {} 条，sheet patch {} 条。",
                        commands.len(),
                        applied_count
                    ),
                ));
                let mut new_state = applied.new_state;
                self.install_meta(
                    &mut new_state,
                    base,
                    meta,
                    TransactionTrace {
                        tx_id: CompactString::from(tx_id),
                        timestamp: now_millis(),
                        status: TxStatus::Committed,
                        command_count: commands.len(),
                        patch_count: applied_count,
                        patches: patch_traces(&applied.sheet_patches),
                        sources,
                        reason: None,
                    },
                );
                info!(tx = tx_id, applied = applied_count, "turn transaction committed");
                Ok(TurnOutcome {
                    new_state,
                    logs,
                    has_error: false,
                    rolled_back: false,
                    applied_patches: applied_count,
                })
            }
            Validation::Blocked {
                meta,
                conflicts,
                source_gated,
            } => {
                let mut logs = applied.logs;
                logs.push(self.blocked_log(tx_id, &conflicts, source_gated));
                let mut new_state = base.clone();
                self.install_meta(
                    &mut new_state,
                    base,
                    meta,
                    TransactionTrace {
                        tx_id: CompactString::from(tx_id),
                        timestamp: now_millis(),
                        status: TxStatus::Blocked,
                        command_count: commands.len(),
                        patch_count,
                        patches: patch_traces(&applied.sheet_patches),
                        sources,
                        reason: conflicts
                            .first()
                            .map(|conflict| CompactString::from(conflict.reason.as_str())),
                    },
                );
                warn!(tx = tx_id, conflicts = conflicts.len(), "turn transaction blocked");
                Ok(TurnOutcome {
                    new_state,
                    logs,
                    has_error: true,
                    rolled_back: true,
                    applied_patches: 0,
                })
            }
        }
    }

    /// Validates a patch batch against a store seeded from the *base*
    /// state's metadata. Source gating rejects the whole batch before any
    /// patch is attempted; otherwise patches apply independently and any
    /// conflict blocks the batch.
    fn validate_patches<S: TurnState>(
        &self,
        base: &S,
        patches: &[SheetPatch],
    ) -> Result<Validation, StoreError> {
        let base_meta = base.runtime_meta().cloned().unwrap_or_default();
        let mut store = TableStore::from_runtime_meta(&base_meta);

        let source_conflicts = self.source_ownership_conflicts(patches);
        if !source_conflicts.is_empty() {
            store.record_conflicts(
                ConflictReason::SourceNotAllowed,
                source_conflicts.len() as u64,
            );
            return Ok(Validation::Blocked {
                meta: store.export_meta(),
                conflicts: source_conflicts,
                source_gated: true,
            });
        }

        let report = store.apply_patches_with_report(patches)?;
        if !report.conflicts.is_empty() {
            // Discard the partially applied store wholesale; the blocked
            // metadata keeps the base counters plus the conflict stats.
            let mut clean = TableStore::from_runtime_meta(&base_meta);
            for conflict in &report.conflicts {
                clean.record_conflicts(conflict.reason, 1);
            }
            return Ok(Validation::Blocked {
                meta: clean.export_meta(),
                conflicts: report.conflicts,
                source_gated: false,
            });
        }

        self.acquire_auto_locks(&mut store, patches);
        Ok(Validation::Ok {
            meta: store.export_meta(),
            applied: report.applied,
        })
    }

    fn source_ownership_conflicts(&self, patches: &[SheetPatch]) -> Vec<PatchConflict> {
        patches
            .iter()
            .filter(|patch| self.config.is_gated_sheet(&patch.sheet_id))
            .filter(|patch| !self.config.is_allowed_gated_source(patch.source.as_deref()))
            .map(|patch| {
                let source = patch
                    .source
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("unspecified");
                PatchConflict {
                    sheet_id: patch.sheet_id.clone(),
                    row_id: patch.row_id.clone(),
                    reason: ConflictReason::SourceNotAllowed,
                    message: format!("source={source}"),
                    expected: None,
                    actual: None,
                    field: None,
                }
            })
            .collect()
    }

    /// One-way pin for committed memory rows: an upsert into a gated sheet
    /// whose row id is the reserved prefix + digits, stamped by the memory
    /// writer, acquires a permanent row lock under the reserved owner.
    fn acquire_auto_locks(&self, store: &mut TableStore, patches: &[SheetPatch]) {
        for patch in patches {
            if patch.operation != PatchOp::Upsert || !self.config.is_gated_sheet(&patch.sheet_id) {
                continue;
            }
            let from_memory_writer = patch
                .source
                .as_deref()
                .is_some_and(|source| source.trim().starts_with(self.config.allowed_source_prefix.as_str()));
            if !from_memory_writer {
                continue;
            }
            let row_key = patch.row_id.id_key().trim().to_uppercase();
            let Some(digits) = row_key.strip_prefix(self.config.autolock_id_prefix.as_str()) else {
                continue;
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            store.lock_row(
                RowLock::new(patch.sheet_id.clone(), row_key.as_str(), self.config.autolock_owner.clone())
                    .with_reason(self.config.autolock_reason.clone()),
            );
        }
    }

    fn blocked_log(&self, tx_id: &str, conflicts: &[PatchConflict], source_gated: bool) -> LogEntry {
        let summary = conflicts
            .iter()
            .take(self.config.conflict_summary_limit)
            .map(PatchConflict::summary_line)
            .collect::<Vec<_>>()
            .join(" | ");
        if source_gated {
            LogEntry::system(
                format!("{tx_id}:source-blocked"),
                format!(
                    "回合事务阻断：校验失败 source_not_allowed {} 条。{summary}",
                    conflicts.len()
                ),
            )
        } else {
            LogEntry::system(
                format!("{tx_id}:blocked"),
                format!(
                    "回合事务阻断：检测到并发冲突 {} 条。{summary}",
                    conflicts.len()
                ),
            )
        }
    }

    /// Installs `meta` on `state`, carrying the base's journal forward and
    /// appending the new trace under the ring-buffer cap.
    fn install_meta<S: TurnState>(
        &self,
        state: &mut S,
        base: &S,
        mut meta: RuntimeMeta,
        trace: TransactionTrace,
    ) {
        meta.tx_journal = base
            .runtime_meta()
            .map(|prior| prior.tx_journal.clone())
            .unwrap_or_default();
        meta.push_trace(trace, self.config.tx_journal_limit);
        state.set_runtime_meta(meta);
    }
}

/// One-shot entry point bound to the default engine configuration.
pub fn apply_turn_transaction<S, F>(
    base: &S,
    commands: &[Command],
    apply_commands: F,
    options: &TurnOptions,
) -> Result<TurnOutcome<S>, StoreError>
where
    S: TurnState,
    F: FnOnce(&S, &[Command]) -> ApplyResult<S>,
{
    TurnEngine::default().apply(base, commands, apply_commands, options)
}

fn build_tx_id() -> CompactString {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    compact_str::format_compact!("tx-{}-{}", now_millis(), &suffix[..6])
}

fn collect_sources(commands: &[Command]) -> Vec<CompactString> {
    let mut sources = Vec::new();
    for command in commands {
        let source = command.trace_source();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    sources
}
