use compact_str::CompactString;
use std::collections::HashSet;

/// Actions that must not be left half-applied: multi-step combat, dice, and
/// initiative sequences. Two or more of these in one batch force the atomic
/// path.
pub const DEFAULT_TRANSACTIONAL_ACTIONS: &[&str] = &[
    "set_encounter_rows",
    "upsert_battle_map_rows",
    "set_map_visuals",
    "set_initiative",
    "consume_dice_rows",
    "refill_dice_pool",
    "roll_dice_check",
    "set_action_economy",
    "spend_action_resource",
    "resolve_attack_check",
    "resolve_saving_throw",
    "resolve_damage_roll",
    "append_combat_resolution",
];

/// Engine tunables. The defaults reproduce the stock policy: an 80-entry
/// journal, source gating on the narrative log sheets, and the memory-writer
/// auto-lock.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring-buffer cap for the transaction journal.
    pub tx_journal_limit: usize,
    /// Sheets whose patches are source-gated.
    pub gated_sheets: Vec<CompactString>,
    /// Source prefix allowed to write gated sheets. Blank sources pass for
    /// legacy compatibility.
    pub allowed_source_prefix: CompactString,
    /// Row-id prefix (followed by digits) that triggers the auto-lock on
    /// commit into a gated sheet.
    pub autolock_id_prefix: CompactString,
    pub autolock_owner: CompactString,
    pub autolock_reason: CompactString,
    /// Max conflict lines quoted in a blocked system log entry.
    pub conflict_summary_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_journal_limit: 80,
            gated_sheets: vec![
                CompactString::from("LOG_Summary"),
                CompactString::from("LOG_Outline"),
            ],
            allowed_source_prefix: CompactString::from("ms:memory"),
            autolock_id_prefix: CompactString::from("AM"),
            autolock_owner: CompactString::from("am-special"),
            autolock_reason: CompactString::from("memory-autolock"),
            conflict_summary_limit: 3,
        }
    }
}

impl EngineConfig {
    pub fn with_journal_limit(mut self, limit: usize) -> Self {
        self.tx_journal_limit = limit.max(1);
        self
    }

    pub fn with_gated_sheets<I, T>(mut self, sheets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CompactString>,
    {
        self.gated_sheets = sheets.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_gated_sheet(&self, sheet_id: &str) -> bool {
        self.gated_sheets.iter().any(|sheet| sheet == sheet_id)
    }

    pub fn is_allowed_gated_source(&self, source: Option<&str>) -> bool {
        let source = source.map(str::trim).unwrap_or_default();
        // Legacy/unified command paths may not stamp a source.
        source.is_empty() || source.starts_with(self.allowed_source_prefix.as_str())
    }
}

/// Per-call routing options for `apply_turn_transaction`.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub force_atomic: bool,
    /// Overrides the default transactional-action set. Entries are matched
    /// against normalized action names.
    pub transactional_actions: Option<HashSet<CompactString>>,
}

impl TurnOptions {
    pub fn force_atomic() -> Self {
        Self {
            force_atomic: true,
            transactional_actions: None,
        }
    }

    pub fn with_transactional_actions<I, T>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.transactional_actions = Some(
            actions
                .into_iter()
                .map(|action| crate::txn::command::normalize_action(action.as_ref()))
                .collect(),
        );
        self
    }
}
