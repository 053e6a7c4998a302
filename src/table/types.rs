use compact_str::{CompactString, ToCompactString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A schemaless record of fields to values. Identity lives in the sheet's
/// key field.
pub type TableRow = serde_json::Map<String, Value>;

/// Sheet names are free-form; hosts typically use the template ids from the
/// key-field registry (`NPC_Registry`, `ITEM_Inventory`, ...).
pub type SheetId = CompactString;

/// Row identity: the value of the sheet's key field. Strings and finite
/// integers are the only accepted identity shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Text(CompactString),
    Integer(i64),
}

impl RowId {
    /// Canonical string form, used for version bookkeeping and index keys.
    pub fn id_key(&self) -> CompactString {
        match self {
            RowId::Text(text) => text.clone(),
            RowId::Integer(value) => value.to_compact_string(),
        }
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowId::Text(text) => f.write_str(text),
            RowId::Integer(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        RowId::Text(CompactString::from(value))
    }
}

impl From<String> for RowId {
    fn from(value: String) -> Self {
        RowId::Text(CompactString::from(value))
    }
}

impl From<i64> for RowId {
    fn from(value: i64) -> Self {
        RowId::Integer(value)
    }
}

/// Reads a row's identity out of its key field. Blank strings and non-finite
/// numbers do not resolve; a missing identity is the caller's configuration
/// error, never silently defaulted.
pub fn read_row_id(row: &TableRow, key_field: &str) -> Option<RowId> {
    match row.get(key_field) {
        Some(Value::String(text)) if !text.trim().is_empty() => {
            Some(RowId::Text(CompactString::from(text.as_str())))
        }
        Some(Value::Number(number)) => number.as_i64().map(RowId::Integer),
        _ => None,
    }
}

/// Built-in key-field registry for the template sheets. Sheets not listed
/// here key on `"id"`.
pub const DEFAULT_KEY_FIELDS: &[(&str, &str)] = &[
    ("SYS_GlobalState", "_global_id"),
    ("SYS_CommandAudit", "command_id"),
    ("SYS_TransactionAudit", "tx_id"),
    ("SYS_ValidationIssue", "issue_id"),
    ("SYS_MappingRegistry", "domain"),
    ("NPC_Registry", "NPC_ID"),
    ("ITEM_Inventory", "物品ID"),
    ("QUEST_Active", "任务ID"),
    ("FACTION_Standing", "势力ID"),
    ("ECON_Ledger", "ledger_id"),
    ("COMBAT_Encounter", "单位名称"),
    ("COMBAT_BattleMap", "单位名称"),
    ("LOG_Summary", "编码索引"),
    ("LOG_Outline", "编码索引"),
    ("DICE_Pool", "ID"),
    ("SKILL_Library", "SKILL_ID"),
    ("CHARACTER_Skills", "LINK_ID"),
    ("FEAT_Library", "FEAT_ID"),
    ("CHARACTER_Feats", "LINK_ID"),
    ("CHARACTER_Registry", "CHAR_ID"),
    ("CHARACTER_Attributes", "CHAR_ID"),
    ("CHARACTER_Resources", "CHAR_ID"),
    ("PHONE_Device", "device_id"),
    ("PHONE_Contacts", "contact_id"),
    ("PHONE_Threads", "thread_id"),
    ("PHONE_Messages", "message_id"),
    ("PHONE_Pending", "pending_id"),
    ("STORY_Mainline", "mainline_id"),
    ("STORY_Triggers", "trigger_id"),
    ("STORY_Milestones", "milestone_id"),
    ("CONTRACT_Registry", "contract_id"),
    ("EXPLORATION_Map_Data", "LocationName"),
    ("COMBAT_Map_Visuals", "SceneName"),
];

pub fn default_key_field(sheet_id: &str) -> &'static str {
    DEFAULT_KEY_FIELDS
        .iter()
        .find(|(id, _)| *id == sheet_id)
        .map_or("id", |(_, key_field)| key_field)
}

/// Current wall-clock time in epoch milliseconds, the timestamp unit used by
/// locks, traces, and log entries.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
