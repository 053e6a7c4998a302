use crate::table::types::now_millis;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

pub const SYSTEM_SENDER: &str = "系统";

/// A user-facing log line. The engine only synthesizes system-sender entries;
/// everything else comes from the command applier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub sender: CompactString,
    pub text: String,
    pub timestamp: u64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<CompactString>,
}

impl LogEntry {
    pub fn system(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: CompactString::from(SYSTEM_SENDER),
            text: text.into(),
            timestamp: now_millis(),
            kind: Some(CompactString::from("system")),
        }
    }
}

/// Legacy compatibility shim behind the applier's explicit `has_error` flag:
/// localized failure substrings that mark an apply result as errored.
const ERROR_LOG_MARKERS: &[&str] = &["失败", "异常", "错误", "invalid", "missing", "out of bounds"];

pub fn log_text_reports_error(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ERROR_LOG_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
