use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A domain command, normalized once at the system boundary. The engine never
/// interprets `payload`; it only routes on the normalized action, the atomic
/// flag, and the transaction marker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    /// Normalized (trimmed, lowercased) action name.
    pub action: CompactString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CompactString>,
    /// Explicit request for atomic grouping.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub atomic: bool,
    /// Shared marker (`transactionId`/`txId`/`turnId`/`turn`) tying commands
    /// of one logical transaction together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_marker: Option<CompactString>,
    /// The untouched command body, passed through to the applier.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Command {
    pub fn new(action: impl AsRef<str>) -> Self {
        Self {
            action: normalize_action(action.as_ref()),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<CompactString>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<CompactString>) -> Self {
        self.transaction_marker = Some(marker.into());
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Folds the duck-typed field aliases of raw host commands into the
    /// normalized shape: `action`/`type`/`command`/`mode` for the action,
    /// `transactionId`/`txId`/`turnId`/`turn`/`回合` for the marker, and
    /// `atomic`/`transaction` booleans for the explicit flag.
    pub fn from_value(raw: &Value) -> Self {
        let action = ["action", "type", "command", "mode"]
            .iter()
            .find_map(|key| raw.get(key))
            .and_then(Value::as_str)
            .map(normalize_action)
            .unwrap_or_default();

        let transaction_marker = ["transactionId", "txId", "turnId", "turn", "回合"]
            .iter()
            .find_map(|key| raw.get(key))
            .and_then(marker_text);

        let atomic = ["atomic", "transaction"]
            .iter()
            .any(|key| raw.get(key).and_then(Value::as_bool) == Some(true));

        let source = raw
            .get("source")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(CompactString::from);

        Self {
            action,
            source,
            atomic,
            transaction_marker,
            payload: raw.clone(),
        }
    }

    /// The writer identity recorded in trace `sources`: declared source,
    /// falling back to the action name, else `"unknown"`.
    pub fn trace_source(&self) -> CompactString {
        if let Some(source) = &self.source
            && !source.trim().is_empty()
        {
            return CompactString::from(source.trim());
        }
        if self.action.is_empty() {
            CompactString::from("unknown")
        } else {
            self.action.clone()
        }
    }
}

pub(crate) fn normalize_action(raw: &str) -> CompactString {
    CompactString::from(raw.trim().to_lowercase())
}

fn marker_text(value: &Value) -> Option<CompactString> {
    match value {
        Value::String(text) if !text.is_empty() => Some(CompactString::from(text.as_str())),
        Value::Number(number) => Some(CompactString::from(number.to_string())),
        _ => None,
    }
}
