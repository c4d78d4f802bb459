//! One line of a JSONL log

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single self-contained log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 with millis, UTC
    pub ts: String,
    pub level: String,
    /// Device that wrote the line
    pub device: String,
    /// Module path of the event
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, root first, joined with " > "
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<String>,
        device: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            device: device.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Serialize without a trailing newline
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_fields_survive_a_line() {
        let entry = LogEntry::new("debug", "node-a", "meshlink_core::messaging", "Relayed envelope")
            .with_fields(serde_json::json!({ "ttl": 3, "forwarded": 2 }));
        let line = entry.to_json_line().unwrap();
        assert!(line.contains("\"device\":\"node-a\""));
        assert!(line.contains("\"ttl\":3"));
        assert!(!line.contains("span"));

        let parsed = LogEntry::from_json_line(&line).unwrap();
        assert_eq!(parsed, entry);
    }
}
