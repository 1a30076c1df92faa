//! On-disk record format for the chat log.
//!
//! One JSON object per line: `{"name": ..., "timestamp": ..., "content": ...}`.
//! No header, no schema version. All (de)serialization of log lines goes
//! through this module so the format can grow a version field without
//! touching callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ISO-8601 UTC with millisecond precision, e.g. `2024-05-01T12:00:00.123Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// A persisted chat message. Field order is the on-disk field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub name: String,
    pub timestamp: String,
    pub content: String,
}

impl ChatMessage {
    /// Build a record stamped with the given server receipt time.
    pub fn new(name: &str, content: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            timestamp: received_at.format(TIMESTAMP_FORMAT).to_string(),
            content: content.to_string(),
        }
    }
}

/// Serialize a record as a single newline-terminated line.
///
/// Newlines inside `name` or `content` are escaped by JSON, so a record
/// never spans more than one line.
pub fn encode_line(message: &ChatMessage) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (without its terminator) back into a record.
pub fn decode_line(line: &str) -> Result<ChatMessage, serde_json::Error> {
    serde_json::from_str(line)
}
