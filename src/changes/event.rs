//! Event parser: one decoded line in, at most one [`ChangeRecord`] out.
//!
//! | Line | Outcome |
//! |------|---------|
//! | empty | heartbeat, ignored |
//! | not a JSON object | ignored |
//! | object without a string `id` (e.g. `{"last_seq": ...}`) | feed metadata, ignored |
//! | object with a string `id` | [`ChangeRecord`]; other fields read best effort |
//!
//! Nothing here returns an error: a long-lived feed must not die on one bad line.

use crate::types::{ChangeRecord, Sequence};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;

/// Parser settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Decode invalid UTF-8 with replacement characters instead of dropping the line
    pub lossy_utf8: bool,
}

/// Revision ids from a `changes` array.
///
/// Accepts `{"rev": ..}` objects and bare strings; anything else, including a
/// missing or `null` array, contributes nothing.
fn revisions(changes: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(entries)) = changes else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(rev) => Some(rev.clone()),
            Value::Object(fields) => fields.get("rev").and_then(Value::as_str).map(str::to_owned),
            _ => None,
        })
        .collect()
}

/// Turns feed lines into change records.
#[derive(Debug, Clone, Default)]
pub struct EventParser {
    config: ParserConfig,
}

impl EventParser {
    /// Create a parser with default settings
    pub fn new() -> Self {
        Self::with_config(ParserConfig::default())
    }

    /// Create a parser with explicit settings
    pub fn with_config(config: ParserConfig) -> Self {
        EventParser { config }
    }

    /// Parser settings
    pub fn config(&self) -> ParserConfig {
        self.config
    }

    /// Parse one line (without its newline).
    ///
    /// # Examples
    ///
    /// ```
    /// use couch_feed::changes::EventParser;
    ///
    /// let parser = EventParser::new();
    /// let record = parser
    ///     .parse(br#"{"seq":2,"id":"doc2","changes":[{"rev":"1-b"}],"deleted":true}"#)
    ///     .unwrap();
    /// assert_eq!(record.id, "doc2");
    /// assert!(record.deleted);
    ///
    /// assert!(parser.parse(b"").is_none());
    /// assert!(parser.parse(br#"{"last_seq":2}"#).is_none());
    /// ```
    pub fn parse(&self, line: &[u8]) -> Option<ChangeRecord> {
        if line.is_empty() {
            return None;
        }

        let text = if self.config.lossy_utf8 {
            String::from_utf8_lossy(line)
        } else {
            match std::str::from_utf8(line) {
                Ok(text) => Cow::Borrowed(text),
                Err(e) => {
                    tracing::debug!("Dropping line with invalid UTF-8: {}", e);
                    return None;
                }
            }
        };

        let mut fields = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => {
                tracing::debug!("Dropping feed line that is not an object");
                return None;
            }
            Err(e) => {
                tracing::debug!("Dropping unparsable feed line ({} bytes): {}", line.len(), e);
                return None;
            }
        };

        let Some(Value::String(id)) = fields.remove("id") else {
            tracing::debug!("Dropping feed line without id");
            return None;
        };

        Some(ChangeRecord {
            id,
            seq: fields.remove("seq").filter(|seq| !seq.is_null()).map(Sequence::new),
            revisions: revisions(fields.get("changes")),
            deleted: fields.get("deleted").and_then(Value::as_bool).unwrap_or(false),
            doc: fields.remove("doc").filter(|doc| !doc.is_null()),
        })
    }
}
