//! Core data types shared by the transport, the parser and the session.
//!
//! - [`Sequence`] - opaque resumption cursor
//! - [`ChangeRecord`] - one parsed event from the feed
//! - [`DatabaseInfo`] - the subset of `GET /{db}/` used for the cursor lookup

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque position in a change feed.
///
/// Servers emit either numbers (`42`) or strings (`"42-g1AAAA..."`). The
/// token is only ever stored and echoed back as `since`; no arithmetic or
/// ordering is performed on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(Value);

impl Sequence {
    /// Wrap a raw JSON token.
    pub fn new(value: Value) -> Self {
        Sequence(value)
    }

    /// The special `now` token understood by the server.
    pub fn now() -> Self {
        Sequence(Value::String("now".to_string()))
    }

    /// Raw JSON value of the token.
    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// Value to send as the `since` query parameter.
    ///
    /// Strings are sent verbatim, everything else as JSON text.
    pub fn to_query_value(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_value())
    }
}

impl From<u64> for Sequence {
    fn from(n: u64) -> Self {
        Sequence(Value::from(n))
    }
}

impl From<&str> for Sequence {
    fn from(s: &str) -> Self {
        Sequence(Value::String(s.to_string()))
    }
}

impl From<String> for Sequence {
    fn from(s: String) -> Self {
        Sequence(Value::String(s))
    }
}

/// One document change reported by the feed.
///
/// Built fresh by the [`EventParser`](crate::changes::EventParser) for every
/// valid line and handed to subscribers by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Identifier of the changed document
    pub id: String,
    /// Feed position of this change, when the server sent one
    pub seq: Option<Sequence>,
    /// Leaf revision identifiers, in server order
    pub revisions: Vec<String>,
    /// Whether the document was deleted
    pub deleted: bool,
    /// Full document body when the feed was requested with `include_docs=true`
    pub doc: Option<Value>,
}

impl ChangeRecord {
    /// Create a record with no revisions.
    pub fn new(id: impl Into<String>) -> Self {
        ChangeRecord {
            id: id.into(),
            seq: None,
            revisions: Vec::new(),
            deleted: false,
            doc: None,
        }
    }

    /// Set the sequence token
    pub fn with_seq(mut self, seq: impl Into<Sequence>) -> Self {
        self.seq = Some(seq.into());
        self
    }

    /// Append a revision
    pub fn with_revision(mut self, rev: impl Into<String>) -> Self {
        self.revisions.push(rev.into());
        self
    }

    /// Mark as deleted
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// First (winning) revision, if any.
    pub fn current_rev(&self) -> Option<&str> {
        self.revisions.first().map(String::as_str)
    }
}

/// Database metadata returned by `GET /{db}/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseInfo {
    /// Database name as reported by the server
    #[serde(default)]
    pub db_name: Option<String>,
    /// Current sequence of the database
    #[serde(default)]
    pub update_seq: Option<Sequence>,
    /// Number of live documents
    #[serde(default)]
    pub doc_count: Option<u64>,
    /// Number of deleted documents
    #[serde(default)]
    pub doc_del_count: Option<u64>,
}
