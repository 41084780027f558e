use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub mod collab;

pub use collab::{Document, DocumentError};

/// Stable external identifier of a synchronized document (e.g. an episode id).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Longest id, in bytes, that storage keys can carry.
    pub const MAX_LEN: usize = u16::MAX as usize;

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= Self::MAX_LEN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of the user behind a connection or request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One top-level content unit of a document, derived from the replicated tree.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub text: String,
    /// ProseMirror-style inline content (`[{ "type": "text", "text": ... }]`).
    pub structured_content: Value,
    pub block_type: String,
    pub order: u32,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Block {
    /// A block holding a single run of plain text.
    pub fn paragraph(id: impl Into<String>, text: impl Into<String>, order: u32) -> Self {
        let text = text.into();
        let structured_content = if text.is_empty() {
            Value::Array(Vec::new())
        } else {
            serde_json::json!([{ "type": "text", "text": text }])
        };
        Self {
            id: id.into(),
            text,
            structured_content,
            block_type: "paragraph".to_string(),
            order,
            attributes: Map::new(),
        }
    }

    pub fn with_type(mut self, block_type: impl Into<String>) -> Self {
        self.block_type = block_type.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}
