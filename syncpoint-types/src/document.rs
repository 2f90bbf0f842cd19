//! Document - the flat, field-keyed record the store holds.
//!
//! Every Syncpoint record (session, channel, subscription, installation) is
//! one of these, distinguished by its `type` field. Typed models decode from
//! and encode to documents through [`Document::decode`] and
//! [`Document::encode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{DocId, DocumentError};

/// Name of the discriminator field.
pub const TYPE_FIELD: &str = "type";

/// Fields whose values never appear in `Debug` output.
const REDACTED_FIELDS: &[&str] = &["oauth_creds"];

/// A stored document: an id plus a flat map of fields.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    id: DocId,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Document {
    /// Create an empty document carrying only its `type` discriminator.
    pub fn new(id: DocId, doc_type: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.to_string(), Value::String(doc_type.to_string()));
        Self { id, fields }
    }

    /// Create a document from an id and a field map.
    pub fn from_fields(id: DocId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// The document id.
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// The `type` discriminator, if present.
    pub fn doc_type(&self) -> Option<&str> {
        self.get_str(TYPE_FIELD)
    }

    /// Whether the discriminator equals `doc_type`.
    pub fn is_type(&self, doc_type: &str) -> bool {
        self.doc_type() == Some(doc_type)
    }

    /// Raw field access.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String field access; `None` if absent or not a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Whether a field is present and not null.
    pub fn has(&self, field: &str) -> bool {
        matches!(self.fields.get(field), Some(v) if !v.is_null())
    }

    /// Set a field.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    /// Remove a field, returning its old value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Overwrite fields from `other`, keeping fields it does not mention.
    ///
    /// This is how inbound replication applies server-written fields.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.fields.insert(key, value);
        }
    }

    /// All fields (including `type`, excluding the id).
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Decode into a typed model, checking the discriminator first.
    pub fn decode<T: DeserializeOwned>(&self, expected: &'static str) -> Result<T, DocumentError> {
        if !self.is_type(expected) {
            return Err(DocumentError::WrongType {
                id: self.id.clone(),
                expected,
                actual: self.doc_type().map(str::to_string),
            });
        }
        let mut value = serde_json::to_value(self).map_err(|e| self.malformed(e))?;
        // The discriminator belongs to the document, not the model
        if let Value::Object(fields) = &mut value {
            fields.remove(TYPE_FIELD);
        }
        serde_json::from_value(value).map_err(|e| self.malformed(e))
    }

    /// Encode a typed model (which must serialize to an object with `_id`)
    /// and stamp it with the `doc_type` discriminator.
    pub fn encode<T: Serialize>(model: &T, doc_type: &str) -> Result<Self, DocumentError> {
        let malformed = |e: serde_json::Error| DocumentError::Malformed {
            id: DocId::new(""),
            reason: e.to_string(),
        };
        let value = serde_json::to_value(model).map_err(malformed)?;
        let mut doc: Document = serde_json::from_value(value).map_err(malformed)?;
        doc.set(TYPE_FIELD, doc_type);
        Ok(doc)
    }

    fn malformed(&self, err: serde_json::Error) -> DocumentError {
        DocumentError::Malformed {
            id: self.id.clone(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"_id", &self.id.as_str());
        for (key, value) in &self.fields {
            if REDACTED_FIELDS.contains(&key.as_str()) {
                map.entry(key, &"[REDACTED]");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}
