use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value stored in a document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),

    /// String content typically used for keywords, IDs, or non-tokenized metadata.
    String(String),

    /// Text content.
    Text(String),

    /// Binary content with an optional MIME type.
    Bytes(Vec<u8>, Option<String>),

    /// List of values (e.g. tags, or a hierarchical facet path).
    List(Vec<String>),

    /// Facet ordinals assigned by the taxonomy writer.
    Ordinals(Vec<u32>),
}

impl DataValue {
    /// Returns the text value if this is a Text or String variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) | DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value if this is an Int64 variant.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DataValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float value if this is a Float64 variant.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            DataValue::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the boolean value if this is a Bool variant.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the list items if this is a List variant.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            DataValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the ordinals if this is an Ordinals variant.
    pub fn as_ordinals(&self) -> Option<&[u32]> {
        match self {
            DataValue::Ordinals(ords) => Some(ords),
            _ => None,
        }
    }
}

// --- Conversions ---

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int64(v)
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> Self {
        DataValue::Int64(v as i64)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float64(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<Vec<String>> for DataValue {
    fn from(v: Vec<String>) -> Self {
        DataValue::List(v)
    }
}

/// A document: a collection of named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Optional external identifier.
    pub id: Option<String>,

    /// Field data.
    pub fields: HashMap<String, DataValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self {
            id: None,
            fields: HashMap::new(),
        }
    }

    /// Create a new document with a specific ID.
    pub fn new_with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            fields: HashMap::new(),
        }
    }

    /// Add a field to the document.
    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add a text field.
    pub fn add_text(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.fields
            .insert(name.into(), DataValue::Text(text.into()));
        self
    }

    /// Add an integer field.
    pub fn add_integer(mut self, name: impl Into<String>, value: i64) -> Self {
        self.fields.insert(name.into(), DataValue::Int64(value));
        self
    }

    /// Add a list field.
    pub fn add_list<I, S>(mut self, name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.fields.insert(name.into(), DataValue::List(items));
        self
    }

    /// Get a reference to a field's value.
    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.fields.get(name)
    }

    /// Check if the document has a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Exact-match identity of a document: a field name and the text it must hold.
///
/// Used as the update key for replace semantics and for deletes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new(field: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Whether `doc` holds this term.
    ///
    /// The pseudo-field `_id` matches the document's external ID.
    pub fn matches(&self, doc: &Document) -> bool {
        if self.field == "_id" {
            if let Some(id) = &doc.id {
                return id == &self.text;
            }
        }
        match doc.get(&self.field) {
            Some(DataValue::List(items)) => items.iter().any(|item| item == &self.text),
            Some(value) => value.as_text() == Some(self.text.as_str()),
            None => false,
        }
    }
}
