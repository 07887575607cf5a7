//! Change notification models emitted by the store after a write completes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric id the store assigns to records and attributes in its diff tables
pub type RecordId = u64;

/// Numeric id of an attribute (property) in the store's diff tables
pub type AttributeId = u64;

/// Store key form of a record key or attribute name: trimmed, spaces as `_`.
pub fn normalize_key(name: &str) -> String {
    name.trim().replace(' ', "_")
}

// ============================================================================
// Attribute values
// ============================================================================

/// A single value stored under an attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataValue {
    /// Free text (the usual carrier of a dependency spec)
    Text(String),
    /// Reference to another record by its key
    Record(String),
    Number(f64),
    Boolean(bool),
}

impl DataValue {
    /// Textual form of the value when it can carry a dependency spec.
    pub fn as_spec_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) | DataValue::Record(s) => Some(s.as_str()),
            DataValue::Number(_) | DataValue::Boolean(_) => None,
        }
    }

    /// Whether this value matches `needle` for query evaluation.
    pub fn matches(&self, needle: &str) -> bool {
        match self {
            DataValue::Text(s) | DataValue::Record(s) => s == needle,
            DataValue::Number(n) => needle.parse::<f64>().map(|v| v == *n).unwrap_or(false),
            DataValue::Boolean(b) => needle.parse::<bool>().map(|v| v == *b).unwrap_or(false),
        }
    }
}

/// All values a subject currently holds for one attribute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    /// Store id of the attribute, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<AttributeId>,
    #[serde(default)]
    pub values: Vec<DataValue>,
}

impl AttributeDescriptor {
    pub fn new(values: Vec<DataValue>) -> Self {
        Self { id: None, values }
    }

    pub fn text<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(values.into_iter().map(|v| DataValue::Text(v.into())).collect())
    }
}

// ============================================================================
// Diff tables
// ============================================================================

/// One low-level row inserted into or deleted from a diff table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub record_id: RecordId,
    pub attribute_id: AttributeId,
    #[serde(default)]
    pub value: String,
}

impl ChangeEntry {
    pub fn new(record_id: RecordId, attribute_id: AttributeId, value: impl Into<String>) -> Self {
        Self {
            record_id,
            attribute_id,
            value: value.into(),
        }
    }
}

/// Inserted and deleted rows of one diff table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    #[serde(default)]
    pub inserted: Vec<ChangeEntry>,
    #[serde(default)]
    pub deleted: Vec<ChangeEntry>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.inserted.iter().chain(self.deleted.iter())
    }

    /// Keep only the rows satisfying `predicate`.
    pub fn retain(&mut self, mut predicate: impl FnMut(&ChangeEntry) -> bool) {
        self.inserted.retain(&mut predicate);
        self.deleted.retain(&mut predicate);
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Notification emitted once per completed write
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Key of the written record; `None` when the store could not resolve it
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Numeric store id of the subject, used to scope the housekeeping scan
    #[serde(default)]
    pub subject_record_id: Option<RecordId>,
    /// Attributes the subject holds after the write, keyed by store key form
    #[serde(default)]
    pub current_attributes: BTreeMap<String, AttributeDescriptor>,
    /// Per-table inserted/deleted rows produced by the write
    #[serde(default)]
    pub diff: BTreeMap<String, TableDiff>,
    #[serde(default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

impl ChangeNotification {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            emitted_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_record_id(mut self, record_id: RecordId) -> Self {
        self.subject_record_id = Some(record_id);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attr: AttributeDescriptor) -> Self {
        self.current_attributes.insert(name.into(), attr);
        self
    }

    pub fn with_inserted(mut self, table: impl Into<String>, entry: ChangeEntry) -> Self {
        self.diff.entry(table.into()).or_default().inserted.push(entry);
        self
    }

    pub fn with_deleted(mut self, table: impl Into<String>, entry: ChangeEntry) -> Self {
        self.diff.entry(table.into()).or_default().deleted.push(entry);
        self
    }

    /// Subject key, treating an empty string like a missing reference.
    pub fn subject(&self) -> Option<&str> {
        self.subject_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// Notification emitted when a record is removed.
///
/// Carries only the dependency spec values the record held before deletion;
/// there is no new state to diff against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteNotification {
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub prior_spec: Vec<String>,
}

impl DeleteNotification {
    pub fn new<I, S>(subject_id: impl Into<String>, prior_spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject_id: Some(subject_id.into()),
            prior_spec: prior_spec.into_iter().map(Into::into).collect(),
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject_id.as_deref().filter(|s| !s.is_empty())
    }
}
