//! Core record model and audit types for recsync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recsync-core";

/// Placeholder some exports write into cells that were left blank.
pub const MISSING_SENTINEL: &str = "missing";

/// Collapse null, blank and the missing sentinel into `None`; trim everything else.
pub fn normalized(value: Option<&str>) -> Option<&str> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(MISSING_SENTINEL) {
        None
    } else {
        Some(trimmed)
    }
}

/// Equality under normalization: `None`, `""`, `"  "` and `"missing"` all match each other.
pub fn values_equivalent(a: Option<&str>, b: Option<&str>) -> bool {
    normalized(a) == normalized(b)
}

/// One run of the reconciler: every timestamp written by the run uses `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStamp {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
}

impl RunStamp {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            at: Utc::now(),
        }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            at,
        }
    }
}

/// Transient, normalized input record keyed by its natural identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub identifier: Option<String>,
    pub fields: BTreeMap<String, Option<String>>,
}

impl CanonicalRecord {
    pub fn new(identifier: Option<String>) -> Self {
        Self {
            identifier,
            fields: BTreeMap::new(),
        }
    }

    pub fn keyed(identifier: &str) -> Self {
        Self::new(Some(identifier.to_string()))
    }

    pub fn with_field(mut self, name: &str, value: Option<&str>) -> Self {
        self.set(name, value.map(ToString::to_string));
        self
    }

    pub fn set(&mut self, name: &str, value: Option<String>) {
        self.fields.insert(name.to_string(), value);
    }

    /// Raw value of a field; `None` for both a null value and an absent field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_deref())
    }

    /// The matchable key, or `None` when the identifier is null or blank.
    pub fn key(&self) -> Option<&str> {
        normalized(self.identifier.as_deref())
    }
}

/// Opaque handle assigned by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageId(pub i64);

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted record as seen in the per-run snapshot.
///
/// `record.identifier` is the value exactly as stored, which may differ from the
/// snapshot key by surrounding whitespace. Tables created elsewhere may leave
/// `inserted_at` null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRecord {
    pub storage_id: StorageId,
    pub record: CanonicalRecord,
    pub inserted_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the target table, keyed by identifier.
pub type Snapshot = BTreeMap<String, ExistingRecord>;

/// Minimal field-level change set for one existing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub storage_id: StorageId,
    /// Stored identifier, used verbatim to address the row.
    pub identifier: String,
    pub changes: BTreeMap<String, Option<String>>,
}

impl Delta {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Full row for a record the table has never seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertRow {
    pub identifier: String,
    pub values: BTreeMap<String, Option<String>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update: only changed fields, plus the new `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInstruction {
    pub storage_id: StorageId,
    pub identifier: String,
    pub changes: BTreeMap<String, Option<String>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePlan {
    pub stamp: RunStamp,
    pub inserts: Vec<InsertRow>,
    pub updates: Vec<UpdateInstruction>,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Per-run accounting. Every input record lands in exactly one of the four top-level counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub skipped_no_identifier: usize,
    pub skipped_duplicate: usize,
    pub per_field_update_counts: BTreeMap<String, usize>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.skipped
    }

    pub fn wrote_anything(&self) -> bool {
        self.inserted > 0 || self.updated > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditColumns {
    pub inserted_at: String,
    pub updated_at: String,
}

impl Default for AuditColumns {
    fn default() -> Self {
        Self {
            inserted_at: "inserted_at".to_string(),
            updated_at: "updated_at".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("`{0}` is not a valid column or table name")]
    InvalidName(String),
    #[error("column `{0}` is declared more than once")]
    DuplicateColumn(String),
    #[error("record #{position} carries undeclared field `{field}`")]
    UndeclaredField { field: String, position: usize },
    #[error("table {table} is missing column `{column}`")]
    MissingColumn { table: String, column: String },
    #[error("table {table} has no unique constraint on `{column}`")]
    MissingUniqueKey { table: String, column: String },
    #[error("column `{column}` of {table} is {found}, expected {expected}")]
    ColumnType {
        table: String,
        column: String,
        found: String,
        expected: String,
    },
}

/// Declared shape of the target table. Checked once per run before any write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub identifier_field: String,
    pub content_fields: Vec<String>,
    #[serde(default)]
    pub audit: AuditColumns,
}

impl TableSchema {
    pub fn new(schema: &str, table: &str, identifier_field: &str, content_fields: &[&str]) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            identifier_field: identifier_field.to_string(),
            content_fields: content_fields.iter().map(ToString::to_string).collect(),
            audit: AuditColumns::default(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Every column the table must carry, excluding the storage id.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.content_fields.len() + 3);
        out.push(self.identifier_field.as_str());
        out.extend(self.content_fields.iter().map(String::as_str));
        out.push(self.audit.inserted_at.as_str());
        out.push(self.audit.updated_at.as_str());
        out
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        for name in [self.schema.as_str(), self.table.as_str()] {
            if !is_plain_identifier(name) {
                return Err(SchemaError::InvalidName(name.to_string()));
            }
        }
        let mut seen = BTreeSet::new();
        for column in self.columns() {
            if !is_plain_identifier(column) || column == "id" {
                return Err(SchemaError::InvalidName(column.to_string()));
            }
            if !seen.insert(column) {
                return Err(SchemaError::DuplicateColumn(column.to_string()));
            }
        }
        Ok(())
    }

    /// Fail fast on any field the declared schema does not know about.
    pub fn check_records(&self, records: &[CanonicalRecord]) -> Result<(), SchemaError> {
        for (position, record) in records.iter().enumerate() {
            if let Some(field) = record
                .fields
                .keys()
                .find(|f| !self.content_fields.iter().any(|c| c == *f))
            {
                return Err(SchemaError::UndeclaredField {
                    field: field.clone(),
                    position,
                });
            }
        }
        Ok(())
    }
}

/// Lowercase ASCII letters, digits and underscores, not starting with a digit.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
