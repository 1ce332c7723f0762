use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recsync_core::{
    normalized, CanonicalRecord, ExistingRecord, SchemaError, Snapshot, StorageId, TableSchema,
    WritePlan,
};
use tokio::sync::Mutex;

use crate::{ApplyReport, PersistenceGateway, StorageError};

#[derive(Debug, Clone)]
struct StoredRow {
    identifier: Option<String>,
    values: BTreeMap<String, Option<String>>,
    inserted_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct TableState {
    columns: Option<Vec<String>>,
    next_id: i64,
    rows: BTreeMap<StorageId, StoredRow>,
    row_writes: usize,
}

/// Table held in process memory with the same contract as the Postgres gateway.
/// Apply works on a copy and swaps it in only when every write succeeded.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<TableState>,
    fail_next_apply: Mutex<Option<String>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a table that already exists with exactly these columns.
    pub fn with_existing_columns(columns: &[&str]) -> Self {
        Self {
            state: Mutex::new(TableState {
                columns: Some(columns.iter().map(ToString::to_string).collect()),
                ..TableState::default()
            }),
            fail_next_apply: Mutex::new(None),
        }
    }

    /// Make the next `apply` fail after it has written part of the plan.
    pub async fn fail_next_apply(&self, reason: &str) {
        *self.fail_next_apply.lock().await = Some(reason.to_string());
    }

    /// Insert a row directly, bypassing reconciliation. The identifier is stored as given,
    /// untrimmed. Returns its storage id.
    pub async fn seed(
        &self,
        record: &CanonicalRecord,
        inserted_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
    ) -> StorageId {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = StorageId(state.next_id);
        state.rows.insert(
            id,
            StoredRow {
                identifier: record.identifier.clone(),
                values: record.fields.clone(),
                inserted_at: Some(inserted_at),
                updated_at,
            },
        );
        id
    }

    /// Every stored row, ordered by storage id.
    pub async fn rows(&self) -> Vec<ExistingRecord> {
        let state = self.state.lock().await;
        state
            .rows
            .iter()
            .map(|(id, row)| ExistingRecord {
                storage_id: *id,
                record: CanonicalRecord {
                    identifier: row.identifier.clone(),
                    fields: row.values.clone(),
                },
                inserted_at: row.inserted_at,
                updated_at: row.updated_at,
            })
            .collect()
    }

    /// Rows touched by committed inserts and updates since creation.
    pub async fn row_writes(&self) -> usize {
        self.state.lock().await.row_writes
    }
}

fn write_plan(
    state: &mut TableState,
    schema: &TableSchema,
    plan: &WritePlan,
    fail_after_inserts: Option<&str>,
) -> Result<ApplyReport, String> {
    let mut report = ApplyReport::default();
    for insert in &plan.inserts {
        if state
            .rows
            .values()
            .any(|r| r.identifier.as_deref() == Some(insert.identifier.as_str()))
        {
            return Err(format!(
                "duplicate key value violates unique constraint on {} = {}",
                schema.identifier_field, insert.identifier
            ));
        }
        state.next_id += 1;
        let values = schema
            .content_fields
            .iter()
            .map(|f| (f.clone(), insert.values.get(f).cloned().flatten()))
            .collect();
        state.rows.insert(
            StorageId(state.next_id),
            StoredRow {
                identifier: Some(insert.identifier.clone()),
                values,
                inserted_at: Some(insert.inserted_at),
                updated_at: Some(insert.updated_at),
            },
        );
        state.row_writes += 1;
        report.inserted += 1;
    }

    if let Some(reason) = fail_after_inserts {
        return Err(reason.to_string());
    }

    for update in &plan.updates {
        let row = state
            .rows
            .get_mut(&update.storage_id)
            .filter(|r| r.identifier.as_deref() == Some(update.identifier.as_str()))
            .ok_or_else(|| {
                format!(
                    "row {} for identifier {} changed underneath the run",
                    update.storage_id, update.identifier
                )
            })?;
        for (field, value) in &update.changes {
            if !schema.content_fields.contains(field) {
                return Err(format!("column \"{field}\" does not exist"));
            }
            row.values.insert(field.clone(), value.clone());
        }
        row.updated_at = Some(update.updated_at);
        state.row_writes += 1;
        report.updated += 1;
    }
    Ok(report)
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StorageError> {
        schema.validate()?;
        let mut state = self.state.lock().await;
        let columns = state.columns.get_or_insert_with(|| {
            schema.columns().into_iter().map(ToString::to_string).collect()
        });
        for column in schema.columns() {
            if !columns.iter().any(|c| c == column) {
                return Err(SchemaError::MissingColumn {
                    table: schema.qualified_name(),
                    column: column.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn load_existing(&self, schema: &TableSchema) -> Result<Snapshot, StorageError> {
        let state = self.state.lock().await;
        let mut snapshot = Snapshot::new();
        for (id, row) in &state.rows {
            let Some(key) = normalized(row.identifier.as_deref()) else {
                continue;
            };
            let fields = schema
                .content_fields
                .iter()
                .map(|f| (f.clone(), row.values.get(f).cloned().flatten()))
                .collect();
            snapshot.insert(
                key.to_string(),
                ExistingRecord {
                    storage_id: *id,
                    record: CanonicalRecord {
                        identifier: row.identifier.clone(),
                        fields,
                    },
                    inserted_at: row.inserted_at,
                    updated_at: row.updated_at,
                },
            );
        }
        Ok(snapshot)
    }

    async fn apply(
        &self,
        schema: &TableSchema,
        plan: &WritePlan,
    ) -> Result<ApplyReport, StorageError> {
        if plan.is_empty() {
            return Ok(ApplyReport::default());
        }
        let injected = self.fail_next_apply.lock().await.take();
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        match write_plan(&mut working, schema, plan, injected.as_deref()) {
            Ok(report) => {
                *state = working;
                Ok(report)
            }
            Err(reason) => Err(StorageError::RolledBack {
                inserts: plan.inserts.len(),
                updates: plan.updates.len(),
                reason,
            }),
        }
    }
}
