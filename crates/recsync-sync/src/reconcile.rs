//! Pure reconciliation: classify each input record against the snapshot, diff the matches,
//! and build the write plan. Nothing here touches storage.

use std::collections::BTreeMap;

use recsync_core::{
    normalized, values_equivalent, BatchResult, CanonicalRecord, Delta, ExistingRecord,
    InsertRow, RunStamp, SchemaError, Snapshot, TableSchema, UpdateInstruction, WritePlan,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do when two records in one batch share an identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The last record in input order is reconciled; earlier ones are skipped.
    #[default]
    LastWriteWins,
    /// Fail the whole batch before anything is written.
    Reject,
}

/// What a blank incoming value means when the stored value is not blank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankPolicy {
    /// Blank means "not observed": the stored value stays.
    #[default]
    KeepExisting,
    /// Blank clears the stored value.
    Clear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePolicy {
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
    #[serde(default)]
    pub blanks: BlankPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("schema mismatch: {0}")]
    Schema(#[from] SchemaError),
    #[error("identifier {identifier} appears at records #{first} and #{second}; batch rejected")]
    AmbiguousMatch {
        identifier: String,
        first: usize,
        second: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoIdentifier,
    /// A later record with the same identifier won.
    SupersededBy(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    Skipped(SkipReason),
    New(&'a str),
    Existing(&'a ExistingRecord),
}

/// One classification per input record, in input order.
pub fn classify<'a>(
    records: &'a [CanonicalRecord],
    snapshot: &'a Snapshot,
    duplicates: DuplicatePolicy,
) -> Result<Vec<Classification<'a>>, ReconcileError> {
    let mut last_seen: BTreeMap<&str, usize> = BTreeMap::new();
    for (position, record) in records.iter().enumerate() {
        let Some(key) = record.key() else { continue };
        if let Some(first) = last_seen.insert(key, position) {
            if duplicates == DuplicatePolicy::Reject {
                return Err(ReconcileError::AmbiguousMatch {
                    identifier: key.to_string(),
                    first,
                    second: position,
                });
            }
        }
    }

    Ok(records
        .iter()
        .enumerate()
        .map(|(position, record)| {
            let Some(key) = record.key() else {
                return Classification::Skipped(SkipReason::NoIdentifier);
            };
            match last_seen.get(key) {
                Some(&winner) if winner != position => {
                    Classification::Skipped(SkipReason::SupersededBy(winner))
                }
                _ => match snapshot.get(key) {
                    Some(existing) => Classification::Existing(existing),
                    None => Classification::New(key),
                },
            }
        })
        .collect())
}

/// Field-level diff of one record against its stored counterpart. Only fields whose
/// normalized value differs are included, and new values are stored normalized.
pub fn diff(
    record: &CanonicalRecord,
    existing: &ExistingRecord,
    content_fields: &[String],
    blanks: BlankPolicy,
) -> Delta {
    let mut changes = BTreeMap::new();
    for field in content_fields {
        let incoming = record.field(field);
        let stored = existing.record.field(field);
        if values_equivalent(incoming, stored) {
            continue;
        }
        let incoming = normalized(incoming);
        if incoming.is_none() && blanks == BlankPolicy::KeepExisting {
            continue;
        }
        changes.insert(field.clone(), incoming.map(ToString::to_string));
    }
    Delta {
        storage_id: existing.storage_id,
        identifier: existing
            .record
            .identifier
            .clone()
            .or_else(|| record.key().map(ToString::to_string))
            .unwrap_or_default(),
        changes,
    }
}

/// Counters that cannot be read back from the write plan itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub unchanged: usize,
    pub skipped_no_identifier: usize,
    pub skipped_duplicate: usize,
}

/// Batch result as a projection of the plan plus the non-writing tallies.
pub fn summarize(plan: &WritePlan, tally: Tally) -> BatchResult {
    let mut per_field_update_counts = BTreeMap::new();
    for update in &plan.updates {
        for field in update.changes.keys() {
            *per_field_update_counts.entry(field.clone()).or_default() += 1;
        }
    }
    BatchResult {
        inserted: plan.inserts.len(),
        updated: plan.updates.len(),
        unchanged: tally.unchanged,
        skipped: tally.skipped_no_identifier + tally.skipped_duplicate,
        skipped_no_identifier: tally.skipped_no_identifier,
        skipped_duplicate: tally.skipped_duplicate,
        per_field_update_counts,
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub plan: WritePlan,
    pub tally: Tally,
    pub result: BatchResult,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    schema: TableSchema,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(schema: TableSchema, policy: ReconcilePolicy) -> Result<Self, ReconcileError> {
        schema.validate()?;
        Ok(Self { schema, policy })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    fn insert_row(&self, key: &str, record: &CanonicalRecord, stamp: RunStamp) -> InsertRow {
        let values = self
            .schema
            .content_fields
            .iter()
            .map(|f| (f.clone(), normalized(record.field(f)).map(ToString::to_string)))
            .collect();
        InsertRow {
            identifier: key.to_string(),
            values,
            inserted_at: stamp.at,
            updated_at: stamp.at,
        }
    }

    /// Build the insert and update batches for one run.
    pub fn plan(
        &self,
        records: &[CanonicalRecord],
        snapshot: &Snapshot,
        stamp: RunStamp,
    ) -> Result<Reconciliation, ReconcileError> {
        self.schema.check_records(records)?;
        let classes = classify(records, snapshot, self.policy.duplicates)?;

        let mut tally = Tally::default();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for (record, class) in records.iter().zip(classes) {
            match class {
                Classification::Skipped(SkipReason::NoIdentifier) => {
                    tally.skipped_no_identifier += 1;
                }
                Classification::Skipped(SkipReason::SupersededBy(_)) => {
                    tally.skipped_duplicate += 1;
                }
                Classification::New(key) => inserts.push(self.insert_row(key, record, stamp)),
                Classification::Existing(existing) => {
                    let delta = diff(
                        record,
                        existing,
                        &self.schema.content_fields,
                        self.policy.blanks,
                    );
                    if delta.is_noop() {
                        tally.unchanged += 1;
                    } else {
                        updates.push(UpdateInstruction {
                            storage_id: delta.storage_id,
                            identifier: delta.identifier,
                            changes: delta.changes,
                            updated_at: stamp.at,
                        });
                    }
                }
            }
        }

        let plan = WritePlan {
            stamp,
            inserts,
            updates,
        };
        let result = summarize(&plan, tally);
        Ok(Reconciliation {
            plan,
            tally,
            result,
        })
    }
}
