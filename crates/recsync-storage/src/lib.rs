//! Persistence gateway contract plus Postgres, in-memory and export-archive backends.

use async_trait::async_trait;
use recsync_core::{SchemaError, Snapshot, TableSchema, WritePlan};
use serde::Serialize;
use thiserror::Error;

mod archive;
mod memory;
mod postgres;

pub use archive::{ArchivedExport, ExportArchive};
pub use memory::MemoryGateway;
pub use postgres::{quote_ident, PgGateway};

pub const CRATE_NAME: &str = "recsync-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Nothing from the plan is visible; the whole run can be retried as-is.
    #[error("transaction rolled back, no rows were written ({inserts} inserts, {updates} updates discarded): {reason}")]
    RolledBack {
        inserts: usize,
        updates: usize,
        reason: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
}

/// The only place the reconciler touches storage: one read before, one atomic write after.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    fn describe(&self) -> String;

    /// Create the target table when absent, then verify it carries every declared column
    /// and a unique constraint on the identifier.
    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StorageError>;

    async fn load_existing(&self, schema: &TableSchema) -> Result<Snapshot, StorageError>;

    /// Apply every insert and update in one transaction, or none of them.
    async fn apply(&self, schema: &TableSchema, plan: &WritePlan)
        -> Result<ApplyReport, StorageError>;
}
