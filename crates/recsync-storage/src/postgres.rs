use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recsync_core::{
    normalized, CanonicalRecord, ExistingRecord, SchemaError, Snapshot, StorageId, TableSchema,
    WritePlan,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{ApplyReport, PersistenceGateway, StorageError};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const MAX_ROWS_PER_INSERT: usize = 1_000;

/// Double-quote a column/table name. Names are validated by `TableSchema::validate`
/// before they reach SQL, so this only guards against embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(schema: &TableSchema) -> String {
    format!("{}.{}", quote_ident(&schema.schema), quote_ident(&schema.table))
}

const ID_TYPES: &[&str] = &["smallint", "integer", "bigint"];
const TEXT_TYPES: &[&str] = &["text", "character varying", "character"];
const TIMESTAMP_TYPES: &[&str] = &["timestamp with time zone", "timestamp without time zone"];

/// Every column the gateway reads or writes, with the `information_schema` types it accepts.
fn expected_columns(schema: &TableSchema) -> Vec<(&str, &'static [&'static str])> {
    let mut out = vec![
        ("id", ID_TYPES),
        (schema.identifier_field.as_str(), TEXT_TYPES),
    ];
    out.extend(schema.content_fields.iter().map(|f| (f.as_str(), TEXT_TYPES)));
    out.push((schema.audit.inserted_at.as_str(), TIMESTAMP_TYPES));
    out.push((schema.audit.updated_at.as_str(), TIMESTAMP_TYPES));
    out
}

/// Compare the declared layout against `(column_name, data_type)` pairs from the catalog.
fn check_columns(schema: &TableSchema, present: &[(String, String)]) -> Result<(), SchemaError> {
    for (column, accepted) in expected_columns(schema) {
        let Some((_, found)) = present.iter().find(|(name, _)| name == column) else {
            return Err(SchemaError::MissingColumn {
                table: schema.qualified_name(),
                column: column.to_string(),
            });
        };
        if !accepted.contains(&found.as_str()) {
            return Err(SchemaError::ColumnType {
                table: schema.qualified_name(),
                column: column.to_string(),
                found: found.clone(),
                expected: accepted.join(" or "),
            });
        }
    }
    Ok(())
}

fn rows_per_insert(schema: &TableSchema) -> usize {
    let params_per_row = schema.content_fields.len() + 3;
    (MAX_BIND_PARAMS / params_per_row).clamp(1, MAX_ROWS_PER_INSERT)
}

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_in_tx(
        &self,
        schema: &TableSchema,
        plan: &WritePlan,
    ) -> Result<ApplyReport, StorageError> {
        let mut tx = self.pool.begin().await?;
        match Self::write_plan(&mut tx, schema, plan).await {
            Ok(report) => {
                tx.commit().await.map_err(|err| StorageError::RolledBack {
                    inserts: plan.inserts.len(),
                    updates: plan.updates.len(),
                    reason: format!("commit failed: {err}"),
                })?;
                info!(
                    inserted = report.inserted,
                    updated = report.updated,
                    "transaction committed"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "explicit rollback failed; dropping the connection discards the transaction");
                }
                Err(StorageError::RolledBack {
                    inserts: plan.inserts.len(),
                    updates: plan.updates.len(),
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn write_plan(
        tx: &mut Transaction<'_, Postgres>,
        schema: &TableSchema,
        plan: &WritePlan,
    ) -> Result<ApplyReport, sqlx::Error> {
        let table = qualified(schema);
        let columns = schema
            .columns()
            .into_iter()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");

        let mut report = ApplyReport::default();
        for chunk in plan.inserts.chunks(rows_per_insert(schema)) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({columns}) "));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.identifier.clone());
                for field in &schema.content_fields {
                    b.push_bind(row.values.get(field).cloned().flatten());
                }
                b.push_bind(row.inserted_at);
                b.push_bind(row.updated_at);
            });
            let done = qb.build().execute(&mut **tx).await?;
            report.inserted += done.rows_affected() as usize;
        }

        let ident_col = quote_ident(&schema.identifier_field);
        for update in &plan.updates {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("UPDATE {table} SET "));
            {
                let mut set = qb.separated(", ");
                for (field, value) in &update.changes {
                    set.push(format!("{} = ", quote_ident(field)));
                    set.push_bind_unseparated(value.clone());
                }
                set.push(format!("{} = ", quote_ident(&schema.audit.updated_at)));
                set.push_bind_unseparated(update.updated_at);
            }
            qb.push(" WHERE id = ");
            qb.push_bind(update.storage_id.0);
            qb.push(format!(" AND {ident_col} = "));
            qb.push_bind(update.identifier.clone());

            let done = qb.build().execute(&mut **tx).await?;
            if done.rows_affected() != 1 {
                return Err(sqlx::Error::Protocol(format!(
                    "row {} for identifier {} changed underneath the run",
                    update.storage_id, update.identifier
                )));
            }
            report.updated += 1;
        }
        Ok(report)
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    fn describe(&self) -> String {
        "postgres".to_string()
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StorageError> {
        schema.validate()?;
        let table = qualified(schema);

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&schema.schema)
        ))
        .execute(&self.pool)
        .await?;

        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    id BIGSERIAL PRIMARY KEY,\n    {} TEXT UNIQUE",
            quote_ident(&schema.identifier_field)
        );
        for field in &schema.content_fields {
            ddl.push_str(&format!(",\n    {} TEXT", quote_ident(field)));
        }
        ddl.push_str(&format!(
            ",\n    {} TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    {} TIMESTAMPTZ\n)",
            quote_ident(&schema.audit.inserted_at),
            quote_ident(&schema.audit.updated_at)
        ));
        sqlx::query(&ddl).execute(&self.pool).await?;

        let present: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
              FROM information_schema.columns
             WHERE table_schema = $1
               AND table_name = $2
            "#,
        )
        .bind(&schema.schema)
        .bind(&schema.table)
        .fetch_all(&self.pool)
        .await?;
        check_columns(schema, &present)?;

        let unique_indexes: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM pg_index i
              JOIN pg_class c
                ON c.oid = i.indrelid
              JOIN pg_namespace n
                ON n.oid = c.relnamespace
              JOIN pg_attribute a
                ON a.attrelid = i.indrelid
               AND a.attnum = i.indkey[0]
             WHERE n.nspname::text = $1
               AND c.relname::text = $2
               AND i.indisunique
               AND i.indnatts = 1
               AND a.attname::text = $3
            "#,
        )
        .bind(&schema.schema)
        .bind(&schema.table)
        .bind(&schema.identifier_field)
        .fetch_one(&self.pool)
        .await?;

        if unique_indexes == 0 {
            return Err(SchemaError::MissingUniqueKey {
                table: schema.qualified_name(),
                column: schema.identifier_field.clone(),
            }
            .into());
        }

        info!(table = %schema.qualified_name(), "target table ready");
        Ok(())
    }

    async fn load_existing(&self, schema: &TableSchema) -> Result<Snapshot, StorageError> {
        // Casts let tables created elsewhere (SERIAL ids, varchar, TIMESTAMP) decode the same way.
        let cast = |column: &str, ty: &str| format!("{0}::{ty} AS {0}", quote_ident(column));
        let mut select = vec![
            cast("id", "bigint"),
            cast(&schema.identifier_field, "text"),
        ];
        select.extend(schema.content_fields.iter().map(|f| cast(f, "text")));
        select.push(cast(&schema.audit.inserted_at, "timestamptz"));
        select.push(cast(&schema.audit.updated_at, "timestamptz"));

        let sql = format!(
            "SELECT {} FROM {} WHERE {} IS NOT NULL ORDER BY id",
            select.join(", "),
            qualified(schema),
            quote_ident(&schema.identifier_field)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut snapshot = Snapshot::new();
        for row in rows {
            let storage_id = StorageId(row.try_get::<i64, _>("id")?);
            let identifier: Option<String> = row.try_get(schema.identifier_field.as_str())?;
            let Some(key) = normalized(identifier.as_deref()).map(ToString::to_string) else {
                continue;
            };

            let mut fields = BTreeMap::new();
            for field in &schema.content_fields {
                let value: Option<String> = row.try_get(field.as_str())?;
                fields.insert(field.clone(), value);
            }
            let inserted_at: Option<DateTime<Utc>> =
                row.try_get(schema.audit.inserted_at.as_str())?;
            let updated_at: Option<DateTime<Utc>> =
                row.try_get(schema.audit.updated_at.as_str())?;

            let existing = ExistingRecord {
                storage_id,
                record: CanonicalRecord { identifier, fields },
                inserted_at,
                updated_at,
            };
            if snapshot.insert(key.clone(), existing).is_some() {
                warn!(identifier = %key, "identifier differs only by whitespace across rows; keeping the latest");
            }
        }

        debug!(table = %schema.qualified_name(), rows = snapshot.len(), "snapshot loaded");
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

        let span = info_span!(
            "pg_apply",
            run_id = %plan.stamp.run_id,
            table = %schema.qualified_name(),
            inserts = plan.inserts.len(),
            updates = plan.updates.len()
        );

        self.apply_in_tx(schema, plan).instrument(span).await
    }
}
