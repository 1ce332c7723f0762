use std::path::{Path, PathBuf};
use std::sync::Arc;

use recsync_core::RunStamp;
use recsync_storage::{MemoryGateway, PgGateway};
use recsync_sync::{JobConfig, SyncPipeline};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/students")
}

fn pipeline(gateway: &Arc<MemoryGateway>) -> SyncPipeline {
    let job = JobConfig::load(&fixtures().join("recsync.yaml")).unwrap();
    SyncPipeline::new(job, gateway.clone())
        .unwrap()
        .with_actor("system")
}

#[tokio::test]
async fn monthly_exports_reconcile_incrementally() {
    let gateway = Arc::new(MemoryGateway::new());
    let pipeline = pipeline(&gateway);
    assert_eq!(pipeline.schema().audit.inserted_at, "etl_insert_dttm");

    let march = pipeline.run_file(&fixtures().join("march.csv")).await.unwrap();
    assert_eq!(march.result.inserted, 2);
    assert_eq!(march.result.skipped_no_identifier, 1);

    let rows = gateway.rows().await;
    assert_eq!(rows[0].record.identifier.as_deref(), Some("9876543210"));
    assert_eq!(rows[0].record.field("student_name"), Some("Ann.Lee"));
    assert_eq!(rows[0].record.field("country"), Some("India"));
    assert_eq!(rows[1].record.field("country"), Some("Sri Lanka"));
    assert_eq!(rows[1].record.field("networker"), Some("Joy"));

    let again = pipeline.run_file(&fixtures().join("march.csv")).await.unwrap();
    assert_eq!(again.result.unchanged, 2);
    assert!(!again.result.wrote_anything());

    let april = pipeline.run_file(&fixtures().join("april.csv")).await.unwrap();
    assert_eq!(april.result.inserted, 1);
    assert_eq!(april.result.updated, 2);
    assert_eq!(april.result.per_field_update_counts.get("source_file"), Some(&2));
    assert_eq!(april.result.per_field_update_counts.get("staff"), Some(&1));
    assert_eq!(april.result.per_field_update_counts.get("networker"), None);

    let rows = gateway.rows().await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].record.field("staff"), Some("Kim"));
    assert_eq!(rows[1].record.field("networker"), Some("Joy"));
    assert_eq!(rows[2].record.identifier.as_deref(), Some("94712345678"));
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
    let gateway = Arc::new(MemoryGateway::new());
    let plan = pipeline(&gateway)
        .plan_file(&fixtures().join("april.csv"))
        .await
        .unwrap();
    assert!(plan.dry_run);
    assert_eq!(plan.result.inserted, 3);
    assert_eq!(gateway.row_writes().await, 0);
}

/// The table layout the roster exports were loaded into before recsync existed:
/// SERIAL ids, varchar columns and nullable TIMESTAMP audit columns.
/// Runs only when `RECSYNC_TEST_DATABASE_URL` is set.
#[tokio::test]
async fn legacy_students_table_when_configured() {
    let Ok(url) = std::env::var("RECSYNC_TEST_DATABASE_URL") else {
        return;
    };
    let gateway = PgGateway::connect(&url, 2).await.unwrap();
    let pool = gateway.pool().clone();
    let run_id = RunStamp::now().run_id.simple().to_string();
    let pg_schema = format!("legacy_{}", &run_id[..12]);

    for sql in [
        format!("CREATE SCHEMA {pg_schema}"),
        format!(
            "CREATE TABLE {pg_schema}.students (
                id SERIAL PRIMARY KEY,
                mobile_phone VARCHAR(20) UNIQUE,
                student_name VARCHAR(255),
                staff VARCHAR(255),
                networker VARCHAR(255),
                country VARCHAR(50),
                class VARCHAR(50),
                source_file VARCHAR(255),
                etl_user_id VARCHAR(50),
                etl_insert_dttm TIMESTAMP,
                etl_update_dttm TIMESTAMP
            )"
        ),
        format!(
            "INSERT INTO {pg_schema}.students (mobile_phone, student_name) VALUES (' 712345678 ', 'Ben')"
        ),
    ] {
        sqlx::query(&sql).execute(&pool).await.unwrap();
    }

    let text = std::fs::read_to_string(fixtures().join("recsync.yaml"))
        .unwrap()
        .replace("schema: iba", &format!("schema: {pg_schema}"));
    let job = JobConfig::from_yaml(&text).unwrap();
    let pipeline = SyncPipeline::new(job, Arc::new(gateway)).unwrap();

    pipeline.migrate().await.unwrap();
    let march = pipeline.run_file(&fixtures().join("march.csv")).await.unwrap();
    assert_eq!(march.result.inserted, 1);
    assert_eq!(march.result.updated, 1);

    let again = pipeline.run_file(&fixtures().join("march.csv")).await.unwrap();
    assert_eq!(again.result.unchanged, 2);

    let ben: (String, Option<String>, bool) = sqlx::query_as(&format!(
        "SELECT mobile_phone::text, staff::text, etl_insert_dttm IS NULL
           FROM {pg_schema}.students WHERE student_name = 'Ben'"
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(ben, (" 712345678 ".to_string(), Some("Lee".to_string()), true));

    sqlx::query(&format!("DROP SCHEMA {pg_schema} CASCADE"))
        .execute(&pool)
        .await
        .unwrap();
}
