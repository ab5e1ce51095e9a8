// Postgres-backed upsert and provenance checks. Skipped unless
// BFI_TEST_DATABASE_URL points at a disposable database.

use bfi_core::{InspectionRecord, RawRecord, SyncCounts, SyncOutcome, SyncStatus};
use bfi_storage::{BatchError, InspectionStore, PgStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::Row;

async fn test_store() -> Option<PgStore> {
    let url = std::env::var("BFI_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url).await.expect("connect test database");
    store.ensure_schema().await.expect("schema");
    Some(store)
}

fn raw(business: &str, violation: &str) -> RawRecord {
    RawRecord::new()
        .with("businessname", business)
        .with("resultdttm", "2026-02-11 09:30:00")
        .with("violation", violation)
        .with("result", "HE_Fail")
        .with("address", "1 Test Way")
        .with("zip", "02118")
        .with("location", "(42.34, -71.07)")
}

async fn stamps(store: &PgStore, key: &str) -> (i64, DateTime<Utc>, DateTime<Utc>) {
    let row = sqlx::query(
        "SELECT COUNT(*) OVER () AS n, created_at, updated_at FROM inspections WHERE inspection_key = $1",
    )
    .bind(key)
    .fetch_one(store.pool())
    .await
    .expect("row exists");
    (
        row.try_get("n").unwrap(),
        row.try_get("created_at").unwrap(),
        row.try_get("updated_at").unwrap(),
    )
}

#[tokio::test]
async fn reupserting_the_same_record_updates_in_place() {
    let Some(store) = test_store().await else { return };
    let business = format!("Idempotent Diner {}", std::process::id());
    let record = InspectionRecord::from_raw(&raw(&business, "25"));

    assert!(store.upsert_one(&record).await.expect("first upsert"));
    let (count, created_first, updated_first) = stamps(&store, &record.inspection_key).await;

    assert!(!store.upsert_one(&record).await.expect("second upsert"));
    let (count_after, created_second, updated_second) = stamps(&store, &record.inspection_key).await;

    assert_eq!(count, 1);
    assert_eq!(count_after, 1);
    assert_eq!(created_first, created_second);
    assert!(updated_second > updated_first);
}

#[tokio::test]
async fn shared_key_collapses_to_the_latest_values() {
    let Some(store) = test_store().await else { return };
    let business = format!("Collapsing Cafe {}", std::process::id());
    let first = InspectionRecord::from_raw(&raw(&business, "9"));
    let second = InspectionRecord::from_raw(
        &raw(&business, "9")
            .with("result", "HE_Pass")
            .with("location", "nowhere"),
    );
    assert_eq!(first.inspection_key, second.inspection_key);

    store.upsert_one(&first).await.expect("first");
    store.upsert_one(&second).await.expect("second");

    let row = sqlx::query("SELECT result, latitude, longitude FROM inspections WHERE inspection_key = $1")
        .bind(&first.inspection_key)
        .fetch_one(store.pool())
        .await
        .expect("row");
    assert_eq!(row.try_get::<String, _>("result").unwrap(), "HE_Pass");
    assert_eq!(row.try_get::<Option<f64>, _>("latitude").unwrap(), None);
    assert_eq!(row.try_get::<Option<f64>, _>("longitude").unwrap(), None);
}

#[tokio::test]
async fn failed_row_does_not_poison_the_batch() {
    let Some(store) = test_store().await else { return };
    let business = format!("Batch Bistro {}", std::process::id());
    let good = InspectionRecord::from_raw(&raw(&business, "1"));
    let bad = InspectionRecord::from_raw(&raw(&business, "2").with("resultdttm", "not a date"));
    let also_good = InspectionRecord::from_raw(&raw(&business, "3"));

    let mut batch = store.begin_batch().await.expect("batch");
    assert!(batch.upsert(&good).await.expect("good row"));
    match batch.upsert(&bad).await {
        Err(BatchError::Record(err)) => assert_eq!(err.business, business),
        other => panic!("expected a record error, got {other:?}"),
    }
    assert!(batch.upsert(&also_good).await.expect("row after failure"));
    batch.commit().await.expect("commit");

    let row = sqlx::query("SELECT COUNT(*) AS n FROM inspections WHERE businessname = $1")
        .bind(&business)
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(row.try_get::<i64, _>("n").unwrap(), 2);
}

#[tokio::test]
async fn rolled_back_batch_leaves_no_rows() {
    let Some(store) = test_store().await else { return };
    let business = format!("Rollback Grill {}", std::process::id());
    let record = InspectionRecord::from_raw(&raw(&business, "4"));

    let mut batch = store.begin_batch().await.expect("batch");
    batch.upsert(&record).await.expect("upsert");
    batch.rollback().await.expect("rollback");

    let row = sqlx::query("SELECT COUNT(*) AS n FROM inspections WHERE inspection_key = $1")
        .bind(&record.inspection_key)
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(row.try_get::<i64, _>("n").unwrap(), 0);
}

#[tokio::test]
async fn sync_run_finalizes_exactly_once() {
    let Some(store) = test_store().await else { return };
    let source = format!("test-{}", std::process::id());

    let run_id = store.open_sync_run(&source).await.expect("open");
    let running = store.last_sync_run(&source).await.expect("read").expect("row");
    assert_eq!(running.id, run_id);
    assert_eq!(running.status, Some(SyncStatus::Running));
    assert!(running.completed_at.is_none());

    let counts = SyncCounts {
        fetched: 10,
        inserted: 4,
        updated: 5,
    };
    store
        .finish_sync_run(run_id, &SyncOutcome::success(counts))
        .await
        .expect("finish");

    let done = store.last_sync_run(&source).await.expect("read").expect("row");
    assert_eq!(done.status, Some(SyncStatus::Success));
    assert_eq!(done.records_fetched, Some(10));
    assert_eq!(done.records_inserted, Some(4));
    assert_eq!(done.records_updated, Some(5));
    assert!(done.completed_at.is_some());
    assert!(done.error_message.is_none());

    let again = store
        .finish_sync_run(run_id, &SyncOutcome::failed(counts, "late failure"))
        .await;
    assert!(matches!(again, Err(StoreError::RunNotRunning(id)) if id == run_id));
}
