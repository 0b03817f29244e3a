//! Tests for the SQLite-backed task store

use chrono::Duration;
use tempfile::TempDir;

use super::support::t0;
use crate::store::{NewTask, ReadFilter, TaskStore, TaskUpdate};
use crate::SqliteStore;

fn new_task(queue: &str, data: Option<&str>) -> NewTask {
    NewTask {
        queue: queue.to_string(),
        run_at: Some(t0()),
        initial_run_at: Some(t0()),
        expire_at: None,
        data: data.map(str::to_string),
    }
}

#[tokio::test]
async fn test_create_then_read_round_trips_the_record() {
    let store = SqliteStore::open_in_memory().unwrap();
    let expire_at = t0() + Duration::minutes(90);
    store
        .create(NewTask {
            queue: "greet".to_string(),
            run_at: Some(t0()),
            initial_run_at: Some(t0()),
            expire_at: Some(expire_at),
            data: Some("\"a@b.com\"".to_string()),
        })
        .await
        .unwrap();

    let records = store.read(&ReadFilter::by_id(1)).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.queue, "greet");
    assert_eq!(record.run_at, Some(t0()));
    assert_eq!(record.expire_at, Some(expire_at));
    assert_eq!(record.attempts, 0);
    assert_eq!(record.data.as_deref(), Some("\"a@b.com\""));
}

#[tokio::test]
async fn test_ids_are_allocated_above_the_highest_existing() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(new_task("a", None)).await.unwrap();
    store.create(new_task("a", None)).await.unwrap();
    store.delete(1).await.unwrap();
    store.create(new_task("a", None)).await.unwrap();

    let ids: Vec<i64> = store
        .read(&ReadFilter::all())
        .await
        .unwrap()
        .iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(ids, vec![2, 3]);
}

#[tokio::test]
async fn test_read_filters_by_queue_and_data() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(new_task("a", Some("1"))).await.unwrap();
    store.create(new_task("a", Some("2"))).await.unwrap();
    store.create(new_task("b", Some("1"))).await.unwrap();

    assert_eq!(store.read(&ReadFilter::by_queue("a")).await.unwrap().len(), 2);

    let filter = ReadFilter {
        queue: Some("b".to_string()),
        data: Some("1".to_string()),
        ..ReadFilter::default()
    };
    let matches = store.read(&filter).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, 3);
}

#[tokio::test]
async fn test_update_merges_changes_and_clears_nullable_columns() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(new_task("a", Some("1"))).await.unwrap();
    store
        .update(
            1,
            &TaskUpdate {
                attempts: Some(4),
                last_error: Some(Some("boom".to_string())),
                last_fail_at: Some(Some(t0())),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();
    store
        .update(
            1,
            &TaskUpdate {
                last_error: Some(None),
                last_fail_at: Some(None),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();

    let record = &store.read(&ReadFilter::by_id(1)).await.unwrap()[0];
    assert_eq!(record.attempts, 4);
    assert_eq!(record.last_error, None);
    assert_eq!(record.last_fail_at, None);
}

#[tokio::test]
async fn test_update_and_delete_of_absent_ids_are_no_ops() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .update(7, &TaskUpdate { attempts: Some(1), ..TaskUpdate::default() })
        .await
        .unwrap();
    store.delete(7).await.unwrap();
    assert!(store.read(&ReadFilter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_the_database_persists_across_opens() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tasks.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store.create(new_task("a", None)).await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let records = store.read(&ReadFilter::all()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].queue, "a");
}
