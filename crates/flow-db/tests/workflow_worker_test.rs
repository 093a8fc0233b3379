//! Integration tests for the workflow audit table and worker registry.

use serde_json::json;

use flow_db::models::WorkerStatus;
use flow_db::queries::{workers, workflows};
use flow_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn upsert_workflow_is_idempotent_per_version() {
    let (pool, db_name) = create_test_db().await;

    let first = workflows::upsert_workflow(&pool, "sequential", 1, Some("v1"), json!({"steps": []}))
        .await
        .unwrap();
    let second =
        workflows::upsert_workflow(&pool, "sequential", 1, Some("v1-updated"), json!({"steps": ["a"]}))
            .await
            .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.description.as_deref(), Some("v1-updated"));

    let all = workflows::list_workflows(&pool).await.unwrap();
    assert_eq!(all.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_latest_version_picks_highest() {
    let (pool, db_name) = create_test_db().await;

    workflows::upsert_workflow(&pool, "wf", 1, None, json!({})).await.unwrap();
    workflows::upsert_workflow(&pool, "wf", 3, None, json!({})).await.unwrap();
    workflows::upsert_workflow(&pool, "wf", 2, None, json!({})).await.unwrap();

    let latest = workflows::get_latest_version(&pool, "wf").await.unwrap();
    assert_eq!(latest, Some(3));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_register_heartbeat_and_stale_sweep() {
    let (pool, db_name) = create_test_db().await;

    let worker = workers::register_worker(&pool, "host-abc123", "host", 5)
        .await
        .expect("register_worker should succeed");
    assert_eq!(worker.status, WorkerStatus::Active);
    assert_eq!(worker.active_tasks, 0);

    let rows = workers::heartbeat(&pool, "host-abc123", 3).await.unwrap();
    assert_eq!(rows, 1);

    let fetched = workers::get_worker(&pool, "host-abc123").await.unwrap().unwrap();
    assert_eq!(fetched.active_tasks, 3);

    // With a threshold of zero seconds every active worker counts as stale.
    let stale = workers::find_stale_workers(&pool, 0).await.unwrap();
    assert_eq!(stale.len(), 1);

    let rows = workers::mark_stale_stopped(&pool, "host-abc123").await.unwrap();
    assert_eq!(rows, 1);

    let fetched = workers::get_worker(&pool, "host-abc123").await.unwrap().unwrap();
    assert_eq!(fetched.status, WorkerStatus::Stopped);
    assert!(fetched.stopped_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_graceful_shutdown_path() {
    let (pool, db_name) = create_test_db().await;

    workers::register_worker(&pool, "worker-z", "host", 5).await.unwrap();

    let rows = workers::mark_draining(&pool, "worker-z").await.unwrap();
    assert_eq!(rows, 1);

    let rows = workers::mark_stopped(&pool, "worker-z").await.unwrap();
    assert_eq!(rows, 1);

    let fetched = workers::get_worker(&pool, "worker-z").await.unwrap().unwrap();
    assert_eq!(fetched.status, WorkerStatus::Stopped);
    assert_eq!(fetched.active_tasks, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
