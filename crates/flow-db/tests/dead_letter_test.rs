//! Integration tests for dead-letter capture and reprocessing.

use serde_json::json;

use flow_db::queries::{dead_letters, executions, tasks};
use flow_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn dead_letter_insert_and_reprocess_is_idempotent() {
    let (pool, db_name) = create_test_db().await;

    let execution = executions::insert_execution(
        &pool,
        executions::NewExecution {
            workflow_name: "wf",
            workflow_version: 1,
            input: json!({}),
            idempotency_key: None,
            timeout_at: None,
        },
    )
    .await
    .unwrap();

    let task = tasks::insert_task(
        &pool,
        tasks::NewTask {
            execution_id: execution.id,
            step_name: "flaky",
            step_type: flow_db::models::StepType::Sequential,
            step_order: 0,
            input: json!({"n": 1}),
            max_attempts: 1,
            backoff_strategy: flow_db::models::BackoffStrategy::Fixed,
            backoff_base_ms: 1000,
            priority: 0,
            parallel_group: None,
            branch_key: None,
            parent_task_id: None,
        },
    )
    .await
    .unwrap();

    let dl = dead_letters::insert_dead_letter(
        &pool,
        task.id,
        execution.id,
        "wf",
        "flaky",
        task.input.clone(),
        json!([{"attempt": 1, "error": "boom", "timestamp": "2024-01-01T00:00:00Z"}]),
        Some("boom"),
    )
    .await
    .expect("insert_dead_letter should succeed");

    assert!(!dl.reprocessed);

    let rows = dead_letters::mark_reprocessed(&pool, dl.id).await.unwrap();
    assert_eq!(rows, 1);

    // Second reprocess attempt is a no-op: zero rows, not an error.
    let rows_again = dead_letters::mark_reprocessed(&pool, dl.id).await.unwrap();
    assert_eq!(rows_again, 0);

    let fetched = dead_letters::get_dead_letter(&pool, dl.id)
        .await
        .unwrap()
        .unwrap();
    assert!(fetched.reprocessed);
    assert!(fetched.reprocessed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_dead_letters_filters_by_workflow_name() {
    let (pool, db_name) = create_test_db().await;

    let execution = executions::insert_execution(
        &pool,
        executions::NewExecution {
            workflow_name: "wf-a",
            workflow_version: 1,
            input: json!({}),
            idempotency_key: None,
            timeout_at: None,
        },
    )
    .await
    .unwrap();
    let task = tasks::insert_task(
        &pool,
        tasks::NewTask {
            execution_id: execution.id,
            step_name: "s",
            step_type: flow_db::models::StepType::Sequential,
            step_order: 0,
            input: json!({}),
            max_attempts: 1,
            backoff_strategy: flow_db::models::BackoffStrategy::Fixed,
            backoff_base_ms: 1000,
            priority: 0,
            parallel_group: None,
            branch_key: None,
            parent_task_id: None,
        },
    )
    .await
    .unwrap();
    dead_letters::insert_dead_letter(&pool, task.id, execution.id, "wf-a", "s", json!({}), json!([]), None)
        .await
        .unwrap();

    let filter = dead_letters::DeadLetterFilter {
        workflow_name: Some("wf-a"),
        ..Default::default()
    };
    let results = dead_letters::list_dead_letters(&pool, &filter).await.unwrap();
    assert_eq!(results.len(), 1);

    let filter_miss = dead_letters::DeadLetterFilter {
        workflow_name: Some("wf-b"),
        ..Default::default()
    };
    let results_miss = dead_letters::list_dead_letters(&pool, &filter_miss).await.unwrap();
    assert!(results_miss.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}
