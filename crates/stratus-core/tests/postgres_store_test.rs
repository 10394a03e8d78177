// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL operation store.

#[macro_use]
mod common;

use chrono::Utc;
use stratus_core::persistence::postgres;
use stratus_core::{
    IdempotencyKey, Operation, OperationStatus, OperationStore, PostgresOperationStore,
    StatusCode, StoreError,
};
use uuid::Uuid;

fn keyed_operation(owner: &str, token: &str) -> Operation {
    Operation::create(
        owner,
        "keyed operation",
        None,
        Some(IdempotencyKey {
            token: token.to_string(),
            request_hash: "hash".to_string(),
        }),
    )
}

#[tokio::test]
async fn test_create_get_complete() {
    skip_if_no_db!();
    let pool = common::get_test_pool().await.expect("test database");
    let store = PostgresOperationStore::new(pool);

    let op = Operation::create("pg-test", "complete me", None, None);
    store.create_operation(&op).await.unwrap();

    let loaded = store.get_operation(&op.id).await.unwrap().unwrap();
    assert_eq!(loaded.description, "complete me");
    assert!(!loaded.done);

    store.update_meta(&op.id, b"halfway").await.unwrap();
    store.complete_operation(&op.id, b"{\"ok\":true}").await.unwrap();

    let loaded = store.get_operation(&op.id).await.unwrap().unwrap();
    assert!(loaded.is_succeeded());
    assert_eq!(loaded.meta.as_deref(), Some(&b"halfway"[..]));

    let err = store
        .fail_operation(&op.id, &OperationStatus::internal("too late"))
        .await
        .unwrap_err();
    assert!(err.is_already_completed());
}

#[tokio::test]
async fn test_fail_and_missing_operation() {
    skip_if_no_db!();
    let pool = common::get_test_pool().await.expect("test database");
    let store = PostgresOperationStore::new(pool);

    let op = Operation::create("pg-test", "fail me", None, None);
    store.create_operation(&op).await.unwrap();
    store
        .fail_operation(&op.id, &OperationStatus::cancelled("session removed"))
        .await
        .unwrap();

    let loaded = store.get_operation(&op.id).await.unwrap().unwrap();
    let error = loaded.error.expect("error recorded");
    assert_eq!(error.code, StatusCode::Cancelled);
    assert_eq!(error.message, "session removed");

    let missing = Uuid::new_v4().to_string();
    assert!(store.update_progress(&missing).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_idempotency_conflict() {
    skip_if_no_db!();
    let pool = common::get_test_pool().await.expect("test database");
    let store = PostgresOperationStore::new(pool);

    let token = Uuid::new_v4().to_string();
    let first = keyed_operation("pg-owner", &token);
    store.create_operation(&first).await.unwrap();

    match store.create_operation(&keyed_operation("pg-owner", &token)).await {
        Err(StoreError::IdempotencyConflict { operation_id, .. }) => {
            assert_eq!(operation_id, first.id)
        }
        other => panic!("expected idempotency conflict, got {other:?}"),
    }

    let found = store
        .get_by_idempotency_key("pg-owner", &token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
}

#[tokio::test]
async fn test_transactional_rollback() {
    skip_if_no_db!();
    let pool = common::get_test_pool().await.expect("test database");

    let op = Operation::create("pg-test", "rolled back", None, None);
    let mut tx = pool.begin().await.unwrap();
    postgres::create_operation(&mut tx, &op).await.unwrap();
    tx.rollback().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    assert!(postgres::get_operation(&mut conn, &op.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_list_incomplete_older_than() {
    skip_if_no_db!();
    let pool = common::get_test_pool().await.expect("test database");
    let store = PostgresOperationStore::new(pool);

    let mut op = Operation::create("pg-test", "stale", None, None);
    op.modified_at = Utc::now() - chrono::Duration::hours(2);
    store.create_operation(&op).await.unwrap();

    let stale = store
        .list_incomplete_older_than(Utc::now() - chrono::Duration::hours(1), 1000)
        .await
        .unwrap();
    assert!(stale.iter().any(|o| o.id == op.id));
}
