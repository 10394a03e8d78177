// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session caching, VM reuse and the Delete Session saga.

mod common;

use std::time::Duration;

use common::Harness;
use stratus_allocator::Error;
use stratus_allocator::model::{AllocateResponse, VmStatus};
use stratus_allocator::store::AllocatorStore;
use stratus_core::{RunnerState, StatusCode};

#[tokio::test]
async fn test_free_caches_and_reuses_vm() {
    let h = Harness::new();
    let session = h.session(Duration::from_secs(60)).await;
    let vm_id = h.running_vm(&session).await;

    h.service.free(&vm_id).await.unwrap();
    let vm = h.service.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Idle);
    assert!(vm.idle_state.idle_deadline.is_some());
    assert_eq!(h.metrics.snapshot().cached_vms, 1);

    let op = h.service.allocate(h.allocate_request(&session)).await.unwrap();
    assert!(op.is_succeeded());
    let response: AllocateResponse = serde_json::from_slice(op.response.as_deref().unwrap()).unwrap();
    assert_eq!(response.vm_id, vm_id);
    assert!(response.from_cache);

    let vm = h.service.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(vm.run_state.activity_deadline.is_some());
    assert_eq!(h.cluster.calls().allocate, 1);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.running_vms, 1);
    assert_eq!(metrics.cached_vms, 0);
}

#[tokio::test]
async fn test_idle_vm_of_other_pool_is_not_reused() {
    let h = Harness::new();
    let session = h.session(Duration::from_secs(60)).await;
    let vm_id = h.running_vm(&session).await;
    h.service.free(&vm_id).await.unwrap();

    let mut request = h.allocate_request(&session);
    request.pool_label = "large".to_string();
    let op = h.service.allocate(request).await.unwrap();
    assert!(!op.done);
    assert_eq!(
        h.service.get_vm(&vm_id).await.unwrap().status,
        VmStatus::Idle
    );
}

#[tokio::test]
async fn test_free_without_cache_deletes_vm() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    h.service.free(&vm_id).await.unwrap();
    h.wait_vm_removed(&vm_id).await;

    assert!(!h.cluster.is_allocated(&vm_id));
    assert_eq!(h.identity.subject_count(), 0);
    assert_eq!(h.metrics.snapshot().running_vms, 0);

    assert!(matches!(
        h.service.free(&vm_id).await,
        Err(Error::VmNotFound(_))
    ));
}

#[tokio::test]
async fn test_free_requires_running_vm() {
    let h = Harness::new();
    let session = h.session(Duration::from_secs(60)).await;
    let (_, vm_id) = h.allocate(&session).await;

    assert!(matches!(
        h.service.free(&vm_id).await,
        Err(Error::FailedPrecondition(_))
    ));
}

#[tokio::test]
async fn test_delete_session_removes_every_vm() {
    let h = Harness::new();
    let session = h.session(Duration::from_secs(60)).await;

    let running = h.running_vm(&session).await;
    let idle = h.running_vm(&session).await;
    h.service.free(&idle).await.unwrap();
    let (allocate_op, allocating) = h.allocate(&session).await;

    let op = h.service.delete_session(&session.id, "req-delete").await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    assert!(h.operation(&op.id).await.is_succeeded());

    for vm_id in [&running, &idle, &allocating] {
        assert!(h.store.get_vm(vm_id).await.unwrap().is_none());
        assert!(!h.cluster.is_allocated(vm_id));
    }
    assert_eq!(
        h.operation(&allocate_op.id).await.error.map(|e| e.code),
        Some(StatusCode::Cancelled)
    );
    assert_eq!(h.identity.subject_count(), 0);

    assert!(matches!(
        h.service.get_session(&session.id).await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        h.service.allocate(h.allocate_request(&session)).await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_empty_session() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;

    let op = h.service.delete_session(&session.id, "req-1").await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    assert!(h.store.get_session(&session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_session_requires_owner() {
    let h = Harness::new();
    assert!(matches!(
        h.service
            .create_session(" ", "no owner", Default::default())
            .await,
        Err(Error::InvalidRequest(_))
    ));
}
