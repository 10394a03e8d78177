// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocate VM and Delete VM sagas against the in-memory store and mock cluster.

mod common;

use std::time::Duration;

use common::{Harness, fast_config};
use stratus_allocator::Error;
use stratus_allocator::cluster::{ClusterResult, FailureKind};
use stratus_allocator::model::{AllocateResponse, VmStatus};
use stratus_allocator::store::AllocatorStore;
use stratus_core::{OperationStatus, OperationStore, RunnerState, StatusCode};

#[tokio::test]
async fn test_allocate_completes_on_registration() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;

    let (op, vm_id) = h.allocate(&session).await;
    assert!(!op.done);
    assert!(op.deadline.is_some());

    h.wait_allocated(&vm_id).await;
    h.service.register_vm(&vm_id).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    let op = h.operation(&op.id).await;
    assert!(op.is_succeeded());
    let response: AllocateResponse = serde_json::from_slice(op.response.as_deref().unwrap()).unwrap();
    assert_eq!(response.vm_id, vm_id);
    assert!(!response.from_cache);

    let vm = h.service.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(vm.instance_properties.vm_subject_id.is_some());
    assert!(vm.run_state.activity_deadline.is_some());
    assert_eq!(h.identity.subject_count(), 1);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.allocations, 1);
    assert_eq!(metrics.running_vms, 1);

    // Registering again is a no-op.
    h.service.register_vm(&vm_id).await.unwrap();
}

#[tokio::test]
async fn test_tunnel_is_allocated_when_requested() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let mut request = h.allocate_request(&session);
    request.tunnel = Some(stratus_allocator::model::TunnelSettings {
        proxy_v6_address: "fd00::1".to_string(),
        tunnel_index: 3,
    });

    let op = h.service.allocate(request).await.unwrap();
    let vm_id = h.wait_for_vm_of(&session.id, &op.id).await;
    h.wait_allocated(&vm_id).await;

    let vm = h.service.get_vm(&vm_id).await.unwrap();
    let pod = vm.instance_properties.tunnel_pod_name.expect("tunnel pod");
    assert!(h.cluster.has_tunnel(&pod));

    h.service.register_vm(&vm_id).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
}

#[tokio::test]
async fn test_allocation_failure_deletes_vm() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    h.cluster.push_allocate_result(ClusterResult::Failed {
        reason: "no such pool".to_string(),
        kind: FailureKind::InvalidConfiguration,
    });

    let op = h.service.allocate(h.allocate_request(&session)).await.unwrap();
    let vm_id = h.wait_for_vm_of(&session.id, &op.id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Failed);

    let op = h.operation(&op.id).await;
    assert_eq!(op.error.as_ref().map(|e| e.code), Some(StatusCode::InvalidArgument));

    h.wait_vm_removed(&vm_id).await;
    assert_eq!(h.identity.subject_count(), 0);
    assert!(!h.cluster.is_allocated(&vm_id));

    // One allocate operation and exactly one delete operation.
    assert_eq!(h.store.operation_count().await, 2);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.allocation_errors, 1);
    assert_eq!(metrics.deleted_vms, 1);
}

#[tokio::test]
async fn test_vm_start_failure_deletes_vm() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    h.cluster.set_default_status(ClusterResult::Failed {
        reason: "kernel panic".to_string(),
        kind: FailureKind::Internal,
    });

    let op = h.service.allocate(h.allocate_request(&session)).await.unwrap();
    let vm_id = h.wait_for_vm_of(&session.id, &op.id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Failed);
    assert_eq!(
        h.operation(&op.id).await.error.map(|e| e.code),
        Some(StatusCode::Internal)
    );

    h.wait_vm_removed(&vm_id).await;
    assert_eq!(h.cluster.calls().deallocate, 1);
}

#[tokio::test]
async fn test_allocation_deadline_deletes_vm() {
    let mut config = fast_config();
    config.allocation_timeout = Duration::from_millis(200);
    let h = Harness::with_config(config);
    let session = h.session(Duration::ZERO).await;

    let (op, vm_id) = h.allocate(&session).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Expired);

    let op = h.operation(&op.id).await;
    assert_eq!(
        op.error.as_ref().map(|e| e.code),
        Some(StatusCode::DeadlineExceeded)
    );

    h.wait_vm_removed(&vm_id).await;
    assert!(!h.cluster.is_allocated(&vm_id));
    assert_eq!(h.metrics.snapshot().allocation_timeouts, 1);

    // The expired allocation can no longer be registered.
    assert!(matches!(
        h.service.register_vm(&vm_id).await,
        Err(Error::VmNotFound(_))
    ));
}

#[tokio::test]
async fn test_outside_cancellation_starts_one_deletion() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let (op, vm_id) = h.allocate(&session).await;
    h.wait_allocated(&vm_id).await;

    h.store
        .fail_operation(&op.id, &OperationStatus::cancelled("cancelled by user"))
        .await
        .unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Failed);

    let delete_op_id = h
        .store
        .get_vm(&vm_id)
        .await
        .unwrap()
        .and_then(|vm| vm.delete_operation_id().map(str::to_string));
    if let Some(delete_op_id) = delete_op_id {
        assert_eq!(h.wait(&delete_op_id).await, RunnerState::Done);
    }
    h.wait_vm_removed(&vm_id).await;

    assert_eq!(h.store.operation_count().await, 2);
    assert_eq!(h.cluster.calls().deallocate, 1);
}

#[tokio::test]
async fn test_idempotent_allocate_replays_operation() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;

    let mut request = h.allocate_request(&session);
    request.idempotency_key = Some("alloc-1".to_string());
    let first = h.service.allocate(request.clone()).await.unwrap();

    let mut replay = request.clone();
    replay.request_id = "another-request".to_string();
    let second = h.service.allocate(replay).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.store.get_session_vms(&session.id).await.unwrap().len(), 1);

    let mut different = request;
    different.zone = "zone-b".to_string();
    assert!(matches!(
        h.service.allocate(different).await,
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_allocate_validates_request() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;

    let mut request = h.allocate_request(&session);
    request.cluster_id = String::new();
    assert!(matches!(
        h.service.allocate(request).await,
        Err(Error::InvalidRequest(_))
    ));

    let mut request = h.allocate_request(&session);
    request.session_id = "missing".to_string();
    assert!(matches!(
        h.service.allocate(request).await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_identity_outage_is_retried() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    h.identity.inject_unavailable(1);

    let (op, vm_id) = h.allocate(&session).await;
    h.wait_allocated(&vm_id).await;
    h.service.register_vm(&vm_id).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    let (creates, _) = h.identity.call_counts();
    assert_eq!(creates, 2);
    assert_eq!(h.identity.subject_count(), 1);
}
