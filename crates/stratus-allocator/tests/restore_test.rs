// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery: injected failures followed by Restore-On-Startup.

mod common;

use std::time::Duration;

use common::Harness;
use stratus_allocator::cluster::ClusterResult;
use stratus_allocator::model::{MountState, VmStatus};
use stratus_allocator::store::AllocatorStore;
use stratus_core::{Operation, RunnerState};

#[tokio::test]
async fn test_allocation_resumes_after_crash_in_step() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    h.fail_points.arm("allocate-vm/subject-created");

    let op = h.service.allocate(h.allocate_request(&session)).await.unwrap();
    let vm_id = h.wait_for_vm_of(&session.id, &op.id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Crashed);

    // The subject exists but was never recorded on the VM.
    assert_eq!(h.identity.subject_count(), 1);
    let vm = h.store.get_vm(&vm_id).await.unwrap().unwrap();
    assert!(vm.instance_properties.vm_subject_id.is_none());

    let report = h.restart().await;
    assert_eq!(report.allocations, 1);

    h.wait_allocated(&vm_id).await;
    h.service.register_vm(&vm_id).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    // The retried step got the same subject back.
    assert_eq!(h.identity.subject_count(), 1);
    let vm = h.service.get_vm(&vm_id).await.unwrap();
    assert!(vm.instance_properties.vm_subject_id.is_some());
}

#[tokio::test]
async fn test_allocation_resumes_after_crash_at_step_boundary() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    h.fail_points.arm("allocate-vm/AllocateVm");

    let op = h.service.allocate(h.allocate_request(&session)).await.unwrap();
    let vm_id = h.wait_for_vm_of(&session.id, &op.id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Crashed);
    assert!(h.cluster.is_allocated(&vm_id));

    h.restart().await;
    h.service.register_vm(&vm_id).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    // AllocateVm was recorded before the crash and is not repeated.
    assert_eq!(h.cluster.calls().allocate, 1);
}

#[tokio::test]
async fn test_vm_deletion_resumes_after_crash() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.fail_points.arm("delete-vm/Deallocate");

    h.service.free(&vm_id).await.unwrap();
    let vm = h.store.get_vm(&vm_id).await.unwrap().unwrap();
    assert_eq!(vm.status, VmStatus::Deleting);
    let delete_op = vm.delete_operation_id().unwrap().to_string();
    assert_eq!(h.wait(&delete_op).await, RunnerState::Crashed);
    assert!(h.store.get_vm(&vm_id).await.unwrap().is_some());

    let report = h.restart().await;
    assert_eq!(report.vm_deletions, 1);
    assert_eq!(h.wait(&delete_op).await, RunnerState::Done);

    assert!(h.store.get_vm(&vm_id).await.unwrap().is_none());
    assert!(!h.cluster.is_allocated(&vm_id));
    assert_eq!(h.identity.subject_count(), 0);
}

#[tokio::test]
async fn test_failed_allocation_compensation_survives_crash() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    h.cluster.set_default_status(ClusterResult::Failed {
        reason: "boot failure".to_string(),
        kind: stratus_allocator::cluster::FailureKind::Internal,
    });
    h.fail_points.arm("delete-vm/Start");

    let op = h.service.allocate(h.allocate_request(&session)).await.unwrap();
    let vm_id = h.wait_for_vm_of(&session.id, &op.id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Failed);

    let delete_op = h
        .store
        .get_vm(&vm_id)
        .await
        .unwrap()
        .and_then(|vm| vm.delete_operation_id().map(str::to_string))
        .expect("deletion started");
    assert_eq!(h.wait(&delete_op).await, RunnerState::Crashed);

    let report = h.restart().await;
    assert_eq!(report.allocations, 0);
    assert_eq!(report.vm_deletions, 1);
    assert_eq!(h.wait(&delete_op).await, RunnerState::Done);
    assert!(h.store.get_vm(&vm_id).await.unwrap().is_none());

    // One allocate and one delete operation, nothing compensated twice.
    assert_eq!(h.store.operation_count().await, 2);
}

#[tokio::test]
async fn test_pending_mount_resumes_after_crash() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.fail_points.arm("mount/PersistVolume");

    let op = h
        .service
        .mount(h.mount_request(&vm_id, "/mnt/data", "disk-r"))
        .await
        .unwrap();
    let mount_id = h.only_mount_of(&vm_id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Crashed);

    let report = h.restart().await;
    assert_eq!(report.mounts, 1);
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    let mount = h.service.get_mount(&mount_id).await.unwrap();
    assert_eq!(mount.state, MountState::Ready);
    assert_eq!(mount.volume_name.as_deref(), Some("volume-disk-r"));
}

#[tokio::test]
async fn test_pending_mount_of_deleted_vm_is_unmounted() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.fail_points.arm("mount/PersistVolume");

    let op = h
        .service
        .mount(h.mount_request(&vm_id, "/mnt/data", "disk-g"))
        .await
        .unwrap();
    let mount_id = h.only_mount_of(&vm_id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Crashed);

    // The VM goes away while the allocator is down.
    let delete_op = Operation::create("test", "delete elsewhere", None, None);
    let delete_state = h
        .store
        .begin_vm_deletion(&vm_id, &delete_op, "req-1", "worker-2")
        .await
        .unwrap();
    h.store
        .cleanup_vm(&vm_id, &delete_state.operation_id, b"")
        .await
        .unwrap();
    assert!(h.store.get_vm(&vm_id).await.unwrap().is_none());

    let report = h.restart().await;
    assert_eq!(report.mounts, 0);
    assert_eq!(report.unmounts, 1);

    h.wait_mount_removed(&mount_id).await;
    assert!(h.operation(&op.id).await.is_failed());
    assert!(!h.cluster.has_volume("volume-disk-g"));
}

#[tokio::test]
async fn test_session_deletion_resumes_after_restart() {
    let mut h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.cluster
        .push_deallocate_result(ClusterResult::RetryLater("node busy".to_string()));

    let op = h.service.delete_session(&session.id, "req-1").await.unwrap();
    let report = h.restart().await;
    assert_eq!(report.session_deletions, 1);

    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    assert!(h.store.get_vm(&vm_id).await.unwrap().is_none());
    assert!(h.store.get_session(&session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_restore_recomputes_gauges() {
    let mut h = Harness::new();
    let session = h.session(Duration::from_secs(60)).await;
    let _running = h.running_vm(&session).await;
    let idle = h.running_vm(&session).await;
    h.service.free(&idle).await.unwrap();

    h.metrics.set_vm_gauges(0, 0);
    let report = h.restart().await;
    assert_eq!(report.running_vms, 1);
    assert_eq!(report.cached_vms, 1);
    assert_eq!(report.sagas(), 0);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.running_vms, 1);
    assert_eq!(metrics.cached_vms, 1);
}
