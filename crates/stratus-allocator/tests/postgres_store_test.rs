// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL allocator store.

#[macro_use]
mod common;

use std::time::Duration;

use chrono::Utc;
use stratus_allocator::model::{
    CachePolicy, ClusterPod, DynamicMount, HolderPod, MountState, Session, Vm, VmSpec, VmStatus,
    VolumeRequest,
};
use stratus_allocator::store::{AllocatorStore, PostgresStore};
use stratus_core::{Operation, OperationStatus, OperationStore, StoreError};
use uuid::Uuid;

async fn store() -> PostgresStore {
    let pool = common::get_test_pool().await.expect("test database");
    PostgresStore::new(pool)
}

fn unique_worker() -> String {
    format!("pg-worker-{}", Uuid::new_v4())
}

async fn session(store: &PostgresStore) -> Session {
    let session = Session::new(
        "pg-test",
        "postgres store",
        CachePolicy {
            idle_timeout: Duration::from_secs(60),
        },
    );
    store.create_session(&session).await.unwrap();
    session
}

async fn allocating_vm(store: &PostgresStore, session: &Session, worker: &str) -> (Vm, Operation) {
    let op = Operation::with_timeout("pg-test", "allocate", Duration::from_secs(60), None);
    let spec = VmSpec {
        session_id: session.id.clone(),
        pool_label: "small".to_string(),
        zone: "zone-a".to_string(),
        cluster_id: "cluster-1".to_string(),
        tunnel: None,
        workloads: Vec::new(),
    };
    let deadline = Utc::now() + chrono::Duration::seconds(60);
    let vm = Vm::new_allocating(spec, op.id.as_str(), "req-1", worker, deadline);
    store.create_vm(&vm, &op).await.unwrap();
    (vm, op)
}

#[tokio::test]
async fn test_session_round_trip_and_deletion() {
    skip_if_no_db!();
    let store = store().await;
    let session = session(&store).await;

    let loaded = store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(loaded.owner, "pg-test");
    assert_eq!(loaded.cache_policy.idle_timeout, Duration::from_secs(60));
    assert!(!loaded.is_deleting());

    let delete_op = Operation::create("pg-test", "delete session", None, None);
    let op_id = store
        .mark_session_deleting(&session.id, &delete_op, "req-1")
        .await
        .unwrap();
    assert_eq!(op_id, delete_op.id);

    let again = Operation::create("pg-test", "delete session again", None, None);
    let op_id = store
        .mark_session_deleting(&session.id, &again, "req-2")
        .await
        .unwrap();
    assert_eq!(op_id, delete_op.id);
    assert!(store.get_operation(&again.id).await.unwrap().is_none());

    let deleting = store.list_deleting_sessions().await.unwrap();
    assert!(deleting.iter().any(|s| s.id == session.id));

    store
        .finish_session_deletion(&session.id, &delete_op.id, b"{}")
        .await
        .unwrap();
    assert!(store.get_session(&session.id).await.unwrap().is_none());
    assert!(
        store
            .get_operation(&delete_op.id)
            .await
            .unwrap()
            .unwrap()
            .is_succeeded()
    );
}

#[tokio::test]
async fn test_vm_lifecycle() {
    skip_if_no_db!();
    let store = store().await;
    let worker = unique_worker();
    let session = session(&store).await;
    let (vm, allocate_op) = allocating_vm(&store, &session, &worker).await;

    let actions = store.load_active_vm_actions(&worker).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].status, VmStatus::Allocating);

    store.set_vm_subject_id(&vm.id, "subject-1").await.unwrap();
    store.set_vm_subject_id(&vm.id, "subject-1").await.unwrap();
    assert!(store.set_vm_subject_id(&vm.id, "subject-2").await.is_err());

    store.set_vm_allocated(&vm.id, Utc::now()).await.unwrap();
    let activity_deadline = Utc::now() + chrono::Duration::seconds(60);
    store
        .complete_allocation(&vm.id, &allocate_op.id, b"{}", activity_deadline)
        .await
        .unwrap();

    let loaded = store.get_vm(&vm.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, VmStatus::Running);
    assert_eq!(
        loaded.instance_properties.vm_subject_id.as_deref(),
        Some("subject-1")
    );
    assert!(loaded.allocate_state.allocated_at.is_some());
    assert!(store.load_active_vm_actions(&worker).await.unwrap().is_empty());
    assert_eq!(store.load_running_vms(&worker).await.unwrap().len(), 1);

    let delete_op = Operation::create("pg-test", "delete vm", None, None);
    let delete_state = store
        .begin_vm_deletion(&vm.id, &delete_op, "req-2", &worker)
        .await
        .unwrap();
    assert_eq!(delete_state.operation_id, delete_op.id);

    let again = Operation::create("pg-test", "delete vm again", None, None);
    let same = store
        .begin_vm_deletion(&vm.id, &again, "req-3", "other-worker")
        .await
        .unwrap();
    assert_eq!(same, delete_state);
    assert!(store.get_operation(&again.id).await.unwrap().is_none());

    store
        .cleanup_vm(&vm.id, &delete_op.id, b"{}")
        .await
        .unwrap();
    assert!(store.get_vm(&vm.id).await.unwrap().is_none());
    assert!(store.load_running_vms(&worker).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_allocation_starts_deletion() {
    skip_if_no_db!();
    let store = store().await;
    let worker = unique_worker();
    let session = session(&store).await;
    let (vm, allocate_op) = allocating_vm(&store, &session, &worker).await;

    let delete_op = Operation::create("pg-test", "compensate", None, None);
    let delete_state = store
        .fail_allocation(
            &vm.id,
            &allocate_op.id,
            &OperationStatus::internal("boot failure"),
            &delete_op,
            "req-1",
            &worker,
        )
        .await
        .unwrap();
    assert_eq!(delete_state.operation_id, delete_op.id);

    let op = store.get_operation(&allocate_op.id).await.unwrap().unwrap();
    assert!(op.is_failed());
    let loaded = store.get_vm(&vm.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, VmStatus::Deleting);

    let err = store
        .complete_allocation(&vm.id, &allocate_op.id, b"{}", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));
}

#[tokio::test]
async fn test_release_acquire_and_expiry() {
    skip_if_no_db!();
    let store = store().await;
    let worker = unique_worker();
    let session = session(&store).await;
    let (vm, allocate_op) = allocating_vm(&store, &session, &worker).await;
    store
        .complete_allocation(
            &vm.id,
            &allocate_op.id,
            b"{}",
            Utc::now() + chrono::Duration::seconds(60),
        )
        .await
        .unwrap();

    let now = Utc::now();
    store
        .release_vm(&vm.id, now, now - chrono::Duration::seconds(1))
        .await
        .unwrap();
    let expired = store.list_expired_vms(Utc::now(), 1000).await.unwrap();
    assert!(expired.iter().any(|v| v.id == vm.id));

    let acquired = store
        .acquire_idle_vm(
            &session.id,
            "small",
            "zone-a",
            Utc::now() + chrono::Duration::seconds(60),
        )
        .await
        .unwrap()
        .expect("idle vm");
    assert_eq!(acquired.id, vm.id);
    assert_eq!(acquired.status, VmStatus::Running);
    assert!(
        store
            .acquire_idle_vm(&session.id, "small", "zone-a", Utc::now())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_mount_lifecycle() {
    skip_if_no_db!();
    let store = store().await;
    let worker = unique_worker();
    let session = session(&store).await;
    let (vm, allocate_op) = allocating_vm(&store, &session, &worker).await;
    store
        .complete_allocation(
            &vm.id,
            &allocate_op.id,
            b"{}",
            Utc::now() + chrono::Duration::seconds(60),
        )
        .await
        .unwrap();

    let mount_op = Operation::create("pg-test", "mount", None, None);
    let disk_id = format!("disk-{}", Uuid::new_v4());
    let mount = DynamicMount::new_pending(
        &vm,
        "/mnt/data",
        VolumeRequest {
            name: "data".to_string(),
            size_gb: 10,
            disk_id: disk_id.clone(),
        },
        worker.as_str(),
        mount_op.id.as_str(),
    );
    store.create_mount(&mount, &mount_op).await.unwrap();
    assert_eq!(store.load_pending_mounts(&worker).await.unwrap().len(), 1);

    let snapshot = store.load_restore_snapshot(&worker).await.unwrap();
    assert_eq!(snapshot.pending_mounts.len(), 1);
    assert_eq!(snapshot.pending_mount_vms.len(), 1);
    assert_eq!(snapshot.pending_mount_vms[0].id, vm.id);
    assert_eq!(snapshot.vm_actions.len(), 1);
    assert!(snapshot.deleting_mounts.is_empty());

    let volume = mount.volume_request.volume_name();
    let claim = format!("claim-{volume}");
    store.set_mount_volume(&mount.id, &volume, &claim).await.unwrap();
    store.set_mount_volume(&mount.id, &volume, &claim).await.unwrap();
    assert!(
        store
            .set_mount_volume(&mount.id, "other", &claim)
            .await
            .is_err()
    );
    assert_eq!(
        store
            .count_mounts_for_claim(&vm.spec.cluster_id, &claim)
            .await
            .unwrap(),
        1
    );

    let holder = |pod_name: &str, generation: i64| HolderPod {
        pod: ClusterPod {
            cluster_id: vm.spec.cluster_id.clone(),
            pod_name: pod_name.to_string(),
        },
        generation,
    };
    assert_eq!(store.reserve_mount_pod_generation(&vm.id).await.unwrap(), 1);
    store
        .set_mount_ready(&mount.id, &vm.id, "mount-1", &holder("holder-1", 1))
        .await
        .unwrap();
    let loaded = store.get_mount(&mount.id).await.unwrap().unwrap();
    assert_eq!(loaded.state, MountState::Ready);
    let vm_row = store.get_vm(&vm.id).await.unwrap().unwrap();
    assert_eq!(
        vm_row.instance_properties.mount_pod_name.as_deref(),
        Some("holder-1")
    );
    assert_eq!(vm_row.instance_properties.mount_pod_generation, 1);

    // Holder pods only move forward.
    assert!(
        !store
            .set_vm_mount_pod(&vm.id, &holder("holder-stale", 1))
            .await
            .unwrap()
    );
    assert!(
        store
            .set_vm_mount_pod(&vm.id, &holder("holder-3", 3))
            .await
            .unwrap()
    );
    let vm_row = store.get_vm(&vm.id).await.unwrap().unwrap();
    assert_eq!(
        vm_row.instance_properties.mount_pod_name.as_deref(),
        Some("holder-3")
    );
    assert_eq!(vm_row.instance_properties.mount_pod_reserved_generation, 3);
    assert_eq!(store.reserve_mount_pod_generation(&vm.id).await.unwrap(), 4);
    let missing = store
        .set_vm_mount_pod("vm-missing", &holder("holder-x", 9))
        .await
        .unwrap_err();
    assert!(missing.is_not_found());

    let unmount_op = Operation::create("pg-test", "unmount", None, None);
    let unmount_id = store.begin_unmount(&mount.id, &unmount_op).await.unwrap();
    assert_eq!(unmount_id, unmount_op.id);
    let again = Operation::create("pg-test", "unmount again", None, None);
    assert_eq!(
        store.begin_unmount(&mount.id, &again).await.unwrap(),
        unmount_op.id
    );
    assert_eq!(store.load_deleting_mounts(&worker).await.unwrap().len(), 1);

    store
        .finish_unmount(&mount.id, &unmount_op.id, b"{}")
        .await
        .unwrap();
    assert!(store.get_mount(&mount.id).await.unwrap().is_none());
    assert!(store.get_mounts_by_vm(&vm.id).await.unwrap().is_empty());
}
