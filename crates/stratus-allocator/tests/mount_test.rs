// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mount and Unmount sagas.

mod common;

use std::time::Duration;

use common::{Harness, fast_config};
use stratus_allocator::Error;
use stratus_allocator::cluster::ClusterError;
use stratus_allocator::model::{MountResponse, MountState, PodPhase, UnmountResponse};
use stratus_allocator::sagas::{UnmountOrigin, UnmountSaga};
use stratus_allocator::store::AllocatorStore;
use stratus_core::{Operation, OperationStore, RunnerState, StatusCode};

async fn mounted(h: &Harness, vm_id: &str, path: &str, disk_id: &str) -> String {
    let op = h
        .service
        .mount(h.mount_request(vm_id, path, disk_id))
        .await
        .unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    let op = h.operation(&op.id).await;
    let response: MountResponse = serde_json::from_slice(op.response.as_deref().unwrap()).unwrap();
    assert_eq!(response.mount.state, MountState::Ready);
    response.mount.id
}

/// The VM's recorded holder pod matches the live one and no change is pending.
async fn assert_holder_in_sync(h: &Harness, vm_id: &str) {
    let vm = h.store.get_vm(vm_id).await.unwrap().unwrap();
    assert!(h.cluster.holder_pod(vm_id).is_some());
    assert_eq!(vm.instance_properties.mount_pod_name, h.cluster.holder_pod(vm_id));
    assert!(!vm.has_pending_holder_change());
}

#[tokio::test]
async fn test_mount_then_unmount_releases_everything() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    let mount_id = mounted(&h, &vm_id, "/mnt/data", "disk-1").await;
    let mount = h.service.get_mount(&mount_id).await.unwrap();
    assert_eq!(mount.volume_name.as_deref(), Some("volume-disk-1"));
    assert!(mount.volume_claim_name.is_some());
    assert!(mount.mount_name.is_some());
    assert!(h.cluster.has_volume("volume-disk-1"));
    assert_eq!(h.cluster.attached_mounts(&vm_id), vec![mount_id.clone()]);
    assert_eq!(
        h.service
            .get_vm(&vm_id)
            .await
            .unwrap()
            .instance_properties
            .mount_pod_name,
        h.cluster.holder_pod(&vm_id)
    );

    let op = h.service.unmount(&mount_id).await.unwrap();
    let again = h.service.unmount(&mount_id).await;
    if let Ok(again) = again {
        assert_eq!(again.id, op.id);
    }
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    assert!(matches!(
        h.service.get_mount(&mount_id).await,
        Err(Error::MountNotFound(_))
    ));
    assert!(!h.cluster.has_volume("volume-disk-1"));
    assert!(h.cluster.attached_mounts(&vm_id).is_empty());
    assert_eq!(h.cluster.calls().unmount_from_vm, 1);
}

#[tokio::test]
async fn test_shared_claim_outlives_first_unmount() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    let first = mounted(&h, &vm_id, "/mnt/a", "disk-shared").await;
    let second = mounted(&h, &vm_id, "/mnt/b", "disk-shared").await;
    let claim = h
        .service
        .get_mount(&first)
        .await
        .unwrap()
        .volume_claim_name
        .unwrap();

    let op = h.service.unmount(&first).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    assert!(h.cluster.has_claim(&claim));
    assert!(h.cluster.has_volume("volume-disk-shared"));

    let op = h.service.unmount(&second).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    assert!(!h.cluster.has_claim(&claim));
    assert!(!h.cluster.has_volume("volume-disk-shared"));
}

#[tokio::test]
async fn test_attach_failure_unmounts() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.cluster
        .push_attach_error(ClusterError::Rejected("holder pod quota".to_string()));

    let op = h
        .service
        .mount(h.mount_request(&vm_id, "/mnt/data", "disk-2"))
        .await
        .unwrap();
    let mount_id = h.only_mount_of(&vm_id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Failed);
    assert_eq!(
        h.operation(&op.id).await.error.map(|e| e.code),
        Some(StatusCode::FailedPrecondition)
    );

    h.wait_mount_removed(&mount_id).await;
    assert!(!h.cluster.has_volume("volume-disk-2"));
    assert_eq!(h.metrics.snapshot().mount_errors, 1);
}

#[tokio::test]
async fn test_failed_holder_pod_fails_mount() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.cluster.set_default_pod_phase(PodPhase::Failed);

    let op = h
        .service
        .mount(h.mount_request(&vm_id, "/mnt/data", "disk-3"))
        .await
        .unwrap();
    let mount_id = h.only_mount_of(&vm_id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Failed);
    assert_eq!(
        h.operation(&op.id).await.error.map(|e| e.code),
        Some(StatusCode::Internal)
    );

    h.wait_mount_removed(&mount_id).await;
    assert!(h.cluster.attached_mounts(&vm_id).is_empty());
}

#[tokio::test]
async fn test_vm_deletion_unmounts_volumes() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    let mount_id = mounted(&h, &vm_id, "/mnt/data", "disk-4").await;

    h.service.free(&vm_id).await.unwrap();
    h.wait_vm_removed(&vm_id).await;
    h.wait_mount_removed(&mount_id).await;

    assert!(!h.cluster.has_volume("volume-disk-4"));
    assert_eq!(h.cluster.calls().deallocate_mount_holders, 1);
}

#[tokio::test]
async fn test_mount_validation() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    assert!(matches!(
        h.service
            .mount(h.mount_request(&vm_id, "relative/path", "disk-5"))
            .await,
        Err(Error::InvalidRequest(_))
    ));

    mounted(&h, &vm_id, "/mnt/data", "disk-5").await;
    assert!(matches!(
        h.service
            .mount(h.mount_request(&vm_id, "/mnt/data", "disk-6"))
            .await,
        Err(Error::InvalidRequest(_))
    ));

    let (_, allocating) = h.allocate(&session).await;
    assert!(matches!(
        h.service
            .mount(h.mount_request(&allocating, "/mnt/data", "disk-7"))
            .await,
        Err(Error::FailedPrecondition(_))
    ));
}

#[tokio::test]
async fn test_mounts_disabled() {
    let mut config = fast_config();
    config.mounts_enabled = false;
    let h = Harness::with_config(config);
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    assert!(matches!(
        h.service
            .mount(h.mount_request(&vm_id, "/mnt/data", "disk-8"))
            .await,
        Err(Error::FailedPrecondition(_))
    ));

    h.service.free(&vm_id).await.unwrap();
    h.wait_vm_removed(&vm_id).await;
    assert_eq!(h.cluster.calls().deallocate_mount_holders, 0);
}

#[tokio::test]
async fn test_unmount_of_removed_mount_is_noop() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    let mount_id = mounted(&h, &vm_id, "/mnt/data", "disk-9").await;

    let op = h.service.unmount(&mount_id).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);
    let calls = h.cluster.calls();

    let rerun = Operation::create("team-a", "unmount again", None, None);
    h.store.create_operation(&rerun).await.unwrap();
    h.scheduler().submit(UnmountSaga::task(
        h.ctx().clone(),
        &mount_id,
        &rerun.id,
        UnmountOrigin::Requested,
    ));
    assert_eq!(h.wait(&rerun.id).await, RunnerState::Done);

    let response: UnmountResponse =
        serde_json::from_slice(h.operation(&rerun.id).await.response.as_deref().unwrap()).unwrap();
    assert_eq!(response.mount_id, mount_id);
    assert!(response.mount_failure.is_none());
    let after = h.cluster.calls();
    assert_eq!(after.detach_volume, calls.detach_volume);
    assert_eq!(after.unmount_from_vm, calls.unmount_from_vm);
    assert!(h.cluster.attached_mounts(&vm_id).is_empty());
}

#[tokio::test]
async fn test_expired_mount_is_compensated_once() {
    let mut config = fast_config();
    config.mount_timeout = Duration::from_millis(200);
    let h = Harness::with_config(config);
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    h.cluster.set_default_pod_phase(PodPhase::Pending);

    let op = h
        .service
        .mount(h.mount_request(&vm_id, "/mnt/data", "disk-10"))
        .await
        .unwrap();
    let mount_id = h.only_mount_of(&vm_id).await;
    assert_eq!(h.wait(&op.id).await, RunnerState::Expired);
    assert_eq!(
        h.operation(&op.id).await.error.map(|e| e.code),
        Some(StatusCode::DeadlineExceeded)
    );

    let mount = h.store.get_mount(&mount_id).await.unwrap().unwrap();
    assert_eq!(mount.state, MountState::Deleting);
    let unmount_id = mount.unmount_operation_id.unwrap();
    h.cluster.set_default_pod_phase(PodPhase::Running);
    h.wait_mount_removed(&mount_id).await;

    let unmount = h.operation(&unmount_id).await;
    let response: UnmountResponse =
        serde_json::from_slice(unmount.response.as_deref().unwrap()).unwrap();
    assert_eq!(
        response.mount_failure.map(|status| status.code),
        Some(StatusCode::DeadlineExceeded)
    );
    let calls = h.cluster.calls();
    assert_eq!(calls.detach_volume, 1);
    assert_eq!(calls.unmount_from_vm, 1);
    assert_eq!(h.metrics.snapshot().mount_errors, 1);
    assert!(!h.cluster.has_volume("volume-disk-10"));
    assert_holder_in_sync(&h, &vm_id).await;
}

#[tokio::test]
async fn test_concurrent_mounts_share_latest_holder() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    let (a, b) = tokio::join!(
        h.service.mount(h.mount_request(&vm_id, "/mnt/a", "disk-11")),
        h.service.mount(h.mount_request(&vm_id, "/mnt/b", "disk-12")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(h.wait(&a.id).await, RunnerState::Done);
    assert_eq!(h.wait(&b.id).await, RunnerState::Done);

    let mut mount_ids: Vec<String> = h
        .store
        .get_mounts_by_vm(&vm_id)
        .await
        .unwrap()
        .into_iter()
        .inspect(|m| assert_eq!(m.state, MountState::Ready))
        .map(|m| m.id)
        .collect();
    mount_ids.sort();
    assert_eq!(h.cluster.attached_mounts(&vm_id), mount_ids);
    assert_holder_in_sync(&h, &vm_id).await;
    let vm = h.store.get_vm(&vm_id).await.unwrap().unwrap();
    assert_eq!(vm.instance_properties.mount_pod_generation, 2);
}

#[tokio::test]
async fn test_unmount_records_recreated_holder() {
    let h = Harness::new();
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;

    let first = mounted(&h, &vm_id, "/mnt/a", "disk-13").await;
    let second = mounted(&h, &vm_id, "/mnt/b", "disk-14").await;
    let before = h.cluster.holder_pod(&vm_id).unwrap();

    let op = h.service.unmount(&first).await.unwrap();
    assert_eq!(h.wait(&op.id).await, RunnerState::Done);

    assert_eq!(h.cluster.attached_mounts(&vm_id), vec![second]);
    assert_ne!(h.cluster.holder_pod(&vm_id), Some(before));
    assert_holder_in_sync(&h, &vm_id).await;
    let vm = h.store.get_vm(&vm_id).await.unwrap().unwrap();
    assert_eq!(vm.instance_properties.mount_pod_generation, 3);
}
