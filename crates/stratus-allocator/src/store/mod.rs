// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocator persistence: sessions, VMs and dynamic mounts.
//!
//! [`AllocatorStore`] extends [`OperationStore`] with the domain rows. Writes
//! that touch an operation and a domain row together are single methods here
//! so every backend can make them atomic:
//!
//! | Method | Writes |
//! |--------|--------|
//! | [`AllocatorStore::create_vm`] | allocate op + VM row |
//! | [`AllocatorStore::fail_allocation`] | fail allocate op + VM Deleting + delete op |
//! | [`AllocatorStore::complete_allocation`] | complete allocate op + VM Running |
//! | [`AllocatorStore::cleanup_vm`] | complete delete op + remove VM row |
//! | [`AllocatorStore::fail_mount`] | fail mount op + mount Deleting + unmount op |
//! | [`AllocatorStore::finish_unmount`] | complete unmount op + remove mount row |
//! | [`AllocatorStore::finish_session_deletion`] | complete delete op + remove session |
//! | [`AllocatorStore::set_mount_ready`] | mount Ready + VM holder pod (generation-guarded) |
//!
//! [`AllocatorStore::load_restore_snapshot`] reads everything Restore-On-Startup
//! needs from one consistent view of the store.

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stratus_core::error::Result;
use stratus_core::{Operation, OperationStatus, OperationStore};

use crate::model::{DeleteState, DynamicMount, HolderPod, Session, Vm};

/// Unfinished work of one worker, read from a single consistent view.
#[derive(Debug, Clone, Default)]
pub struct RestoreSnapshot {
    /// RUNNING and IDLE VMs allocated by the worker.
    pub running_vms: Vec<Vm>,
    /// ALLOCATING and DELETING VMs whose current operation the worker owns.
    pub vm_actions: Vec<Vm>,
    /// Sessions whose deletion started.
    pub deleting_sessions: Vec<Session>,
    /// Mounts of the worker whose mount operation is still open.
    pub pending_mounts: Vec<DynamicMount>,
    /// The VMs of `pending_mounts` that still exist.
    pub pending_mount_vms: Vec<Vm>,
    /// DELETING mounts of the worker.
    pub deleting_mounts: Vec<DynamicMount>,
}

/// Persistence of allocator entities.
///
/// Guarded updates fail with `StoreError::InvalidState` when the entity is not
/// in the expected state and `StoreError::NotFound` when it is gone.
#[async_trait]
pub trait AllocatorStore: OperationStore {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Insert a session.
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Get a session.
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Insert `delete_op` and mark the session deleting.
    ///
    /// Returns the delete operation ID. If deletion already started the
    /// existing operation ID is returned and `delete_op` is not inserted.
    async fn mark_session_deleting(
        &self,
        session_id: &str,
        delete_op: &Operation,
        request_id: &str,
    ) -> Result<String>;

    /// Sessions whose deletion started.
    async fn list_deleting_sessions(&self) -> Result<Vec<Session>>;

    /// Remove the session and complete its delete operation.
    async fn finish_session_deletion(
        &self,
        session_id: &str,
        operation_id: &str,
        response: &[u8],
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // VMs
    // ------------------------------------------------------------------

    /// Insert the allocate operation and the VM.
    async fn create_vm(&self, vm: &Vm, allocate_op: &Operation) -> Result<()>;

    /// Get a VM.
    async fn get_vm(&self, vm_id: &str) -> Result<Option<Vm>>;

    /// VMs of a session, in any status.
    async fn get_session_vms(&self, session_id: &str) -> Result<Vec<Vm>>;

    /// Persist the VM's identity subject. Idempotent for the same value.
    async fn set_vm_subject_id(&self, vm_id: &str, subject_id: &str) -> Result<()>;

    /// Hand out the next holder pod generation of the VM.
    ///
    /// Every call returns a new, higher value, so concurrent sagas never
    /// recreate the holder pod under the same generation.
    async fn reserve_mount_pod_generation(&self, vm_id: &str) -> Result<i64>;

    /// Record `holder` as the VM's holder pod unless a newer generation is
    /// already recorded. Returns whether the VM row changed.
    async fn set_vm_mount_pod(&self, vm_id: &str, holder: &HolderPod) -> Result<bool>;

    /// Persist the VM's tunnel pod. Idempotent for the same value.
    async fn set_tunnel_pod(&self, vm_id: &str, tunnel_pod_name: &str) -> Result<()>;

    /// Record that the cluster accepted the allocation.
    async fn set_vm_allocated(&self, vm_id: &str, allocated_at: DateTime<Utc>) -> Result<()>;

    /// Complete the allocate operation and move the VM to RUNNING.
    async fn complete_allocation(
        &self,
        vm_id: &str,
        operation_id: &str,
        response: &[u8],
        activity_deadline: DateTime<Utc>,
    ) -> Result<()>;

    /// Fail the allocate operation and start VM deletion in one transaction.
    ///
    /// Returns the VM's delete state; an existing one is kept.
    async fn fail_allocation(
        &self,
        vm_id: &str,
        operation_id: &str,
        status: &OperationStatus,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState>;

    /// Move the VM to DELETING with `delete_op` as its delete operation.
    ///
    /// Idempotent: if deletion already started, returns the existing delete
    /// state and does not insert `delete_op`.
    async fn begin_vm_deletion(
        &self,
        vm_id: &str,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState>;

    /// Move a RUNNING VM to IDLE.
    async fn release_vm(
        &self,
        vm_id: &str,
        idle_since: DateTime<Utc>,
        idle_deadline: DateTime<Utc>,
    ) -> Result<()>;

    /// Take an IDLE VM of the session and pool and move it to RUNNING.
    async fn acquire_idle_vm(
        &self,
        session_id: &str,
        pool_label: &str,
        zone: &str,
        activity_deadline: DateTime<Utc>,
    ) -> Result<Option<Vm>>;

    /// Extend the activity deadline of a RUNNING VM.
    async fn update_activity_deadline(&self, vm_id: &str, deadline: DateTime<Utc>) -> Result<()>;

    /// Complete the delete operation and remove the VM row.
    async fn cleanup_vm(&self, vm_id: &str, operation_id: &str, response: &[u8]) -> Result<()>;

    /// ALLOCATING and DELETING VMs whose current operation belongs to `worker_id`.
    async fn load_active_vm_actions(&self, worker_id: &str) -> Result<Vec<Vm>>;

    /// RUNNING and IDLE VMs allocated by `worker_id`.
    async fn load_running_vms(&self, worker_id: &str) -> Result<Vec<Vm>>;

    /// RUNNING and IDLE VMs past their activity or idle deadline.
    async fn list_expired_vms(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Vm>>;

    // ------------------------------------------------------------------
    // Dynamic mounts
    // ------------------------------------------------------------------

    /// Insert the mount operation and the mount.
    async fn create_mount(&self, mount: &DynamicMount, mount_op: &Operation) -> Result<()>;

    /// Get a mount.
    async fn get_mount(&self, mount_id: &str) -> Result<Option<DynamicMount>>;

    /// Mounts of a VM, in any state.
    async fn get_mounts_by_vm(&self, vm_id: &str) -> Result<Vec<DynamicMount>>;

    /// Persist volume and claim names. Set at most once.
    async fn set_mount_volume(
        &self,
        mount_id: &str,
        volume_name: &str,
        claim_name: &str,
    ) -> Result<()>;

    /// Move a PENDING mount to READY and record the VM's new holder pod.
    ///
    /// The holder pod is recorded with the same guard as
    /// [`AllocatorStore::set_vm_mount_pod`]; the mount becomes READY either way.
    async fn set_mount_ready(
        &self,
        mount_id: &str,
        vm_id: &str,
        mount_name: &str,
        holder: &HolderPod,
    ) -> Result<()>;

    /// Fail the mount operation and start the unmount in one transaction.
    ///
    /// Returns the unmount operation ID.
    async fn fail_mount(
        &self,
        mount_id: &str,
        operation_id: &str,
        status: &OperationStatus,
        unmount_op: &Operation,
    ) -> Result<String>;

    /// Move the mount to DELETING with `unmount_op` as its unmount operation.
    ///
    /// Idempotent: returns the existing unmount operation ID if present.
    async fn begin_unmount(&self, mount_id: &str, unmount_op: &Operation) -> Result<String>;

    /// Number of mounts bound to a claim.
    async fn count_mounts_for_claim(&self, cluster_id: &str, claim_name: &str) -> Result<i64>;

    /// Complete the unmount operation and remove the mount row.
    async fn finish_unmount(&self, mount_id: &str, operation_id: &str, response: &[u8])
    -> Result<()>;

    /// Mounts owned by `worker_id` whose mount operation is still open.
    ///
    /// Includes READY mounts whose operation was not completed yet.
    async fn load_pending_mounts(&self, worker_id: &str) -> Result<Vec<DynamicMount>>;

    /// DELETING mounts owned by `worker_id`.
    async fn load_deleting_mounts(&self, worker_id: &str) -> Result<Vec<DynamicMount>>;

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Everything `worker_id` left unfinished, read from one snapshot.
    async fn load_restore_snapshot(&self, worker_id: &str) -> Result<RestoreSnapshot>;
}
