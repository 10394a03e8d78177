// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory allocator store.
//!
//! One mutex guards operations and domain rows together, so composite writes
//! are atomic. Every composite write validates before it mutates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use stratus_core::error::{Result, StoreError};
use stratus_core::{Operation, OperationStatus, OperationStore, OperationTable};

use super::{AllocatorStore, RestoreSnapshot};
use crate::model::{
    DeleteState, DynamicMount, HolderPod, IdleState, MountState, Session, Vm, VmStatus,
};

#[derive(Debug, Default)]
struct State {
    operations: OperationTable,
    sessions: HashMap<String, Session>,
    vms: HashMap<String, Vm>,
    mounts: HashMap<String, DynamicMount>,
}

impl State {
    fn vm(&self, vm_id: &str) -> Result<&Vm> {
        self.vms
            .get(vm_id)
            .ok_or_else(|| StoreError::not_found("vm", vm_id))
    }

    fn vm_mut(&mut self, vm_id: &str) -> Result<&mut Vm> {
        self.vms
            .get_mut(vm_id)
            .ok_or_else(|| StoreError::not_found("vm", vm_id))
    }

    fn mount_mut(&mut self, mount_id: &str) -> Result<&mut DynamicMount> {
        self.mounts
            .get_mut(mount_id)
            .ok_or_else(|| StoreError::not_found("mount", mount_id))
    }

    fn begin_vm_deletion(
        &mut self,
        vm_id: &str,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState> {
        if let Some(existing) = self.vm(vm_id)?.delete_state.clone() {
            return Ok(existing);
        }
        self.operations.create(delete_op)?;
        let delete_state = DeleteState {
            operation_id: delete_op.id.clone(),
            request_id: request_id.to_string(),
            worker_id: worker_id.to_string(),
        };
        let vm = self.vm_mut(vm_id)?;
        vm.status = VmStatus::Deleting;
        vm.delete_state = Some(delete_state.clone());
        Ok(delete_state)
    }

    /// Record `holder` unless the VM already has a newer holder pod.
    fn set_vm_mount_pod(&mut self, vm_id: &str, holder: &HolderPod) -> Result<bool> {
        let props = &mut self.vm_mut(vm_id)?.instance_properties;
        if holder.generation <= props.mount_pod_generation {
            return Ok(false);
        }
        props.mount_pod_name = Some(holder.pod.pod_name.clone());
        props.mount_pod_generation = holder.generation;
        props.mount_pod_reserved_generation =
            props.mount_pod_reserved_generation.max(holder.generation);
        Ok(true)
    }

    fn deleting_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.is_deleting())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    fn active_vm_actions(&self, worker_id: &str) -> Vec<Vm> {
        self.vms
            .values()
            .filter(|vm| {
                matches!(vm.status, VmStatus::Allocating | VmStatus::Deleting)
                    && vm.owner_worker() == worker_id
            })
            .cloned()
            .collect()
    }

    fn running_vms(&self, worker_id: &str) -> Vec<Vm> {
        self.vms
            .values()
            .filter(|vm| vm.is_usable() && vm.allocate_state.worker_id == worker_id)
            .cloned()
            .collect()
    }

    fn pending_mounts(&self, worker_id: &str) -> Vec<DynamicMount> {
        self.mounts
            .values()
            .filter(|m| {
                m.state != MountState::Deleting
                    && m.worker_id == worker_id
                    && self
                        .operations
                        .get(&m.mount_operation_id)
                        .is_some_and(|op| !op.done)
            })
            .cloned()
            .collect()
    }

    fn deleting_mounts(&self, worker_id: &str) -> Vec<DynamicMount> {
        self.mounts
            .values()
            .filter(|m| m.state == MountState::Deleting && m.worker_id == worker_id)
            .cloned()
            .collect()
    }

    fn begin_unmount(&mut self, mount_id: &str, unmount_op: &Operation) -> Result<String> {
        let existing = self
            .mounts
            .get(mount_id)
            .ok_or_else(|| StoreError::not_found("mount", mount_id))?
            .unmount_operation_id
            .clone();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        self.operations.create(unmount_op)?;
        let mount = self.mount_mut(mount_id)?;
        mount.state = MountState::Deleting;
        mount.unmount_operation_id = Some(unmount_op.id.clone());
        Ok(unmount_op.id.clone())
    }
}

fn invalid_state(kind: &'static str, id: &str, state: impl ToString) -> StoreError {
    StoreError::InvalidState {
        kind,
        id: id.to_string(),
        state: state.to_string(),
    }
}

/// Allocator store kept in process memory.
///
/// [`InMemoryStore::inject_unavailable`] makes the next calls fail with
/// `StoreError::Unavailable` to simulate database contention.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unavailable: AtomicU32,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `calls` store calls with `StoreError::Unavailable`.
    pub fn inject_unavailable(&self, calls: u32) {
        self.unavailable.fetch_add(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected contention".to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Number of VM rows.
    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    /// Number of mount rows.
    pub async fn mount_count(&self) -> usize {
        self.state.lock().await.mounts.len()
    }

    /// Number of operations.
    pub async fn operation_count(&self) -> usize {
        self.state.lock().await.operations.len()
    }
}

#[async_trait]
impl OperationStore for InMemoryStore {
    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.operations.create(operation)
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        self.check_available()?;
        Ok(self.state.lock().await.operations.get(id).cloned())
    }

    async fn get_by_idempotency_key(&self, owner: &str, key: &str) -> Result<Option<Operation>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .operations
            .get_by_idempotency_key(owner, key)
            .cloned())
    }

    async fn update_progress(&self, id: &str) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.operations.update_progress(id)
    }

    async fn update_meta(&self, id: &str, meta: &[u8]) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.operations.update_meta(id, meta)
    }

    async fn complete_operation(&self, id: &str, response: &[u8]) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.operations.complete(id, response)
    }

    async fn fail_operation(&self, id: &str, status: &OperationStatus) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.operations.fail(id, status)
    }

    async fn list_incomplete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .operations
            .list_incomplete_older_than(cutoff, limit))
    }
}

#[async_trait]
impl AllocatorStore for InMemoryStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists {
                kind: "session",
                id: session.id.clone(),
            });
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.check_available()?;
        Ok(self.state.lock().await.sessions.get(session_id).cloned())
    }

    async fn mark_session_deleting(
        &self,
        session_id: &str,
        delete_op: &Operation,
        request_id: &str,
    ) -> Result<String> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        if let Some(existing) = &session.delete_operation_id {
            return Ok(existing.clone());
        }
        state.operations.create(delete_op)?;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.delete_operation_id = Some(delete_op.id.clone());
            session.delete_request_id = Some(request_id.to_string());
        }
        Ok(delete_op.id.clone())
    }

    async fn list_deleting_sessions(&self) -> Result<Vec<Session>> {
        self.check_available()?;
        Ok(self.state.lock().await.deleting_sessions())
    }

    async fn finish_session_deletion(
        &self,
        session_id: &str,
        operation_id: &str,
        response: &[u8],
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.operations.check_active(operation_id)?;
        if state.vms.values().any(|vm| vm.spec.session_id == session_id) {
            return Err(invalid_state("session", session_id, "has VMs"));
        }
        state.operations.complete(operation_id, response)?;
        state.sessions.remove(session_id);
        Ok(())
    }

    async fn create_vm(&self, vm: &Vm, allocate_op: &Operation) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.vms.contains_key(&vm.id) {
            return Err(StoreError::AlreadyExists {
                kind: "vm",
                id: vm.id.clone(),
            });
        }
        state.operations.create(allocate_op)?;
        state.vms.insert(vm.id.clone(), vm.clone());
        Ok(())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<Vm>> {
        self.check_available()?;
        Ok(self.state.lock().await.vms.get(vm_id).cloned())
    }

    async fn get_session_vms(&self, session_id: &str) -> Result<Vec<Vm>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut vms: Vec<_> = state
            .vms
            .values()
            .filter(|vm| vm.spec.session_id == session_id)
            .cloned()
            .collect();
        vms.sort_by_key(|vm| vm.allocate_state.started_at);
        Ok(vms)
    }

    async fn set_vm_subject_id(&self, vm_id: &str, subject_id: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        match &vm.instance_properties.vm_subject_id {
            Some(existing) if existing != subject_id => {
                Err(invalid_state("vm", vm_id, "subject already set"))
            }
            _ => {
                vm.instance_properties.vm_subject_id = Some(subject_id.to_string());
                Ok(())
            }
        }
    }

    async fn reserve_mount_pod_generation(&self, vm_id: &str) -> Result<i64> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let props = &mut state.vm_mut(vm_id)?.instance_properties;
        props.mount_pod_reserved_generation += 1;
        Ok(props.mount_pod_reserved_generation)
    }

    async fn set_vm_mount_pod(&self, vm_id: &str, holder: &HolderPod) -> Result<bool> {
        self.check_available()?;
        self.state.lock().await.set_vm_mount_pod(vm_id, holder)
    }

    async fn set_tunnel_pod(&self, vm_id: &str, tunnel_pod_name: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        match &vm.instance_properties.tunnel_pod_name {
            Some(existing) if existing != tunnel_pod_name => {
                Err(invalid_state("vm", vm_id, "tunnel pod already set"))
            }
            _ => {
                vm.instance_properties.tunnel_pod_name = Some(tunnel_pod_name.to_string());
                Ok(())
            }
        }
    }

    async fn set_vm_allocated(&self, vm_id: &str, allocated_at: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        if vm.status != VmStatus::Allocating {
            return Err(invalid_state("vm", vm_id, vm.status));
        }
        vm.allocate_state.allocated_at.get_or_insert(allocated_at);
        Ok(())
    }

    async fn complete_allocation(
        &self,
        vm_id: &str,
        operation_id: &str,
        response: &[u8],
        activity_deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let status = state.vm(vm_id)?.status;
        if status != VmStatus::Allocating {
            return Err(invalid_state("vm", vm_id, status));
        }
        state.operations.complete(operation_id, response)?;
        let vm = state.vm_mut(vm_id)?;
        vm.status = VmStatus::Running;
        vm.run_state.activity_deadline = Some(activity_deadline);
        Ok(())
    }

    async fn fail_allocation(
        &self,
        vm_id: &str,
        operation_id: &str,
        status: &OperationStatus,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.vm(vm_id)?;
        state.operations.check_active(operation_id)?;
        let delete_state = state.begin_vm_deletion(vm_id, delete_op, request_id, worker_id)?;
        state.operations.fail(operation_id, status)?;
        Ok(delete_state)
    }

    async fn begin_vm_deletion(
        &self,
        vm_id: &str,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .begin_vm_deletion(vm_id, delete_op, request_id, worker_id)
    }

    async fn release_vm(
        &self,
        vm_id: &str,
        idle_since: DateTime<Utc>,
        idle_deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        if vm.status != VmStatus::Running {
            return Err(invalid_state("vm", vm_id, vm.status));
        }
        vm.status = VmStatus::Idle;
        vm.run_state.activity_deadline = None;
        vm.idle_state = IdleState {
            idle_since: Some(idle_since),
            idle_deadline: Some(idle_deadline),
        };
        Ok(())
    }

    async fn acquire_idle_vm(
        &self,
        session_id: &str,
        pool_label: &str,
        zone: &str,
        activity_deadline: DateTime<Utc>,
    ) -> Result<Option<Vm>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let candidate = state
            .vms
            .values()
            .filter(|vm| {
                vm.status == VmStatus::Idle
                    && vm.spec.session_id == session_id
                    && vm.spec.pool_label == pool_label
                    && vm.spec.zone == zone
            })
            .min_by_key(|vm| vm.idle_state.idle_since)
            .map(|vm| vm.id.clone());

        let Some(vm_id) = candidate else {
            return Ok(None);
        };
        let vm = state.vm_mut(&vm_id)?;
        vm.status = VmStatus::Running;
        vm.idle_state = IdleState::default();
        vm.run_state.activity_deadline = Some(activity_deadline);
        Ok(Some(vm.clone()))
    }

    async fn update_activity_deadline(&self, vm_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        if vm.status != VmStatus::Running {
            return Err(invalid_state("vm", vm_id, vm.status));
        }
        vm.run_state.activity_deadline = Some(deadline);
        Ok(())
    }

    async fn cleanup_vm(&self, vm_id: &str, operation_id: &str, response: &[u8]) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.operations.complete(operation_id, response)?;
        state.vms.remove(vm_id);
        Ok(())
    }

    async fn load_active_vm_actions(&self, worker_id: &str) -> Result<Vec<Vm>> {
        self.check_available()?;
        Ok(self.state.lock().await.active_vm_actions(worker_id))
    }

    async fn load_running_vms(&self, worker_id: &str) -> Result<Vec<Vm>> {
        self.check_available()?;
        Ok(self.state.lock().await.running_vms(worker_id))
    }

    async fn list_expired_vms(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Vm>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut vms: Vec<_> = state
            .vms
            .values()
            .filter(|vm| vm.is_expired_at(now))
            .cloned()
            .collect();
        vms.sort_by(|a, b| a.id.cmp(&b.id));
        vms.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(vms)
    }

    async fn create_mount(&self, mount: &DynamicMount, mount_op: &Operation) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.mounts.contains_key(&mount.id) {
            return Err(StoreError::AlreadyExists {
                kind: "mount",
                id: mount.id.clone(),
            });
        }
        state.operations.create(mount_op)?;
        state.mounts.insert(mount.id.clone(), mount.clone());
        Ok(())
    }

    async fn get_mount(&self, mount_id: &str) -> Result<Option<DynamicMount>> {
        self.check_available()?;
        Ok(self.state.lock().await.mounts.get(mount_id).cloned())
    }

    async fn get_mounts_by_vm(&self, vm_id: &str) -> Result<Vec<DynamicMount>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .mounts
            .values()
            .filter(|m| m.vm_id == vm_id)
            .cloned()
            .collect())
    }

    async fn set_mount_volume(
        &self,
        mount_id: &str,
        volume_name: &str,
        claim_name: &str,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mount = state.mount_mut(mount_id)?;
        match (&mount.volume_name, &mount.volume_claim_name) {
            (None, None) => {
                mount.volume_name = Some(volume_name.to_string());
                mount.volume_claim_name = Some(claim_name.to_string());
                Ok(())
            }
            (Some(v), Some(c)) if v == volume_name && c == claim_name => Ok(()),
            _ => Err(invalid_state("mount", mount_id, "volume already set")),
        }
    }

    async fn set_mount_ready(
        &self,
        mount_id: &str,
        vm_id: &str,
        mount_name: &str,
        holder: &HolderPod,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mount = state
            .mounts
            .get(mount_id)
            .ok_or_else(|| StoreError::not_found("mount", mount_id))?;
        if mount.state != MountState::Pending {
            return Err(invalid_state("mount", mount_id, mount.state));
        }
        state.vm(vm_id)?;

        let mount = state.mount_mut(mount_id)?;
        mount.state = MountState::Ready;
        mount.mount_name = Some(mount_name.to_string());
        state.set_vm_mount_pod(vm_id, holder)?;
        Ok(())
    }

    async fn fail_mount(
        &self,
        mount_id: &str,
        operation_id: &str,
        status: &OperationStatus,
        unmount_op: &Operation,
    ) -> Result<String> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.mounts.contains_key(mount_id) {
            return Err(StoreError::not_found("mount", mount_id));
        }
        state.operations.check_active(operation_id)?;
        let unmount_id = state.begin_unmount(mount_id, unmount_op)?;
        state.operations.fail(operation_id, status)?;
        Ok(unmount_id)
    }

    async fn begin_unmount(&self, mount_id: &str, unmount_op: &Operation) -> Result<String> {
        self.check_available()?;
        self.state.lock().await.begin_unmount(mount_id, unmount_op)
    }

    async fn count_mounts_for_claim(&self, cluster_id: &str, claim_name: &str) -> Result<i64> {
        self.check_available()?;
        let state = self.state.lock().await;
        let count = state
            .mounts
            .values()
            .filter(|m| {
                m.cluster_id == cluster_id && m.volume_claim_name.as_deref() == Some(claim_name)
            })
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn finish_unmount(
        &self,
        mount_id: &str,
        operation_id: &str,
        response: &[u8],
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.operations.complete(operation_id, response)?;
        state.mounts.remove(mount_id);
        Ok(())
    }

    async fn load_pending_mounts(&self, worker_id: &str) -> Result<Vec<DynamicMount>> {
        self.check_available()?;
        Ok(self.state.lock().await.pending_mounts(worker_id))
    }

    async fn load_deleting_mounts(&self, worker_id: &str) -> Result<Vec<DynamicMount>> {
        self.check_available()?;
        Ok(self.state.lock().await.deleting_mounts(worker_id))
    }

    async fn load_restore_snapshot(&self, worker_id: &str) -> Result<RestoreSnapshot> {
        self.check_available()?;
        let state = self.state.lock().await;
        let pending_mounts = state.pending_mounts(worker_id);
        let vm_ids: BTreeSet<&str> = pending_mounts.iter().map(|m| m.vm_id.as_str()).collect();
        let pending_mount_vms = vm_ids
            .into_iter()
            .filter_map(|id| state.vms.get(id).cloned())
            .collect();
        Ok(RestoreSnapshot {
            running_vms: state.running_vms(worker_id),
            vm_actions: state.active_vm_actions(worker_id),
            deleting_sessions: state.deleting_sessions(),
            pending_mounts,
            pending_mount_vms,
            deleting_mounts: state.deleting_mounts(worker_id),
        })
    }
}
