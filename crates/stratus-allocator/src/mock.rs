// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process cluster and identity clients.
//!
//! Used by tests and by embedders without a real cluster. Results can be
//! scripted per call and every side effect is counted, so tests can assert
//! that retried steps did not repeat external work.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cluster::{
    AttachedVolume, ClusterCode, ClusterError, ClusterResult, MountHolderManager, VmAllocator,
    VolumeManager,
};
use crate::identity::{IdentityClient, IdentityError, Subject};
use crate::model::{
    ClusterPod, DynamicMount, HolderPod, PodPhase, Vm, Volume, VolumeClaim, VolumeRequest,
};

/// Call counters of [`MockCluster`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterCalls {
    /// `allocate` calls.
    pub allocate: u32,
    /// `get_status` calls.
    pub get_status: u32,
    /// `deallocate` calls.
    pub deallocate: u32,
    /// `allocate_tunnel` calls.
    pub allocate_tunnel: u32,
    /// `delete_tunnel` calls.
    pub delete_tunnel: u32,
    /// `attach_volume` calls.
    pub attach_volume: u32,
    /// `detach_volume` calls.
    pub detach_volume: u32,
    /// `unmount_from_vm` calls.
    pub unmount_from_vm: u32,
    /// `delete_claim` calls.
    pub delete_claim: u32,
    /// `delete_volume` calls.
    pub delete_volume: u32,
    /// `deallocate_mount_holders` calls.
    pub deallocate_mount_holders: u32,
}

#[derive(Debug, Default)]
struct Holder {
    generation: i64,
    mounts: BTreeSet<String>,
}

fn holder_pod_name(vm_id: &str, generation: i64) -> String {
    format!("holder-{vm_id}-{generation}")
}

#[derive(Debug, Default)]
struct ClusterState {
    calls: ClusterCalls,
    allocated: HashSet<String>,
    tunnels: HashSet<String>,
    volumes: HashMap<String, Volume>,
    claims: HashMap<String, VolumeClaim>,
    holders: HashMap<String, Holder>,
    replaced_pods: HashSet<String>,
    pod_phases: HashMap<String, PodPhase>,
    allocate_results: VecDeque<ClusterResult>,
    status_results: VecDeque<ClusterResult>,
    default_status: Option<ClusterResult>,
    deallocate_results: VecDeque<ClusterResult>,
    tunnel_errors: VecDeque<ClusterError>,
    attach_errors: VecDeque<ClusterError>,
    missing_holders: HashSet<String>,
    default_pod_phase: Option<PodPhase>,
}

impl ClusterState {
    /// Move the VM's holder pod to `generation` if that is newer and return
    /// the pod that carries the VM's volumes afterwards.
    fn recreate_holder(&mut self, vm: &Vm, generation: i64) -> HolderPod {
        let holder = self.holders.entry(vm.id.clone()).or_default();
        if generation > holder.generation {
            if holder.generation > 0 {
                self.replaced_pods
                    .insert(holder_pod_name(&vm.id, holder.generation));
            }
            holder.generation = generation;
        }
        HolderPod {
            pod: ClusterPod {
                cluster_id: vm.spec.cluster_id.clone(),
                pod_name: holder_pod_name(&vm.id, holder.generation),
            },
            generation: holder.generation,
        }
    }
}

/// Scriptable in-process cluster.
///
/// Unscripted calls succeed. VMs report `RetryLater` from `get_status` until
/// [`MockCluster::set_default_status`] says otherwise, since readiness normally
/// arrives through VM registration.
#[derive(Debug, Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
}

impl MockCluster {
    /// Create a cluster where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Result of the next `allocate` call.
    pub fn push_allocate_result(&self, result: ClusterResult) {
        self.lock().allocate_results.push_back(result);
    }

    /// Result of the next `get_status` call.
    pub fn push_status_result(&self, result: ClusterResult) {
        self.lock().status_results.push_back(result);
    }

    /// Result of unscripted `get_status` calls.
    pub fn set_default_status(&self, result: ClusterResult) {
        self.lock().default_status = Some(result);
    }

    /// Result of the next `deallocate` call.
    pub fn push_deallocate_result(&self, result: ClusterResult) {
        self.lock().deallocate_results.push_back(result);
    }

    /// Error of the next `allocate_tunnel` call.
    pub fn push_tunnel_error(&self, error: ClusterError) {
        self.lock().tunnel_errors.push_back(error);
    }

    /// Error of the next `attach_volume` call.
    pub fn push_attach_error(&self, error: ClusterError) {
        self.lock().attach_errors.push_back(error);
    }

    /// Make the VM's holder pod disappear: attach and detach report not found.
    pub fn remove_holder(&self, vm_id: &str) {
        self.lock().missing_holders.insert(vm_id.to_string());
    }

    /// Phase reported for one pod.
    pub fn set_pod_phase(&self, pod_name: &str, phase: PodPhase) {
        self.lock().pod_phases.insert(pod_name.to_string(), phase);
    }

    /// Phase reported for pods without an explicit phase.
    pub fn set_default_pod_phase(&self, phase: PodPhase) {
        self.lock().default_pod_phase = Some(phase);
    }

    /// Call counters.
    pub fn calls(&self) -> ClusterCalls {
        self.lock().calls.clone()
    }

    /// Whether the VM's backing resource exists.
    pub fn is_allocated(&self, vm_id: &str) -> bool {
        self.lock().allocated.contains(vm_id)
    }

    /// Whether a tunnel pod exists.
    pub fn has_tunnel(&self, pod_name: &str) -> bool {
        self.lock().tunnels.contains(pod_name)
    }

    /// Whether a volume exists.
    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains_key(name)
    }

    /// Whether a claim exists.
    pub fn has_claim(&self, name: &str) -> bool {
        self.lock().claims.contains_key(name)
    }

    /// Mounts currently attached to the VM's holder pod.
    pub fn attached_mounts(&self, vm_id: &str) -> Vec<String> {
        self.lock()
            .holders
            .get(vm_id)
            .map(|h| h.mounts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current holder pod of the VM.
    pub fn holder_pod(&self, vm_id: &str) -> Option<String> {
        self.lock()
            .holders
            .get(vm_id)
            .filter(|h| h.generation > 0)
            .map(|h| holder_pod_name(vm_id, h.generation))
    }
}

#[async_trait]
impl VmAllocator for MockCluster {
    async fn allocate(&self, vm: &Vm) -> ClusterResult {
        let mut state = self.lock();
        state.calls.allocate += 1;
        let result = match state.allocate_results.pop_front() {
            Some(result) => result,
            None if state.allocated.contains(&vm.id) => ClusterResult::from_code(
                ClusterCode::AlreadyExists,
                format!("VM {} already exists", vm.id),
            ),
            None => ClusterResult::from_code(ClusterCode::Success, ""),
        };
        if result == ClusterResult::Success {
            state.allocated.insert(vm.id.clone());
        }
        result
    }

    async fn get_status(&self, _vm: &Vm) -> ClusterResult {
        let mut state = self.lock();
        state.calls.get_status += 1;
        match state.status_results.pop_front() {
            Some(result) => result,
            None => state
                .default_status
                .clone()
                .unwrap_or_else(|| ClusterResult::RetryLater("VM is starting".to_string())),
        }
    }

    async fn deallocate(&self, vm: &Vm) -> ClusterResult {
        let mut state = self.lock();
        state.calls.deallocate += 1;
        let result = state
            .deallocate_results
            .pop_front()
            .unwrap_or(ClusterResult::Success);
        if result == ClusterResult::Success {
            state.allocated.remove(&vm.id);
        }
        result
    }

    async fn allocate_tunnel(&self, vm: &Vm) -> Result<String, ClusterError> {
        let mut state = self.lock();
        state.calls.allocate_tunnel += 1;
        if let Some(error) = state.tunnel_errors.pop_front() {
            return Err(error);
        }
        let pod_name = format!("tunnel-{}", vm.id);
        state.tunnels.insert(pod_name.clone());
        Ok(pod_name)
    }

    async fn delete_tunnel(&self, _cluster_id: &str, tunnel_pod_name: &str) -> ClusterResult {
        let mut state = self.lock();
        state.calls.delete_tunnel += 1;
        state.tunnels.remove(tunnel_pod_name);
        ClusterResult::Success
    }
}

#[async_trait]
impl VolumeManager for MockCluster {
    async fn create_volume(
        &self,
        _cluster_id: &str,
        name: &str,
        request: &VolumeRequest,
    ) -> Result<Volume, ClusterError> {
        let mut state = self.lock();
        let volume = state
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| Volume {
                name: name.to_string(),
                disk_id: request.disk_id.clone(),
                size_gb: request.size_gb,
            });
        Ok(volume.clone())
    }

    async fn create_claim(
        &self,
        _cluster_id: &str,
        volume: &Volume,
    ) -> Result<VolumeClaim, ClusterError> {
        let mut state = self.lock();
        if !state.volumes.contains_key(&volume.name) {
            return Err(ClusterError::NotFound {
                kind: "volume",
                name: volume.name.clone(),
            });
        }
        let name = format!("claim-{}", volume.name);
        let claim = state
            .claims
            .entry(name.clone())
            .or_insert_with(|| VolumeClaim {
                name,
                volume_name: volume.name.clone(),
            });
        Ok(claim.clone())
    }

    async fn delete_claim(&self, _cluster_id: &str, claim_name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.calls.delete_claim += 1;
        match state.claims.remove(claim_name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind: "claim",
                name: claim_name.to_string(),
            }),
        }
    }

    async fn delete_volume(&self, _cluster_id: &str, volume_name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.calls.delete_volume += 1;
        match state.volumes.remove(volume_name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind: "volume",
                name: volume_name.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MountHolderManager for MockCluster {
    async fn attach_volume(
        &self,
        vm: &Vm,
        mount: &DynamicMount,
        generation: i64,
    ) -> Result<AttachedVolume, ClusterError> {
        let mut state = self.lock();
        state.calls.attach_volume += 1;
        if let Some(error) = state.attach_errors.pop_front() {
            return Err(error);
        }
        if state.missing_holders.contains(&vm.id) {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: format!("holder-{}", vm.id),
            });
        }
        state
            .holders
            .entry(vm.id.clone())
            .or_default()
            .mounts
            .insert(mount.id.clone());
        Ok(AttachedVolume {
            holder: state.recreate_holder(vm, generation),
            mount_name: format!("mount-{}", mount.volume_request.disk_id),
        })
    }

    async fn detach_volume(
        &self,
        vm: &Vm,
        mount: &DynamicMount,
        generation: i64,
    ) -> Result<HolderPod, ClusterError> {
        let mut state = self.lock();
        state.calls.detach_volume += 1;
        if state.missing_holders.contains(&vm.id) {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: format!("holder-{}", vm.id),
            });
        }
        state
            .holders
            .entry(vm.id.clone())
            .or_default()
            .mounts
            .remove(&mount.id);
        Ok(state.recreate_holder(vm, generation))
    }

    async fn check_pod_phase(&self, pod: &ClusterPod) -> Result<PodPhase, ClusterError> {
        let state = self.lock();
        if state.replaced_pods.contains(&pod.pod_name) {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: pod.pod_name.clone(),
            });
        }
        Ok(state
            .pod_phases
            .get(&pod.pod_name)
            .copied()
            .or(state.default_pod_phase)
            .unwrap_or(PodPhase::Running))
    }

    async fn unmount_from_vm(&self, _vm: &Vm, _mount: &DynamicMount) -> Result<(), ClusterError> {
        self.lock().calls.unmount_from_vm += 1;
        Ok(())
    }

    async fn deallocate_mount_holders(&self, vm: &Vm) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.calls.deallocate_mount_holders += 1;
        if let Some(holder) = state.holders.remove(&vm.id).filter(|h| h.generation > 0) {
            state
                .replaced_pods
                .insert(holder_pod_name(&vm.id, holder.generation));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct IdentityState {
    subjects: HashMap<String, Subject>,
    by_key: HashMap<String, String>,
    create_calls: u32,
    remove_calls: u32,
    unavailable: u32,
}

/// In-process identity service.
#[derive(Debug, Default)]
pub struct MockIdentity {
    state: Mutex<IdentityState>,
}

impl MockIdentity {
    /// Create an empty identity service.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `calls` calls with `Unavailable`.
    pub fn inject_unavailable(&self, calls: u32) {
        self.lock().unavailable += calls;
    }

    fn check_available(state: &mut IdentityState) -> Result<(), IdentityError> {
        if state.unavailable > 0 {
            state.unavailable -= 1;
            return Err(IdentityError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    /// Number of live subjects.
    pub fn subject_count(&self) -> usize {
        self.lock().subjects.len()
    }

    /// `(create_subject, remove_subject)` call counts.
    pub fn call_counts(&self) -> (u32, u32) {
        let state = self.lock();
        (state.create_calls, state.remove_calls)
    }
}

#[async_trait]
impl IdentityClient for MockIdentity {
    async fn create_subject(
        &self,
        idempotency_key: &str,
        vm_id: &str,
    ) -> Result<Subject, IdentityError> {
        let mut state = self.lock();
        state.create_calls += 1;
        Self::check_available(&mut state)?;
        if let Some(subject) = state
            .by_key
            .get(idempotency_key)
            .and_then(|id| state.subjects.get(id))
        {
            return Ok(subject.clone());
        }
        let subject = Subject {
            id: format!("subject-{}", uuid::Uuid::new_v4()),
            name: vm_id.to_string(),
        };
        state
            .by_key
            .insert(idempotency_key.to_string(), subject.id.clone());
        state.subjects.insert(subject.id.clone(), subject.clone());
        Ok(subject)
    }

    async fn find_subject(&self, subject_id: &str) -> Result<Option<Subject>, IdentityError> {
        let mut state = self.lock();
        Self::check_available(&mut state)?;
        Ok(state.subjects.get(subject_id).cloned())
    }

    async fn remove_subject(&self, subject_id: &str) -> Result<(), IdentityError> {
        let mut state = self.lock();
        state.remove_calls += 1;
        Self::check_available(&mut state)?;
        state.subjects.remove(subject_id);
        Ok(())
    }
}
