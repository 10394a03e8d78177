// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: sessions, VMs and dynamic mounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use stratus_core::OperationStatus;

// ============================================================================
// Session
// ============================================================================

/// Cache policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// How long a freed VM stays IDLE before it is collected.
    pub idle_timeout: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
        }
    }
}

/// A group of VMs under one owner and cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session ID.
    pub id: String,
    /// Owner principal.
    pub owner: String,
    /// Description.
    pub description: String,
    /// Cache policy.
    pub cache_policy: CachePolicy,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Delete operation, set once deletion started.
    pub delete_operation_id: Option<String>,
    /// Request that started the deletion.
    pub delete_request_id: Option<String>,
}

impl Session {
    /// Create a new session.
    pub fn new(
        owner: impl Into<String>,
        description: impl Into<String>,
        cache_policy: CachePolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            description: description.into(),
            cache_policy,
            created_at: Utc::now(),
            delete_operation_id: None,
            delete_request_id: None,
        }
    }

    /// Whether deletion started.
    pub fn is_deleting(&self) -> bool {
        self.delete_operation_id.is_some()
    }
}

// ============================================================================
// VM
// ============================================================================

/// VM lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    /// Allocation in progress.
    Allocating,
    /// Allocated and in use.
    Running,
    /// Allocated and cached for reuse.
    Idle,
    /// Deletion in progress. Terminal.
    Deleting,
}

impl VmStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocating => "ALLOCATING",
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Deleting => "DELETING",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALLOCATING" => Some(Self::Allocating),
            "RUNNING" => Some(Self::Running),
            "IDLE" => Some(Self::Idle),
            "DELETING" => Some(Self::Deleting),
            _ => None,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network tunnel settings of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// IPv6 address of the proxy endpoint.
    pub proxy_v6_address: String,
    /// Tunnel index on the node.
    pub tunnel_index: i32,
}

/// A container workload started on the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Workload name.
    pub name: String,
    /// Container image.
    pub image: String,
}

/// Immutable request-time description of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Owning session.
    pub session_id: String,
    /// Pool label.
    pub pool_label: String,
    /// Availability zone.
    pub zone: String,
    /// Cluster that hosts the VM.
    pub cluster_id: String,
    /// Tunnel settings, if the VM needs a tunnel.
    pub tunnel: Option<TunnelSettings>,
    /// Workloads.
    pub workloads: Vec<Workload>,
}

/// Allocation bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateState {
    /// Allocate operation.
    pub operation_id: String,
    /// Request that started the allocation.
    pub request_id: String,
    /// Worker that owns the allocation.
    pub worker_id: String,
    /// When allocation started.
    pub started_at: DateTime<Utc>,
    /// Allocation deadline.
    pub deadline: DateTime<Utc>,
    /// Set once the cluster accepted the allocation.
    pub allocated_at: Option<DateTime<Utc>>,
}

/// Deletion bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteState {
    /// Delete operation.
    pub operation_id: String,
    /// Request that started the deletion.
    pub request_id: String,
    /// Worker that owns the deletion.
    pub worker_id: String,
}

/// Properties set incrementally while the VM is allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProperties {
    /// Tunnel agent pod.
    pub tunnel_pod_name: Option<String>,
    /// Current mount holder pod.
    pub mount_pod_name: Option<String>,
    /// Generation of `mount_pod_name`; 0 before the first holder pod.
    pub mount_pod_generation: i64,
    /// Last holder pod generation handed out to a saga.
    pub mount_pod_reserved_generation: i64,
    /// Identity subject of the VM.
    pub vm_subject_id: Option<String>,
}

/// Running-state bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// The VM is deleted if not kept alive past this point.
    pub activity_deadline: Option<DateTime<Utc>>,
}

/// Idle-state bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleState {
    /// When the VM became idle.
    pub idle_since: Option<DateTime<Utc>>,
    /// The VM is deleted if still idle past this point.
    pub idle_deadline: Option<DateTime<Utc>>,
}

/// A provisioned virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    /// VM ID.
    pub id: String,
    /// Request-time description.
    pub spec: VmSpec,
    /// Lifecycle status.
    pub status: VmStatus,
    /// Allocation bookkeeping.
    pub allocate_state: AllocateState,
    /// Deletion bookkeeping, set once deletion started.
    pub delete_state: Option<DeleteState>,
    /// Incrementally populated properties.
    pub instance_properties: InstanceProperties,
    /// Running-state bookkeeping.
    pub run_state: RunState,
    /// Idle-state bookkeeping.
    pub idle_state: IdleState,
}

impl Vm {
    /// Create a VM in ALLOCATING.
    pub fn new_allocating(
        spec: VmSpec,
        operation_id: impl Into<String>,
        request_id: impl Into<String>,
        worker_id: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("vm-{}", Uuid::new_v4()),
            spec,
            status: VmStatus::Allocating,
            allocate_state: AllocateState {
                operation_id: operation_id.into(),
                request_id: request_id.into(),
                worker_id: worker_id.into(),
                started_at: Utc::now(),
                deadline,
                allocated_at: None,
            },
            delete_state: None,
            instance_properties: InstanceProperties::default(),
            run_state: RunState::default(),
            idle_state: IdleState::default(),
        }
    }

    /// Allocate operation ID.
    pub fn allocate_operation_id(&self) -> &str {
        &self.allocate_state.operation_id
    }

    /// Delete operation ID, if deletion started.
    pub fn delete_operation_id(&self) -> Option<&str> {
        self.delete_state.as_ref().map(|d| d.operation_id.as_str())
    }

    /// Worker that owns the VM's current long-running operation.
    pub fn owner_worker(&self) -> &str {
        match &self.delete_state {
            Some(delete) => &delete.worker_id,
            None => &self.allocate_state.worker_id,
        }
    }

    /// Current mount holder pod, if one was recorded.
    pub fn mount_holder_pod(&self) -> Option<ClusterPod> {
        self.instance_properties
            .mount_pod_name
            .as_ref()
            .map(|pod_name| ClusterPod {
                cluster_id: self.spec.cluster_id.clone(),
                pod_name: pod_name.clone(),
            })
    }

    /// Whether a holder pod change newer than the recorded pod was started.
    pub fn has_pending_holder_change(&self) -> bool {
        self.instance_properties.mount_pod_reserved_generation
            > self.instance_properties.mount_pod_generation
    }

    /// Whether the VM is RUNNING or IDLE.
    pub fn is_usable(&self) -> bool {
        matches!(self.status, VmStatus::Running | VmStatus::Idle)
    }

    /// Whether the VM is past its activity or idle deadline at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            VmStatus::Running => self.run_state.activity_deadline.is_some_and(|d| d <= now),
            VmStatus::Idle => self.idle_state.idle_deadline.is_some_and(|d| d <= now),
            VmStatus::Allocating | VmStatus::Deleting => false,
        }
    }
}

// ============================================================================
// Dynamic mount
// ============================================================================

/// Dynamic mount state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountState {
    /// Mount in progress.
    Pending,
    /// Attached and usable.
    Ready,
    /// Unmount in progress. Terminal.
    Deleting,
}

impl MountState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Deleting => "DELETING",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "READY" => Some(Self::Ready),
            "DELETING" => Some(Self::Deleting),
            _ => None,
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested volume of a dynamic mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Requested name.
    pub name: String,
    /// Size in GB.
    pub size_gb: u64,
    /// Backing disk.
    pub disk_id: String,
}

impl VolumeRequest {
    /// Cluster volume name. Mounts of the same disk share it.
    pub fn volume_name(&self) -> String {
        format!("volume-{}", self.disk_id)
    }
}

/// A disk volume attached to a running VM after allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicMount {
    /// Mount ID.
    pub id: String,
    /// VM the volume is mounted to.
    pub vm_id: String,
    /// Cluster of the VM.
    pub cluster_id: String,
    /// Mount path inside the VM.
    pub mount_path: String,
    /// Requested volume.
    pub volume_request: VolumeRequest,
    /// Volume name, set at most once.
    pub volume_name: Option<String>,
    /// Volume claim name, set at most once.
    pub volume_claim_name: Option<String>,
    /// Mount name inside the holder pod, set at most once.
    pub mount_name: Option<String>,
    /// State.
    pub state: MountState,
    /// Worker that owns the mount operations.
    pub worker_id: String,
    /// Mount operation.
    pub mount_operation_id: String,
    /// Unmount operation, set once unmount started.
    pub unmount_operation_id: Option<String>,
}

impl DynamicMount {
    /// Create a PENDING mount.
    pub fn new_pending(
        vm: &Vm,
        mount_path: impl Into<String>,
        volume_request: VolumeRequest,
        worker_id: impl Into<String>,
        mount_operation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("mount-{}", Uuid::new_v4()),
            vm_id: vm.id.clone(),
            cluster_id: vm.spec.cluster_id.clone(),
            mount_path: mount_path.into(),
            volume_request,
            volume_name: None,
            volume_claim_name: None,
            mount_name: None,
            state: MountState::Pending,
            worker_id: worker_id.into(),
            mount_operation_id: mount_operation_id.into(),
            unmount_operation_id: None,
        }
    }
}

// ============================================================================
// Cluster resources
// ============================================================================

/// A volume in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Backing disk.
    pub disk_id: String,
    /// Size in GB.
    pub size_gb: u64,
}

/// A claim binding a volume to pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    /// Claim name.
    pub name: String,
    /// Bound volume.
    pub volume_name: String,
}

/// A pod in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterPod {
    /// Cluster ID.
    pub cluster_id: String,
    /// Pod name.
    pub pod_name: String,
}

/// A generation of a VM's mount holder pod.
///
/// Every attach or detach recreates the holder pod under a newly reserved
/// generation; the VM row only ever moves to a higher one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderPod {
    /// The pod.
    pub pod: ClusterPod,
    /// Generation the pod was created for.
    pub generation: i64,
}

/// Pod phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Scheduled, containers not started.
    Pending,
    /// Running.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited with failure.
    Failed,
    /// Phase cannot be determined.
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Operation responses
// ============================================================================

/// Response of a completed allocate operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateResponse {
    /// Allocated VM.
    pub vm_id: String,
    /// Owning session.
    pub session_id: String,
    /// Pool label.
    pub pool_label: String,
    /// Zone.
    pub zone: String,
    /// Whether an idle VM was reused.
    pub from_cache: bool,
}

/// Response of a completed mount operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountResponse {
    /// The mount as it became READY.
    pub mount: DynamicMount,
}

/// Response of a completed unmount operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountResponse {
    /// The removed mount.
    pub mount_id: String,
    /// Why the mount failed, when the unmount compensated it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_failure: Option<OperationStatus>,
}

/// Response payload of operations with no result.
pub fn empty_response() -> Vec<u8> {
    b"{}".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn spec() -> VmSpec {
        VmSpec {
            session_id: "s-1".to_string(),
            pool_label: "s".to_string(),
            zone: "zone-a".to_string(),
            cluster_id: "cluster-1".to_string(),
            tunnel: None,
            workloads: Vec::new(),
        }
    }

    #[test]
    fn test_status_names() {
        for status in [
            VmStatus::Allocating,
            VmStatus::Running,
            VmStatus::Idle,
            VmStatus::Deleting,
        ] {
            assert_eq!(VmStatus::parse(status.as_str()), Some(status));
        }
        for state in [MountState::Pending, MountState::Ready, MountState::Deleting] {
            assert_eq!(MountState::parse(state.as_str()), Some(state));
        }
        assert_eq!(VmStatus::parse("GONE"), None);
    }

    #[test]
    fn test_vm_expiration() {
        let now = Utc::now();
        let mut vm = Vm::new_allocating(spec(), "op", "req", "w", now);
        assert!(!vm.is_expired_at(now));

        vm.status = VmStatus::Running;
        vm.run_state.activity_deadline = Some(now - chrono::Duration::seconds(1));
        assert!(vm.is_expired_at(now));

        vm.status = VmStatus::Idle;
        vm.idle_state.idle_deadline = Some(now + chrono::Duration::seconds(60));
        assert!(!vm.is_expired_at(now));
    }

    #[test]
    fn test_owner_worker_follows_delete_state() {
        let mut vm = Vm::new_allocating(spec(), "op", "req", "alloc-worker", Utc::now());
        assert_eq!(vm.owner_worker(), "alloc-worker");
        vm.delete_state = Some(DeleteState {
            operation_id: "del".to_string(),
            request_id: "req".to_string(),
            worker_id: "delete-worker".to_string(),
        });
        assert_eq!(vm.owner_worker(), "delete-worker");
        assert_eq!(vm.delete_operation_id(), Some("del"));
    }

    #[test]
    fn test_mounts_of_one_disk_share_volume_name() {
        let a = VolumeRequest {
            name: "data".to_string(),
            size_gb: 10,
            disk_id: "disk-1".to_string(),
        };
        let b = VolumeRequest {
            name: "other".to_string(),
            ..a.clone()
        };
        assert_eq!(a.volume_name(), b.volume_name());
    }
}
