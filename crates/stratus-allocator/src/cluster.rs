// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster scheduler client contracts.
//!
//! Sagas never talk to the cluster API directly. They call these traits and
//! classify the outcome:
//!
//! | Outcome | Saga reaction |
//! |---------|---------------|
//! | [`ClusterResult::Success`] | proceed |
//! | [`ClusterResult::RetryLater`], [`ClusterError::Unavailable`] | `Restart` |
//! | [`ClusterResult::Failed`] | fail the operation (allocation) or proceed (cleanup) |
//! | [`ClusterError::is_not_retryable`] | permanent; fail (mount) or proceed (cleanup) |

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::model::{
    ClusterPod, DynamicMount, HolderPod, PodPhase, Vm, Volume, VolumeClaim, VolumeRequest,
};

/// Why a cluster call failed permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The request itself is invalid (unknown pool, bad spec).
    InvalidConfiguration,
    /// The cluster failed internally.
    Internal,
}

/// Raw status code of a cluster call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCode {
    /// The call succeeded.
    Success,
    /// The resource already exists.
    AlreadyExists,
    /// The cluster is busy; try again.
    RetryLater,
    /// The request is invalid.
    InvalidConfiguration,
    /// The cluster failed.
    Failed,
}

/// Tri-state result of an allocate/status/deallocate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterResult {
    /// Done.
    Success,
    /// Not done yet or temporarily impossible.
    RetryLater(String),
    /// Permanently failed.
    Failed {
        /// Reason reported by the cluster.
        reason: String,
        /// Failure classification.
        kind: FailureKind,
    },
}

impl ClusterResult {
    /// Classify a raw cluster status code.
    ///
    /// `AlreadyExists` maps to `Success`: cluster calls are keyed by VM id, so
    /// an existing resource is the one a previous attempt created.
    pub fn from_code(code: ClusterCode, message: impl Into<String>) -> Self {
        match code {
            ClusterCode::Success | ClusterCode::AlreadyExists => Self::Success,
            ClusterCode::RetryLater => Self::RetryLater(message.into()),
            ClusterCode::InvalidConfiguration => Self::Failed {
                reason: message.into(),
                kind: FailureKind::InvalidConfiguration,
            },
            ClusterCode::Failed => Self::Failed {
                reason: message.into(),
                kind: FailureKind::Internal,
            },
        }
    }

    /// Permanent failure caused by an invalid request.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            kind: FailureKind::InvalidConfiguration,
        }
    }

    /// Permanent internal failure.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            kind: FailureKind::Internal,
        }
    }
}

impl fmt::Display for ClusterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::RetryLater(msg) => write!(f, "retry later: {msg}"),
            Self::Failed { reason, kind } => write!(f, "failed ({kind:?}): {reason}"),
        }
    }
}

/// Error of a cluster resource call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The addressed resource does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Resource kind (pod, volume, claim).
        kind: &'static str,
        /// Resource name.
        name: String,
    },

    /// The cluster rejected the request and retrying will not help.
    #[error("Request rejected by cluster: {0}")]
    Rejected(String),

    /// The cluster API is temporarily unavailable.
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Whether retrying the call cannot succeed.
    pub fn is_not_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Rejected(_))
    }

    /// Whether the resource is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A volume attached to a mount holder pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedVolume {
    /// The holder pod that now carries the volume.
    pub holder: HolderPod,
    /// Name of the mount inside the pod.
    pub mount_name: String,
}

/// VM and tunnel lifecycle in the cluster.
#[async_trait]
pub trait VmAllocator: Send + Sync {
    /// Start creating the VM's backing resource.
    async fn allocate(&self, vm: &Vm) -> ClusterResult;

    /// Readiness of the VM: `Success` once ready, `RetryLater` while starting.
    async fn get_status(&self, vm: &Vm) -> ClusterResult;

    /// Remove the VM's backing resource.
    async fn deallocate(&self, vm: &Vm) -> ClusterResult;

    /// Create the tunnel agent pod, returning its name.
    async fn allocate_tunnel(&self, vm: &Vm) -> Result<String, ClusterError>;

    /// Remove a tunnel agent pod.
    async fn delete_tunnel(&self, cluster_id: &str, tunnel_pod_name: &str) -> ClusterResult;
}

/// Volumes and claims in the cluster. Creation calls are idempotent by name.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Create the volume `name`, or return it if it exists.
    async fn create_volume(
        &self,
        cluster_id: &str,
        name: &str,
        request: &VolumeRequest,
    ) -> Result<Volume, ClusterError>;

    /// Create a claim for `volume`, or return the existing one.
    async fn create_claim(&self, cluster_id: &str, volume: &Volume)
    -> Result<VolumeClaim, ClusterError>;

    /// Delete a claim.
    async fn delete_claim(&self, cluster_id: &str, claim_name: &str) -> Result<(), ClusterError>;

    /// Delete a volume.
    async fn delete_volume(&self, cluster_id: &str, volume_name: &str) -> Result<(), ClusterError>;
}

/// Mount holder pods, the pods that carry a VM's dynamic volumes.
///
/// Attach and detach recreate the holder pod as `generation` and delete the
/// VM's older holder pods. When a newer generation already exists the volume
/// change is applied to that pod and it is returned instead.
#[async_trait]
pub trait MountHolderManager: Send + Sync {
    /// Recreate the VM's holder pod with `mount` attached.
    async fn attach_volume(
        &self,
        vm: &Vm,
        mount: &DynamicMount,
        generation: i64,
    ) -> Result<AttachedVolume, ClusterError>;

    /// Recreate the VM's holder pod without `mount`, returning the new pod.
    async fn detach_volume(
        &self,
        vm: &Vm,
        mount: &DynamicMount,
        generation: i64,
    ) -> Result<HolderPod, ClusterError>;

    /// Phase of a pod.
    async fn check_pod_phase(&self, pod: &ClusterPod) -> Result<PodPhase, ClusterError>;

    /// Unmount the volume inside the VM.
    async fn unmount_from_vm(&self, vm: &Vm, mount: &DynamicMount) -> Result<(), ClusterError>;

    /// Delete every holder pod of the VM.
    async fn deallocate_mount_holders(&self, vm: &Vm) -> Result<(), ClusterError>;
}
