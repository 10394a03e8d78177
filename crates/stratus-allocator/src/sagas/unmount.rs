// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unmount saga: detach a dynamic disk and release its cluster resources.
//!
//! Runs for requested unmounts, as compensation of a failed mount and for the
//! mounts of a deleted VM. When the VM is gone or being deleted the holder pod
//! steps are skipped; the claim and volume are still released unless another
//! mount shares the claim. A detach recreates the holder pod under a freshly
//! reserved generation and records it on the VM unless a newer one is stored.
//! The operation response carries the mount failure when the unmount
//! compensated a failed mount.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stratus_core::{BoxedTask, OperationStatus, Saga, SagaError, StepResult};

use crate::context::AllocationContext;
use crate::model::{DynamicMount, HolderPod, PodPhase, UnmountResponse, Vm, VmStatus};

/// Why an unmount was started.
#[derive(Debug, Clone, PartialEq)]
pub enum UnmountOrigin {
    /// Requested by a client.
    Requested,
    /// Compensation of a failed or expired mount.
    MountFailed(OperationStatus),
    /// The VM is being deleted.
    VmDeleted,
    /// Resumed on startup; the original reason is not persisted.
    Restored,
}

impl UnmountOrigin {
    /// Status of the mount this unmount compensates, if any.
    pub fn mount_failure(&self) -> Option<&OperationStatus> {
        match self {
            Self::MountFailed(status) => Some(status),
            _ => None,
        }
    }
}

/// Steps of [`UnmountSaga`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountStep {
    /// Load the mount and its VM.
    Load,
    /// Recreate the holder pod without the volume.
    Detach,
    /// Wait for the recreated holder pod.
    WaitPod,
    /// Unmount the volume inside the VM.
    UnmountFromVm,
    /// Check whether other mounts share the claim.
    CheckClaimUsage,
    /// Delete the volume claim.
    DeleteClaim,
    /// Delete the volume.
    DeleteVolume,
    /// Remove the mount row and complete the operation.
    Finish,
}

const STEPS: &[UnmountStep] = &[
    UnmountStep::Load,
    UnmountStep::Detach,
    UnmountStep::WaitPod,
    UnmountStep::UnmountFromVm,
    UnmountStep::CheckClaimUsage,
    UnmountStep::DeleteClaim,
    UnmountStep::DeleteVolume,
    UnmountStep::Finish,
];

#[derive(Debug, Default)]
struct Progress {
    loaded: bool,
    generation: Option<i64>,
    holder_pod: Option<HolderPod>,
    pod_ready: bool,
    unmounted: bool,
    claim_checked: bool,
    claim_shared: bool,
    claim_deleted: bool,
    volume_deleted: bool,
}

/// Saga that removes a DELETING mount.
pub struct UnmountSaga {
    ctx: AllocationContext,
    mount_id: String,
    operation_id: String,
    origin: UnmountOrigin,
    mount: Option<DynamicMount>,
    vm: Option<Vm>,
    progress: Progress,
}

impl UnmountSaga {
    /// Create the saga for a mount and its unmount operation.
    pub fn new(
        ctx: AllocationContext,
        mount_id: &str,
        operation_id: &str,
        origin: UnmountOrigin,
    ) -> Self {
        Self {
            ctx,
            mount_id: mount_id.to_string(),
            operation_id: operation_id.to_string(),
            origin,
            mount: None,
            vm: None,
            progress: Progress::default(),
        }
    }

    /// Build the saga and wrap it in a runner for the unmount operation.
    pub fn task(
        ctx: AllocationContext,
        mount_id: &str,
        operation_id: &str,
        origin: UnmountOrigin,
    ) -> BoxedTask {
        let runner_ctx = ctx.clone();
        runner_ctx.runner(
            operation_id,
            Self::new(ctx, mount_id, operation_id, origin),
        )
    }

    fn response(&self) -> Result<Vec<u8>, SagaError> {
        serde_json::to_vec(&UnmountResponse {
            mount_id: self.mount_id.clone(),
            mount_failure: self.origin.mount_failure().cloned(),
        })
        .map_err(|e| SagaError::Internal(format!("Cannot encode unmount response: {e}")))
    }

    fn mount(&self) -> Result<&DynamicMount, SagaError> {
        self.mount
            .as_ref()
            .ok_or_else(|| SagaError::Internal(format!("mount {} not loaded", self.mount_id)))
    }

    async fn load(&mut self) -> Result<StepResult, SagaError> {
        if self.progress.loaded {
            return Ok(StepResult::AlreadyDone);
        }

        let Some(mount) = self.ctx.store.get_mount(&self.mount_id).await? else {
            debug!(mount_id = %self.mount_id, "Mount already removed");
            return match self
                .ctx
                .operations
                .complete_operation(&self.operation_id, &self.response()?)
                .await
            {
                Ok(()) => Ok(StepResult::Finish),
                Err(e) if e.is_already_completed() => Ok(StepResult::Finish),
                Err(e) => Err(e.into()),
            };
        };

        self.vm = self
            .ctx
            .store
            .get_vm(&mount.vm_id)
            .await?
            .filter(|vm| vm.status != VmStatus::Deleting);
        info!(
            mount_id = %self.mount_id,
            vm_id = %mount.vm_id,
            origin = ?self.origin,
            mount_failure = ?self.origin.mount_failure(),
            vm_present = self.vm.is_some(),
            "Unmounting volume"
        );
        self.mount = Some(mount);
        self.progress.loaded = true;
        Ok(StepResult::Continue)
    }

    async fn detach(&mut self) -> Result<StepResult, SagaError> {
        let Some(vm_id) = self.vm.as_ref().map(|vm| vm.id.clone()) else {
            return Ok(StepResult::AlreadyDone);
        };
        if self.progress.holder_pod.is_some() || self.progress.pod_ready {
            return Ok(StepResult::AlreadyDone);
        }
        let generation = match self.progress.generation {
            Some(generation) => generation,
            None => match self.ctx.store.reserve_mount_pod_generation(&vm_id).await {
                Ok(generation) => {
                    self.progress.generation = Some(generation);
                    generation
                }
                Err(e) if e.is_not_found() => {
                    debug!(mount_id = %self.mount_id, vm_id = %vm_id, "VM removed, skipping detach");
                    self.vm = None;
                    return Ok(StepResult::AlreadyDone);
                }
                Err(e) => return Err(e.into()),
            },
        };
        let Some(vm) = &self.vm else {
            return Ok(StepResult::AlreadyDone);
        };

        match self
            .ctx
            .clients
            .mount_holders
            .detach_volume(vm, self.mount()?, generation)
            .await
        {
            Ok(holder) => {
                debug!(
                    mount_id = %self.mount_id,
                    pod = %holder.pod.pod_name,
                    generation = holder.generation,
                    "Volume detached"
                );
                match self.ctx.store.set_vm_mount_pod(&vm_id, &holder).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(mount_id = %self.mount_id, "Newer holder pod already recorded");
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(mount_id = %self.mount_id, vm_id = %vm_id, "VM removed after detach");
                    }
                    Err(e) => return Err(e.into()),
                }
                self.progress.holder_pod = Some(holder);
            }
            Err(e) if e.is_not_retryable() => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot detach volume, skipping");
                self.progress.pod_ready = true;
            }
            Err(e) => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot detach volume, retrying");
                return Ok(StepResult::restart());
            }
        }
        Ok(StepResult::Continue)
    }

    async fn wait_pod(&mut self) -> Result<StepResult, SagaError> {
        if self.vm.is_none() || self.progress.pod_ready {
            return Ok(StepResult::AlreadyDone);
        }
        let Some(holder) = &self.progress.holder_pod else {
            return Ok(StepResult::AlreadyDone);
        };
        let pod = &holder.pod;

        match self.ctx.clients.mount_holders.check_pod_phase(pod).await {
            Ok(PodPhase::Running) => {}
            Ok(PodPhase::Pending) => {
                return Ok(StepResult::Restart(self.ctx.config.pod_poll_interval));
            }
            Ok(phase) => {
                warn!(mount_id = %self.mount_id, pod = %pod.pod_name, phase = %phase, "Holder pod not running, proceeding");
            }
            Err(e) if e.is_not_found() => {
                warn!(mount_id = %self.mount_id, pod = %pod.pod_name, "Holder pod gone, proceeding");
            }
            Err(e) => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot check holder pod, retrying");
                return Ok(StepResult::restart());
            }
        }
        self.progress.pod_ready = true;
        Ok(StepResult::Continue)
    }

    async fn unmount_from_vm(&mut self) -> Result<StepResult, SagaError> {
        let Some(vm) = &self.vm else {
            return Ok(StepResult::AlreadyDone);
        };
        if self.progress.unmounted {
            return Ok(StepResult::AlreadyDone);
        }

        match self
            .ctx
            .clients
            .mount_holders
            .unmount_from_vm(vm, self.mount()?)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_retryable() => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot unmount inside VM, skipping");
            }
            Err(e) => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot unmount inside VM, retrying");
                return Ok(StepResult::restart());
            }
        }
        self.progress.unmounted = true;
        Ok(StepResult::Continue)
    }

    async fn check_claim_usage(&mut self) -> Result<StepResult, SagaError> {
        if self.progress.claim_checked {
            return Ok(StepResult::AlreadyDone);
        }
        let mount = self.mount()?;
        let Some(claim_name) = mount.volume_claim_name.as_deref() else {
            self.progress.claim_checked = true;
            return Ok(StepResult::AlreadyDone);
        };

        let users = self
            .ctx
            .store
            .count_mounts_for_claim(&mount.cluster_id, claim_name)
            .await?;
        if users > 1 {
            info!(
                mount_id = %self.mount_id,
                claim = %claim_name,
                users,
                "Claim is shared, keeping claim and volume"
            );
            self.progress.claim_shared = true;
        }
        self.progress.claim_checked = true;
        Ok(StepResult::Continue)
    }

    async fn delete_claim(&mut self) -> Result<StepResult, SagaError> {
        if self.progress.claim_shared || self.progress.claim_deleted {
            return Ok(StepResult::AlreadyDone);
        }
        let mount = self.mount()?;
        let Some(claim_name) = mount.volume_claim_name.as_deref() else {
            return Ok(StepResult::AlreadyDone);
        };

        match self
            .ctx
            .clients
            .volumes
            .delete_claim(&mount.cluster_id, claim_name)
            .await
        {
            Ok(()) => debug!(mount_id = %self.mount_id, claim = %claim_name, "Claim deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_not_retryable() => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot delete claim, skipping");
            }
            Err(e) => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot delete claim, retrying");
                return Ok(StepResult::restart());
            }
        }
        self.progress.claim_deleted = true;
        Ok(StepResult::Continue)
    }

    async fn delete_volume(&mut self) -> Result<StepResult, SagaError> {
        if self.progress.claim_shared || self.progress.volume_deleted {
            return Ok(StepResult::AlreadyDone);
        }
        let mount = self.mount()?;
        let Some(volume_name) = mount.volume_name.as_deref() else {
            return Ok(StepResult::AlreadyDone);
        };

        match self
            .ctx
            .clients
            .volumes
            .delete_volume(&mount.cluster_id, volume_name)
            .await
        {
            Ok(()) => debug!(mount_id = %self.mount_id, volume = %volume_name, "Volume deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_not_retryable() => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot delete volume, skipping");
            }
            Err(e) => {
                warn!(mount_id = %self.mount_id, error = %e, "Cannot delete volume, retrying");
                return Ok(StepResult::restart());
            }
        }
        self.progress.volume_deleted = true;
        Ok(StepResult::Continue)
    }

    async fn finish(&mut self) -> Result<StepResult, SagaError> {
        let response = self.response()?;
        match self
            .ctx
            .store
            .finish_unmount(&self.mount_id, &self.operation_id, &response)
            .await
        {
            Ok(()) => {
                info!(
                    mount_id = %self.mount_id,
                    origin = ?self.origin,
                    mount_failure = ?self.origin.mount_failure(),
                    "Volume unmounted"
                );
                Ok(StepResult::Finish)
            }
            Err(e) if e.is_already_completed() => Ok(StepResult::Finish),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Saga for UnmountSaga {
    type Step = UnmountStep;

    fn name(&self) -> &'static str {
        "unmount"
    }

    fn steps(&self) -> &'static [UnmountStep] {
        STEPS
    }

    async fn run_step(&mut self, step: UnmountStep) -> Result<StepResult, SagaError> {
        match step {
            UnmountStep::Load => self.load().await,
            UnmountStep::Detach => self.detach().await,
            UnmountStep::WaitPod => self.wait_pod().await,
            UnmountStep::UnmountFromVm => self.unmount_from_vm().await,
            UnmountStep::CheckClaimUsage => self.check_claim_usage().await,
            UnmountStep::DeleteClaim => self.delete_claim().await,
            UnmountStep::DeleteVolume => self.delete_volume().await,
            UnmountStep::Finish => self.finish().await,
        }
    }

    async fn on_not_found(&mut self) {
        warn!(mount_id = %self.mount_id, operation_id = %self.operation_id, "Unmount operation not found");
    }
}
