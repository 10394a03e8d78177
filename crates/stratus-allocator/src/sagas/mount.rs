// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mount saga: attach a dynamic disk to a running VM.
//!
//! ```text
//! CreateVolume → CreateClaim → PersistVolume → Attach → PersistReady → WaitPod → Complete
//! ```
//!
//! Volume and claim names are persisted before the attach so an unmount can
//! always find what to delete. Attaching replaces the VM's holder pod under a
//! freshly reserved generation; the new pod is persisted together with the
//! mount becoming READY unless a newer generation is already stored.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stratus_core::{BoxedTask, Operation, OperationStatus, Saga, SagaError, StepResult};

use super::{RECHECK, UnmountOrigin, UnmountSaga, unmount_operation};
use crate::cluster::AttachedVolume;
use crate::context::AllocationContext;
use crate::model::{
    DynamicMount, MountResponse, MountState, PodPhase, Vm, Volume, VolumeClaim, VmStatus,
};

/// Steps of [`MountSaga`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStep {
    /// Create the volume.
    CreateVolume,
    /// Create the volume claim.
    CreateClaim,
    /// Persist volume and claim names.
    PersistVolume,
    /// Attach the claim to the VM's holder pod.
    Attach,
    /// Persist the mount as READY.
    PersistReady,
    /// Wait for the holder pod to run.
    WaitPod,
    /// Complete the mount operation.
    Complete,
}

const STEPS: &[MountStep] = &[
    MountStep::CreateVolume,
    MountStep::CreateClaim,
    MountStep::PersistVolume,
    MountStep::Attach,
    MountStep::PersistReady,
    MountStep::WaitPod,
    MountStep::Complete,
];

/// Saga that brings a PENDING mount to READY.
pub struct MountSaga {
    ctx: AllocationContext,
    mount: DynamicMount,
    vm: Vm,
    volume: Option<Volume>,
    claim: Option<VolumeClaim>,
    generation: Option<i64>,
    attached: Option<AttachedVolume>,
    failed: bool,
    unmount_saga: Option<BoxedTask>,
}

impl MountSaga {
    /// Create the saga for a mount of `vm`.
    pub fn new(ctx: AllocationContext, mount: DynamicMount, vm: Vm) -> Self {
        Self {
            ctx,
            mount,
            vm,
            volume: None,
            claim: None,
            generation: None,
            attached: None,
            failed: false,
            unmount_saga: None,
        }
    }

    /// Build the saga and wrap it in a runner for the mount operation.
    pub fn task(ctx: AllocationContext, mount: DynamicMount, vm: Vm) -> BoxedTask {
        let operation_id = mount.mount_operation_id.clone();
        let runner_ctx = ctx.clone();
        runner_ctx.runner(&operation_id, Self::new(ctx, mount, vm))
    }

    async fn create_volume(&mut self) -> Result<StepResult, SagaError> {
        if self.mount.volume_name.is_some() || self.volume.is_some() {
            return Ok(StepResult::AlreadyDone);
        }

        let request = &self.mount.volume_request;
        match self
            .ctx
            .clients
            .volumes
            .create_volume(&self.mount.cluster_id, &request.volume_name(), request)
            .await
        {
            Ok(volume) => {
                debug!(mount_id = %self.mount.id, volume = %volume.name, "Volume created");
                self.volume = Some(volume);
                Ok(StepResult::Continue)
            }
            Err(e) if e.is_not_retryable() => {
                self.fail(OperationStatus::invalid_argument(format!(
                    "Cannot create volume: {e}"
                )))
                .await
            }
            Err(e) => {
                warn!(mount_id = %self.mount.id, error = %e, "Cannot create volume, retrying");
                Ok(StepResult::restart())
            }
        }
    }

    async fn create_claim(&mut self) -> Result<StepResult, SagaError> {
        if self.mount.volume_claim_name.is_some() || self.claim.is_some() {
            return Ok(StepResult::AlreadyDone);
        }
        let Some(volume) = &self.volume else {
            return Err(SagaError::Internal(format!(
                "mount {} has no volume",
                self.mount.id
            )));
        };

        match self
            .ctx
            .clients
            .volumes
            .create_claim(&self.mount.cluster_id, volume)
            .await
        {
            Ok(claim) => {
                debug!(mount_id = %self.mount.id, claim = %claim.name, "Volume claim created");
                self.claim = Some(claim);
                Ok(StepResult::Continue)
            }
            Err(e) if e.is_not_retryable() => {
                self.fail(OperationStatus::invalid_argument(format!(
                    "Cannot create volume claim: {e}"
                )))
                .await
            }
            Err(e) => {
                warn!(mount_id = %self.mount.id, error = %e, "Cannot create volume claim, retrying");
                Ok(StepResult::restart())
            }
        }
    }

    async fn persist_volume(&mut self) -> Result<StepResult, SagaError> {
        if self.mount.volume_claim_name.is_some() {
            return Ok(StepResult::AlreadyDone);
        }
        let (Some(volume), Some(claim)) = (&self.volume, &self.claim) else {
            return Err(SagaError::Internal(format!(
                "mount {} has no volume claim",
                self.mount.id
            )));
        };

        self.ctx
            .store
            .set_mount_volume(&self.mount.id, &volume.name, &claim.name)
            .await?;
        self.mount.volume_name = Some(volume.name.clone());
        self.mount.volume_claim_name = Some(claim.name.clone());
        Ok(StepResult::Continue)
    }

    /// Reload the VM; `Err` carries the status to fail with when it is unusable.
    async fn reload_vm(&mut self) -> Result<Result<(), OperationStatus>, SagaError> {
        match self.ctx.store.get_vm(&self.mount.vm_id).await? {
            None => Ok(Err(OperationStatus::cancelled("VM removed"))),
            Some(vm) if vm.status == VmStatus::Deleting => Ok(Err(
                OperationStatus::failed_precondition("VM is being deleted"),
            )),
            Some(vm) => {
                self.vm = vm;
                Ok(Ok(()))
            }
        }
    }

    async fn attach(&mut self) -> Result<StepResult, SagaError> {
        if self.mount.state == MountState::Ready || self.attached.is_some() {
            return Ok(StepResult::AlreadyDone);
        }
        if let Err(status) = self.reload_vm().await? {
            return self.fail(status).await;
        }
        let generation = match self.generation {
            Some(generation) => generation,
            None => match self
                .ctx
                .store
                .reserve_mount_pod_generation(&self.vm.id)
                .await
            {
                Ok(generation) => {
                    self.generation = Some(generation);
                    generation
                }
                Err(e) if e.is_not_found() => {
                    return self.fail(OperationStatus::cancelled("VM removed")).await;
                }
                Err(e) => return Err(e.into()),
            },
        };

        match self
            .ctx
            .clients
            .mount_holders
            .attach_volume(&self.vm, &self.mount, generation)
            .await
        {
            Ok(attached) => {
                debug!(
                    mount_id = %self.mount.id,
                    pod = %attached.holder.pod.pod_name,
                    generation = attached.holder.generation,
                    mount_name = %attached.mount_name,
                    "Volume attached"
                );
                self.attached = Some(attached);
                Ok(StepResult::Continue)
            }
            Err(e) if e.is_not_retryable() => {
                self.fail(OperationStatus::failed_precondition(format!(
                    "Cannot attach volume: {e}"
                )))
                .await
            }
            Err(e) => {
                warn!(mount_id = %self.mount.id, error = %e, "Cannot attach volume, retrying");
                Ok(StepResult::restart())
            }
        }
    }

    async fn persist_ready(&mut self) -> Result<StepResult, SagaError> {
        if self.mount.state == MountState::Ready {
            return Ok(StepResult::AlreadyDone);
        }
        let Some(attached) = self.attached.take() else {
            return Err(SagaError::Internal(format!(
                "mount {} is not attached",
                self.mount.id
            )));
        };

        self.ctx
            .store
            .set_mount_ready(
                &self.mount.id,
                &self.vm.id,
                &attached.mount_name,
                &attached.holder,
            )
            .await?;
        self.mount.state = MountState::Ready;
        self.mount.mount_name = Some(attached.mount_name);
        Ok(StepResult::Continue)
    }

    /// Poll the holder pod currently recorded on the VM. It may be newer
    /// than the one this mount attached to.
    async fn wait_pod(&mut self) -> Result<StepResult, SagaError> {
        let Some(vm) = self.ctx.store.get_vm(&self.mount.vm_id).await? else {
            return self.fail(OperationStatus::cancelled("VM removed")).await;
        };
        self.vm = vm;
        let Some(pod) = self.vm.mount_holder_pod() else {
            return Err(SagaError::Internal(format!(
                "VM {} has no mount holder pod",
                self.vm.id
            )));
        };

        match self.ctx.clients.mount_holders.check_pod_phase(&pod).await {
            Ok(PodPhase::Running) => Ok(StepResult::Continue),
            Ok(PodPhase::Pending) => {
                debug!(mount_id = %self.mount.id, pod = %pod.pod_name, "Holder pod pending");
                Ok(StepResult::Restart(self.ctx.config.pod_poll_interval))
            }
            Ok(phase) => {
                self.fail(OperationStatus::internal(format!(
                    "Mount holder pod {} is {phase}",
                    pod.pod_name
                )))
                .await
            }
            Err(e) if e.is_not_found() && self.vm.has_pending_holder_change() => {
                debug!(mount_id = %self.mount.id, pod = %pod.pod_name, "Holder pod replaced");
                Ok(StepResult::Restart(self.ctx.config.pod_poll_interval))
            }
            Err(e) if e.is_not_found() => {
                self.fail(OperationStatus::internal(format!(
                    "Mount holder pod {} disappeared",
                    pod.pod_name
                )))
                .await
            }
            Err(e) => {
                warn!(mount_id = %self.mount.id, error = %e, "Cannot check holder pod, retrying");
                Ok(StepResult::restart())
            }
        }
    }

    async fn complete(&mut self) -> Result<StepResult, SagaError> {
        if let Err(status) = self.reload_vm().await? {
            return self.fail(status).await;
        }

        let response = serde_json::to_vec(&MountResponse {
            mount: self.mount.clone(),
        })
        .map_err(|e| SagaError::Internal(format!("Cannot encode mount response: {e}")))?;

        match self
            .ctx
            .operations
            .complete_operation(&self.mount.mount_operation_id, &response)
            .await
        {
            Ok(()) => {
                info!(
                    mount_id = %self.mount.id,
                    vm_id = %self.vm.id,
                    mount_path = %self.mount.mount_path,
                    "Volume mounted"
                );
                Ok(StepResult::Finish)
            }
            Err(e) if e.is_already_completed() => Ok(RECHECK),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail the mount and start the unmount in one store transaction.
    async fn fail(&mut self, status: OperationStatus) -> Result<StepResult, SagaError> {
        warn!(mount_id = %self.mount.id, status = %status, "Mount failed");
        let unmount_op = unmount_operation(&self.mount);
        match self
            .ctx
            .store
            .fail_mount(
                &self.mount.id,
                &self.mount.mount_operation_id,
                &status,
                &unmount_op,
            )
            .await
        {
            Ok(unmount_id) => {
                self.failed = true;
                self.ctx.metrics.mount_failed();
                self.unmount_saga = Some(UnmountSaga::task(
                    self.ctx.clone(),
                    &self.mount.id,
                    &unmount_id,
                    UnmountOrigin::MountFailed(status),
                ));
                Ok(StepResult::Finish)
            }
            Err(e) if e.is_already_completed() => Ok(RECHECK),
            Err(e) if e.is_not_found() => {
                match self
                    .ctx
                    .operations
                    .fail_operation(&self.mount.mount_operation_id, &status)
                    .await
                {
                    Ok(()) => {
                        self.failed = true;
                        Ok(StepResult::Finish)
                    }
                    Err(e) if e.is_already_completed() => Ok(RECHECK),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start the unmount after the mount operation ended without success.
    async fn start_unmount(&mut self, origin: UnmountOrigin) -> Result<(), SagaError> {
        if self.unmount_saga.is_some() {
            return Ok(());
        }
        let unmount_op = unmount_operation(&self.mount);
        let unmount_id = match self
            .ctx
            .store
            .begin_unmount(&self.mount.id, &unmount_op)
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_not_found() => {
                debug!(mount_id = %self.mount.id, "Mount already removed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if unmount_id == unmount_op.id {
            self.unmount_saga = Some(UnmountSaga::task(
                self.ctx.clone(),
                &self.mount.id,
                &unmount_id,
                origin,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Saga for MountSaga {
    type Step = MountStep;

    fn name(&self) -> &'static str {
        "mount"
    }

    fn steps(&self) -> &'static [MountStep] {
        STEPS
    }

    async fn run_step(&mut self, step: MountStep) -> Result<StepResult, SagaError> {
        match step {
            MountStep::CreateVolume => self.create_volume().await,
            MountStep::CreateClaim => self.create_claim().await,
            MountStep::PersistVolume => self.persist_volume().await,
            MountStep::Attach => self.attach().await,
            MountStep::PersistReady => self.persist_ready().await,
            MountStep::WaitPod => self.wait_pod().await,
            MountStep::Complete => self.complete().await,
        }
    }

    async fn on_expired(&mut self) -> Result<(), SagaError> {
        warn!(mount_id = %self.mount.id, "Mount deadline exceeded, unmounting");
        self.ctx.metrics.mount_failed();
        self.start_unmount(UnmountOrigin::MountFailed(
            OperationStatus::deadline_exceeded(),
        ))
        .await
    }

    async fn on_not_found(&mut self) {
        warn!(mount_id = %self.mount.id, "Mount operation not found");
    }

    async fn on_completed_outside(&mut self, operation: &Operation) -> Result<(), SagaError> {
        if let Some(status) = &operation.error {
            info!(mount_id = %self.mount.id, status = %status, "Mount cancelled, unmounting");
            return self
                .start_unmount(UnmountOrigin::MountFailed(status.clone()))
                .await;
        }
        Ok(())
    }

    fn notify_finished(&mut self) -> Option<BoxedTask> {
        self.unmount_saga.take()
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}
