// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delete VM saga.
//!
//! Tears down everything an allocation may have created, in reverse order,
//! then removes the VM row and completes the delete operation in one write.
//! Every step tolerates resources that were never created or are already gone.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stratus_core::{BoxedTask, Saga, SagaError, StepResult};

use super::{UnmountOrigin, UnmountSaga, unmount_operation};
use crate::cluster::ClusterResult;
use crate::context::AllocationContext;
use crate::model::{MountState, Vm, empty_response};

/// Steps of [`DeleteVmSaga`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteVmStep {
    /// Load the VM.
    Start,
    /// Remove the identity subject.
    RemoveSubject,
    /// Delete the tunnel agent pod.
    DeleteTunnel,
    /// Deallocate the VM in the cluster.
    Deallocate,
    /// Delete the mount holder pods.
    DeallocateMountHolders,
    /// Start an unmount for every dynamic mount.
    UnmountVolumes,
    /// Remove the VM row and complete the operation.
    CleanDb,
}

const STEPS: &[DeleteVmStep] = &[
    DeleteVmStep::Start,
    DeleteVmStep::RemoveSubject,
    DeleteVmStep::DeleteTunnel,
    DeleteVmStep::Deallocate,
    DeleteVmStep::DeallocateMountHolders,
    DeleteVmStep::UnmountVolumes,
    DeleteVmStep::CleanDb,
];

#[derive(Debug, Default)]
struct Progress {
    subject_removed: bool,
    tunnel_deleted: bool,
    deallocated: bool,
    holders_deallocated: bool,
    unmounts_started: bool,
}

/// Saga that deletes a DELETING VM.
pub struct DeleteVmSaga {
    ctx: AllocationContext,
    vm_id: String,
    operation_id: String,
    vm: Option<Vm>,
    progress: Progress,
    spawned: Vec<BoxedTask>,
}

impl DeleteVmSaga {
    /// Create the saga for a VM and its delete operation.
    pub fn new(ctx: AllocationContext, vm_id: &str, operation_id: &str) -> Self {
        Self {
            ctx,
            vm_id: vm_id.to_string(),
            operation_id: operation_id.to_string(),
            vm: None,
            progress: Progress::default(),
            spawned: Vec::new(),
        }
    }

    /// Build the saga and wrap it in a runner for the delete operation.
    pub fn task(ctx: AllocationContext, vm_id: &str, operation_id: &str) -> BoxedTask {
        let runner_ctx = ctx.clone();
        runner_ctx.runner(operation_id, Self::new(ctx, vm_id, operation_id))
    }

    fn vm(&self) -> Result<&Vm, SagaError> {
        self.vm
            .as_ref()
            .ok_or_else(|| SagaError::Internal(format!("VM {} not loaded", self.vm_id)))
    }

    async fn start(&mut self) -> Result<StepResult, SagaError> {
        if self.vm.is_some() {
            return Ok(StepResult::AlreadyDone);
        }

        match self.ctx.store.get_vm(&self.vm_id).await? {
            Some(vm) => {
                if vm.delete_operation_id() != Some(self.operation_id.as_str()) {
                    warn!(
                        vm_id = %self.vm_id,
                        operation_id = %self.operation_id,
                        current = ?vm.delete_operation_id(),
                        "VM is deleted by another operation"
                    );
                }
                info!(vm_id = %self.vm_id, status = %vm.status, "Deleting VM");
                self.vm = Some(vm);
                Ok(StepResult::Continue)
            }
            None => {
                debug!(vm_id = %self.vm_id, "VM already removed");
                self.complete_without_vm().await
            }
        }
    }

    async fn complete_without_vm(&mut self) -> Result<StepResult, SagaError> {
        match self
            .ctx
            .operations
            .complete_operation(&self.operation_id, &empty_response())
            .await
        {
            Ok(()) => Ok(StepResult::Finish),
            Err(e) if e.is_already_completed() => Ok(StepResult::Finish),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_subject(&mut self) -> Result<StepResult, SagaError> {
        let Some(subject_id) = self.vm()?.instance_properties.vm_subject_id.clone() else {
            return Ok(StepResult::AlreadyDone);
        };
        if self.progress.subject_removed {
            return Ok(StepResult::AlreadyDone);
        }

        match self.ctx.clients.identity.remove_subject(&subject_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %self.vm_id, subject_id = %subject_id, "Subject already removed");
            }
            Err(e) => {
                warn!(vm_id = %self.vm_id, error = %e, "Cannot remove VM subject, retrying");
                return Ok(StepResult::restart());
            }
        }
        self.progress.subject_removed = true;
        Ok(StepResult::Continue)
    }

    async fn delete_tunnel(&mut self) -> Result<StepResult, SagaError> {
        let vm = self.vm()?;
        let Some(pod_name) = vm.instance_properties.tunnel_pod_name.clone() else {
            return Ok(StepResult::AlreadyDone);
        };
        if self.progress.tunnel_deleted {
            return Ok(StepResult::AlreadyDone);
        }

        let cluster_id = vm.spec.cluster_id.clone();
        match self
            .ctx
            .clients
            .vms
            .delete_tunnel(&cluster_id, &pod_name)
            .await
        {
            ClusterResult::Success => {}
            ClusterResult::RetryLater(reason) => {
                debug!(vm_id = %self.vm_id, reason = %reason, "Tunnel deletion postponed");
                return Ok(StepResult::restart());
            }
            ClusterResult::Failed { reason, .. } => {
                warn!(vm_id = %self.vm_id, tunnel_pod = %pod_name, reason = %reason, "Cannot delete tunnel, skipping");
            }
        }
        self.progress.tunnel_deleted = true;
        Ok(StepResult::Continue)
    }

    async fn deallocate(&mut self) -> Result<StepResult, SagaError> {
        if self.progress.deallocated {
            return Ok(StepResult::AlreadyDone);
        }

        match self.ctx.clients.vms.deallocate(self.vm()?).await {
            ClusterResult::Success => {
                info!(vm_id = %self.vm_id, "VM deallocated");
            }
            ClusterResult::RetryLater(reason) => {
                debug!(vm_id = %self.vm_id, reason = %reason, "Deallocation postponed");
                return Ok(StepResult::restart());
            }
            ClusterResult::Failed { reason, .. } => {
                warn!(vm_id = %self.vm_id, reason = %reason, "Cannot deallocate VM, skipping");
            }
        }
        self.progress.deallocated = true;
        Ok(StepResult::Continue)
    }

    async fn deallocate_mount_holders(&mut self) -> Result<StepResult, SagaError> {
        if !self.ctx.config.mounts_enabled || self.progress.holders_deallocated {
            return Ok(StepResult::AlreadyDone);
        }

        match self
            .ctx
            .clients
            .mount_holders
            .deallocate_mount_holders(self.vm()?)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_retryable() => {
                warn!(vm_id = %self.vm_id, error = %e, "Cannot deallocate mount holders, skipping");
            }
            Err(e) => {
                warn!(vm_id = %self.vm_id, error = %e, "Cannot deallocate mount holders, retrying");
                return Ok(StepResult::restart());
            }
        }
        self.progress.holders_deallocated = true;
        Ok(StepResult::Continue)
    }

    async fn unmount_volumes(&mut self) -> Result<StepResult, SagaError> {
        if !self.ctx.config.mounts_enabled || self.progress.unmounts_started {
            return Ok(StepResult::AlreadyDone);
        }

        let mounts = self.ctx.store.get_mounts_by_vm(&self.vm_id).await?;
        for mount in mounts {
            if mount.state == MountState::Deleting {
                continue;
            }
            let unmount_op = unmount_operation(&mount);
            let operation_id = self.ctx.store.begin_unmount(&mount.id, &unmount_op).await?;
            if operation_id != unmount_op.id {
                continue;
            }
            debug!(vm_id = %self.vm_id, mount_id = %mount.id, "Unmounting volume of deleted VM");
            self.spawned.push(UnmountSaga::task(
                self.ctx.clone(),
                &mount.id,
                &operation_id,
                UnmountOrigin::VmDeleted,
            ));
        }
        self.progress.unmounts_started = true;
        Ok(StepResult::Continue)
    }

    async fn clean_db(&mut self) -> Result<StepResult, SagaError> {
        match self
            .ctx
            .store
            .cleanup_vm(&self.vm_id, &self.operation_id, &empty_response())
            .await
        {
            Ok(()) => {
                self.ctx.metrics.vm_deleted();
                info!(vm_id = %self.vm_id, "VM deleted");
                Ok(StepResult::Finish)
            }
            Err(e) if e.is_already_completed() => Ok(StepResult::Finish),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Saga for DeleteVmSaga {
    type Step = DeleteVmStep;

    fn name(&self) -> &'static str {
        "delete-vm"
    }

    fn steps(&self) -> &'static [DeleteVmStep] {
        STEPS
    }

    async fn run_step(&mut self, step: DeleteVmStep) -> Result<StepResult, SagaError> {
        match step {
            DeleteVmStep::Start => self.start().await,
            DeleteVmStep::RemoveSubject => self.remove_subject().await,
            DeleteVmStep::DeleteTunnel => self.delete_tunnel().await,
            DeleteVmStep::Deallocate => self.deallocate().await,
            DeleteVmStep::DeallocateMountHolders => self.deallocate_mount_holders().await,
            DeleteVmStep::UnmountVolumes => self.unmount_volumes().await,
            DeleteVmStep::CleanDb => self.clean_db().await,
        }
    }

    async fn on_not_found(&mut self) {
        warn!(vm_id = %self.vm_id, operation_id = %self.operation_id, "Delete operation not found");
    }

    fn take_spawned(&mut self) -> Vec<BoxedTask> {
        std::mem::take(&mut self.spawned)
    }
}
