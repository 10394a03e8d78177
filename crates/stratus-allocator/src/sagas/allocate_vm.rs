// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocate VM saga.
//!
//! ```text
//! CreateSubject ──► AllocateTunnel ──► AllocateVm ──► WaitVm ─┐
//!                                                      ▲      │ Restart(poll)
//!                                                      └──────┘
//! ```
//!
//! `WaitVm` never finishes by itself: the VM registers through
//! [`crate::service::AllocatorService::register_vm`], which completes the
//! operation, and the runner then takes the completed-outside path.
//!
//! Any failure, expiry or outside cancellation moves the VM to DELETING and
//! hands a [`DeleteVmSaga`] to the scheduler exactly once.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stratus_core::{BoxedTask, Operation, OperationStatus, Saga, SagaError, StepResult};

use super::{DeleteVmSaga, RECHECK, delete_vm_operation};
use crate::cluster::{ClusterError, ClusterResult, FailureKind};
use crate::context::AllocationContext;
use crate::model::Vm;

/// Steps of [`AllocateVmSaga`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateStep {
    /// Create the VM's identity subject.
    CreateSubject,
    /// Create the tunnel agent pod.
    AllocateTunnel,
    /// Create the VM in the cluster.
    AllocateVm,
    /// Poll readiness until the VM registers.
    WaitVm,
}

const STEPS: &[AllocateStep] = &[
    AllocateStep::CreateSubject,
    AllocateStep::AllocateTunnel,
    AllocateStep::AllocateVm,
    AllocateStep::WaitVm,
];

/// Saga that brings an ALLOCATING VM up.
pub struct AllocateVmSaga {
    ctx: AllocationContext,
    vm: Vm,
    waited_initial_delay: bool,
    failed: bool,
    delete_saga: Option<BoxedTask>,
}

impl AllocateVmSaga {
    /// Create the saga for an ALLOCATING VM.
    pub fn new(ctx: AllocationContext, vm: Vm) -> Self {
        Self {
            ctx,
            vm,
            waited_initial_delay: false,
            failed: false,
            delete_saga: None,
        }
    }

    /// Build the saga and wrap it in a runner for the VM's allocate operation.
    pub fn task(ctx: AllocationContext, vm: Vm) -> BoxedTask {
        let operation_id = vm.allocate_operation_id().to_string();
        let runner_ctx = ctx.clone();
        runner_ctx.runner(&operation_id, Self::new(ctx, vm))
    }

    fn operation_id(&self) -> &str {
        self.vm.allocate_operation_id()
    }

    async fn create_subject(&mut self) -> Result<StepResult, SagaError> {
        if self.vm.instance_properties.vm_subject_id.is_some() {
            return Ok(StepResult::AlreadyDone);
        }

        // The VM id doubles as idempotency key, so a retried step gets the same subject.
        let subject = match self
            .ctx
            .clients
            .identity
            .create_subject(&self.vm.id, &self.vm.id)
            .await
        {
            Ok(subject) => subject,
            Err(e) => {
                warn!(vm_id = %self.vm.id, error = %e, "Cannot create VM subject, retrying");
                return Ok(StepResult::restart());
            }
        };
        self.ctx.fail_point("allocate-vm/subject-created")?;

        self.ctx
            .store
            .set_vm_subject_id(&self.vm.id, &subject.id)
            .await?;
        debug!(vm_id = %self.vm.id, subject_id = %subject.id, "VM subject created");
        self.vm.instance_properties.vm_subject_id = Some(subject.id);
        Ok(StepResult::Continue)
    }

    async fn allocate_tunnel(&mut self) -> Result<StepResult, SagaError> {
        if self.vm.spec.tunnel.is_none() || self.vm.instance_properties.tunnel_pod_name.is_some() {
            return Ok(StepResult::AlreadyDone);
        }

        let pod_name = match self.ctx.clients.vms.allocate_tunnel(&self.vm).await {
            Ok(pod_name) => pod_name,
            Err(ClusterError::Unavailable(reason)) => {
                warn!(vm_id = %self.vm.id, reason = %reason, "Cannot allocate tunnel, retrying");
                return Ok(StepResult::restart());
            }
            Err(e) => {
                return self
                    .fail(OperationStatus::invalid_argument(format!(
                        "Cannot allocate tunnel: {e}"
                    )))
                    .await;
            }
        };

        self.ctx.store.set_tunnel_pod(&self.vm.id, &pod_name).await?;
        info!(vm_id = %self.vm.id, tunnel_pod = %pod_name, "Tunnel allocated");
        self.vm.instance_properties.tunnel_pod_name = Some(pod_name);
        Ok(StepResult::Continue)
    }

    async fn allocate_vm(&mut self) -> Result<StepResult, SagaError> {
        if self.vm.allocate_state.allocated_at.is_some() {
            return Ok(StepResult::AlreadyDone);
        }

        match self.ctx.clients.vms.allocate(&self.vm).await {
            ClusterResult::Success => {
                self.ctx.fail_point("allocate-vm/vm-allocated")?;
                let now = chrono::Utc::now();
                self.ctx.store.set_vm_allocated(&self.vm.id, now).await?;
                info!(vm_id = %self.vm.id, "VM allocation accepted by cluster");
                self.vm.allocate_state.allocated_at = Some(now);
                Ok(StepResult::Continue)
            }
            ClusterResult::RetryLater(reason) => {
                debug!(vm_id = %self.vm.id, reason = %reason, "Cluster asked to retry allocation");
                Ok(StepResult::restart())
            }
            ClusterResult::Failed { reason, kind } => {
                let status = match kind {
                    FailureKind::InvalidConfiguration => OperationStatus::invalid_argument(reason),
                    FailureKind::Internal => OperationStatus::internal(reason),
                };
                self.fail(status).await
            }
        }
    }

    async fn wait_vm(&mut self) -> Result<StepResult, SagaError> {
        if !self.waited_initial_delay {
            self.waited_initial_delay = true;
            return Ok(StepResult::Restart(self.ctx.config.vm_wait_initial_delay));
        }

        let poll = StepResult::Restart(self.ctx.config.vm_wait_poll_interval);
        match self.ctx.clients.vms.get_status(&self.vm).await {
            ClusterResult::Success => {
                debug!(vm_id = %self.vm.id, "VM is up, waiting for registration");
                Ok(poll)
            }
            ClusterResult::RetryLater(reason) => {
                debug!(vm_id = %self.vm.id, reason = %reason, "VM not ready yet");
                Ok(poll)
            }
            ClusterResult::Failed { reason, .. } => {
                self.fail(OperationStatus::internal(format!("VM failed to start: {reason}")))
                    .await
            }
        }
    }

    /// Fail the allocation and start VM deletion in one store transaction.
    async fn fail(&mut self, status: OperationStatus) -> Result<StepResult, SagaError> {
        warn!(vm_id = %self.vm.id, status = %status, "Allocation failed");
        let delete_op = delete_vm_operation(&self.vm);
        let result = self
            .ctx
            .store
            .fail_allocation(
                &self.vm.id,
                self.vm.allocate_operation_id(),
                &status,
                &delete_op,
                &self.vm.allocate_state.request_id,
                &self.ctx.worker_id,
            )
            .await;

        match result {
            Ok(delete_state) => {
                self.failed = true;
                self.ctx.metrics.allocation_failed();
                self.delete_saga = Some(DeleteVmSaga::task(
                    self.ctx.clone(),
                    &self.vm.id,
                    &delete_state.operation_id,
                ));
                Ok(StepResult::Finish)
            }
            Err(e) if e.is_already_completed() => Ok(RECHECK),
            Err(e) if e.is_not_found() => {
                // The VM row is gone, so only the operation is left to fail.
                match self
                    .ctx
                    .operations
                    .fail_operation(self.operation_id(), &status)
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

    /// Start VM deletion after the allocation ended without success.
    async fn start_deletion(&mut self) -> Result<(), SagaError> {
        if self.delete_saga.is_some() {
            return Ok(());
        }
        let delete_op = delete_vm_operation(&self.vm);
        let delete_state = match self
            .ctx
            .store
            .begin_vm_deletion(
                &self.vm.id,
                &delete_op,
                &self.vm.allocate_state.request_id,
                &self.ctx.worker_id,
            )
            .await
        {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %self.vm.id, "VM already removed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // An existing delete operation belongs to a saga started elsewhere.
        if delete_state.operation_id == delete_op.id {
            self.delete_saga = Some(DeleteVmSaga::task(
                self.ctx.clone(),
                &self.vm.id,
                &delete_state.operation_id,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Saga for AllocateVmSaga {
    type Step = AllocateStep;

    fn name(&self) -> &'static str {
        "allocate-vm"
    }

    fn steps(&self) -> &'static [AllocateStep] {
        STEPS
    }

    async fn run_step(&mut self, step: AllocateStep) -> Result<StepResult, SagaError> {
        match step {
            AllocateStep::CreateSubject => self.create_subject().await,
            AllocateStep::AllocateTunnel => self.allocate_tunnel().await,
            AllocateStep::AllocateVm => self.allocate_vm().await,
            AllocateStep::WaitVm => self.wait_vm().await,
        }
    }

    async fn on_expired(&mut self) -> Result<(), SagaError> {
        warn!(vm_id = %self.vm.id, "Allocation deadline exceeded, deleting VM");
        self.ctx.metrics.allocation_timed_out();
        self.start_deletion().await
    }

    async fn on_not_found(&mut self) {
        warn!(vm_id = %self.vm.id, "Allocate operation not found");
    }

    async fn on_completed_outside(&mut self, operation: &Operation) -> Result<(), SagaError> {
        if operation.is_failed() {
            info!(
                vm_id = %self.vm.id,
                error = ?operation.error,
                "Allocation cancelled, deleting VM"
            );
            return self.start_deletion().await;
        }
        debug!(vm_id = %self.vm.id, "VM registered");
        Ok(())
    }

    fn notify_finished(&mut self) -> Option<BoxedTask> {
        self.delete_saga.take()
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}
