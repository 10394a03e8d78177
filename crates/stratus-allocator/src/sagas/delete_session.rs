// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delete Session saga.
//!
//! A single polling step: cancel allocations in flight, start deletion of
//! usable VMs, wait until the session has no VMs left and then remove it.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stratus_core::{BoxedTask, OperationStatus, Saga, SagaError, StepResult};

use super::{DeleteVmSaga, delete_vm_operation};
use crate::context::AllocationContext;
use crate::model::{VmStatus, empty_response};

/// Steps of [`DeleteSessionSaga`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSessionStep {
    /// Drain the session's VMs and remove the session.
    DeleteVms,
}

const STEPS: &[DeleteSessionStep] = &[DeleteSessionStep::DeleteVms];

/// Saga that deletes a session and all of its VMs.
pub struct DeleteSessionSaga {
    ctx: AllocationContext,
    session_id: String,
    operation_id: String,
    request_id: String,
    spawned: Vec<BoxedTask>,
}

impl DeleteSessionSaga {
    /// Create the saga for a session and its delete operation.
    pub fn new(
        ctx: AllocationContext,
        session_id: &str,
        operation_id: &str,
        request_id: &str,
    ) -> Self {
        Self {
            ctx,
            session_id: session_id.to_string(),
            operation_id: operation_id.to_string(),
            request_id: request_id.to_string(),
            spawned: Vec::new(),
        }
    }

    /// Build the saga and wrap it in a runner for the delete operation.
    pub fn task(
        ctx: AllocationContext,
        session_id: &str,
        operation_id: &str,
        request_id: &str,
    ) -> BoxedTask {
        let runner_ctx = ctx.clone();
        runner_ctx.runner(
            operation_id,
            Self::new(ctx, session_id, operation_id, request_id),
        )
    }

    async fn delete_vms(&mut self) -> Result<StepResult, SagaError> {
        let vms = self.ctx.store.get_session_vms(&self.session_id).await?;

        if vms.is_empty() {
            return match self
                .ctx
                .store
                .finish_session_deletion(&self.session_id, &self.operation_id, &empty_response())
                .await
            {
                Ok(()) => {
                    info!(session_id = %self.session_id, "Session deleted");
                    Ok(StepResult::Finish)
                }
                Err(e) if e.is_already_completed() => Ok(StepResult::Finish),
                Err(stratus_core::StoreError::InvalidState { .. }) => {
                    // A VM appeared between the listing and the removal.
                    Ok(StepResult::Restart(self.ctx.config.session_poll_interval))
                }
                Err(e) => Err(e.into()),
            };
        }

        for vm in &vms {
            match vm.status {
                VmStatus::Allocating => {
                    let status = OperationStatus::cancelled("session removed");
                    match self
                        .ctx
                        .operations
                        .fail_operation(vm.allocate_operation_id(), &status)
                        .await
                    {
                        Ok(()) => {
                            debug!(session_id = %self.session_id, vm_id = %vm.id, "Allocation cancelled");
                        }
                        Err(e) if e.is_already_completed() || e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                VmStatus::Running | VmStatus::Idle => {
                    let delete_op = delete_vm_operation(vm);
                    let delete_state = match self
                        .ctx
                        .store
                        .begin_vm_deletion(
                            &vm.id,
                            &delete_op,
                            &self.request_id,
                            &self.ctx.worker_id,
                        )
                        .await
                    {
                        Ok(state) => state,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if delete_state.operation_id == delete_op.id {
                        self.ctx.metrics.vm_retired(vm.status == VmStatus::Idle);
                        debug!(session_id = %self.session_id, vm_id = %vm.id, "Deleting session VM");
                        self.spawned.push(DeleteVmSaga::task(
                            self.ctx.clone(),
                            &vm.id,
                            &delete_state.operation_id,
                        ));
                    }
                }
                VmStatus::Deleting => {}
            }
        }

        debug!(
            session_id = %self.session_id,
            remaining = vms.len(),
            "Waiting for session VMs to be deleted"
        );
        Ok(StepResult::Restart(self.ctx.config.session_poll_interval))
    }
}

#[async_trait]
impl Saga for DeleteSessionSaga {
    type Step = DeleteSessionStep;

    fn name(&self) -> &'static str {
        "delete-session"
    }

    fn steps(&self) -> &'static [DeleteSessionStep] {
        STEPS
    }

    async fn run_step(&mut self, step: DeleteSessionStep) -> Result<StepResult, SagaError> {
        match step {
            DeleteSessionStep::DeleteVms => self.delete_vms().await,
        }
    }

    async fn on_not_found(&mut self) {
        warn!(session_id = %self.session_id, operation_id = %self.operation_id, "Session delete operation not found");
    }

    fn take_spawned(&mut self) -> Vec<BoxedTask> {
        std::mem::take(&mut self.spawned)
    }
}
