// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that deletes expired VMs.
//!
//! A RUNNING VM expires when its activity deadline passes without a
//! keep-alive; an IDLE VM expires when its idle deadline passes. Each pass
//! moves a batch of expired VMs to DELETING and submits their Delete VM sagas.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stratus_core::SagaScheduler;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::AllocationContext;
use crate::error::Result;
use crate::model::VmStatus;
use crate::sagas::{DeleteVmSaga, delete_vm_operation};

/// Request ID recorded on deletions started by the collector.
pub const GC_REQUEST_ID: &str = "gc";

/// Configuration for the VM garbage collector.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often to look for expired VMs.
    pub poll_interval: Duration,
    /// Maximum VMs handled per pass.
    pub batch_size: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 50,
        }
    }
}

/// Background worker that deletes expired VMs.
pub struct VmGarbageCollector {
    ctx: AllocationContext,
    scheduler: SagaScheduler,
    config: GcConfig,
    shutdown: Arc<Notify>,
}

impl VmGarbageCollector {
    /// Create a new collector.
    pub fn new(ctx: AllocationContext, scheduler: SagaScheduler, config: GcConfig) -> Self {
        Self {
            ctx,
            scheduler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the collector loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "VM garbage collector started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("VM garbage collector received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.collect_once().await {
                        error!(error = %e, "Failed to collect expired VMs");
                    }
                }
            }
        }

        info!("VM garbage collector stopped");
    }

    /// Start deletion of one batch of expired VMs.
    ///
    /// Returns the number of Delete VM sagas submitted.
    pub async fn collect_once(&self) -> Result<usize> {
        let expired = self
            .ctx
            .store
            .list_expired_vms(Utc::now(), self.config.batch_size)
            .await?;
        if expired.is_empty() {
            debug!("No expired VMs");
            return Ok(0);
        }

        let mut submitted = 0;
        for vm in expired {
            let delete_op = delete_vm_operation(&vm);
            let delete_state = match self
                .ctx
                .store
                .begin_vm_deletion(&vm.id, &delete_op, GC_REQUEST_ID, &self.ctx.worker_id)
                .await
            {
                Ok(state) => state,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(vm_id = %vm.id, error = %e, "Cannot start deletion of expired VM");
                    continue;
                }
            };
            if delete_state.operation_id != delete_op.id {
                continue;
            }

            self.ctx.metrics.vm_retired(vm.status == VmStatus::Idle);
            info!(vm_id = %vm.id, status = %vm.status, "Deleting expired VM");
            if self.scheduler.submit(DeleteVmSaga::task(
                self.ctx.clone(),
                &vm.id,
                &delete_state.operation_id,
            )) {
                submitted += 1;
            }
        }
        Ok(submitted)
    }
}
