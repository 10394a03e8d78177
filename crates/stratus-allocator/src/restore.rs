// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restore-On-Startup.
//!
//! Rebuilds the sagas this worker owned when it stopped. Every saga is
//! rebuilt from persisted entity state only; steps re-derive what is already
//! done, so resuming mid-saga is safe. All categories come from one store
//! snapshot, so a pending mount is always paired with the VM state it was
//! read with. The scheduler ignores sagas whose operation is already live.

use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};

use stratus_core::{BoxedTask, OperationStatus, SagaScheduler};

use crate::context::AllocationContext;
use crate::error::Result;
use crate::model::{DynamicMount, Vm, VmStatus};
use crate::store::RestoreSnapshot;
use crate::sagas::{
    AllocateVmSaga, DeleteSessionSaga, DeleteVmSaga, MountSaga, UnmountOrigin, UnmountSaga,
    unmount_operation,
};

/// What a restore pass found and submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// RUNNING VMs of this worker.
    pub running_vms: i64,
    /// IDLE VMs of this worker.
    pub cached_vms: i64,
    /// Allocate VM sagas.
    pub allocations: usize,
    /// Delete VM sagas.
    pub vm_deletions: usize,
    /// Delete Session sagas.
    pub session_deletions: usize,
    /// Mount sagas.
    pub mounts: usize,
    /// Unmount sagas.
    pub unmounts: usize,
}

impl RestoreReport {
    /// Total number of rebuilt sagas.
    pub fn sagas(&self) -> usize {
        self.allocations + self.vm_deletions + self.session_deletions + self.mounts + self.unmounts
    }
}

/// Rebuild this worker's unfinished sagas and submit them to `scheduler`.
pub async fn restore(ctx: &AllocationContext, scheduler: &SagaScheduler) -> Result<RestoreReport> {
    let worker_id = ctx.worker_id.as_str();
    let RestoreSnapshot {
        running_vms,
        vm_actions,
        deleting_sessions,
        pending_mounts,
        pending_mount_vms,
        deleting_mounts,
    } = ctx.store.load_restore_snapshot(worker_id).await?;

    let mut report = RestoreReport::default();
    let mut tasks: Vec<BoxedTask> = Vec::new();

    // (a) gauges
    for vm in &running_vms {
        match vm.status {
            VmStatus::Running => report.running_vms += 1,
            VmStatus::Idle => report.cached_vms += 1,
            VmStatus::Allocating | VmStatus::Deleting => {}
        }
    }
    ctx.metrics.set_vm_gauges(report.running_vms, report.cached_vms);

    // (b) VM actions
    for vm in vm_actions {
        match (vm.status, vm.delete_operation_id()) {
            (VmStatus::Allocating, _) => {
                tasks.push(AllocateVmSaga::task(ctx.clone(), vm));
                report.allocations += 1;
            }
            (VmStatus::Deleting, Some(operation_id)) => {
                tasks.push(DeleteVmSaga::task(ctx.clone(), &vm.id, operation_id));
                report.vm_deletions += 1;
            }
            (status, _) => {
                warn!(vm_id = %vm.id, status = %status, "Unexpected VM in active actions, skipping");
            }
        }
    }

    // (c) sessions
    for session in deleting_sessions {
        let Some(operation_id) = session.delete_operation_id.as_deref() else {
            continue;
        };
        let request_id = session.delete_request_id.as_deref().unwrap_or_default();
        tasks.push(DeleteSessionSaga::task(
            ctx.clone(),
            &session.id,
            operation_id,
            request_id,
        ));
        report.session_deletions += 1;
    }

    // (d) mounts
    let (mounts, unmounts) =
        restore_pending_mounts(ctx, pending_mounts, pending_mount_vms).await?;
    report.mounts += mounts.len();
    report.unmounts += unmounts.len();
    tasks.extend(mounts);
    tasks.extend(unmounts);

    for mount in deleting_mounts {
        let Some(operation_id) = mount.unmount_operation_id.as_deref() else {
            warn!(mount_id = %mount.id, "Deleting mount without unmount operation, skipping");
            continue;
        };
        tasks.push(UnmountSaga::task(
            ctx.clone(),
            &mount.id,
            operation_id,
            UnmountOrigin::Restored,
        ));
        report.unmounts += 1;
    }

    let submitted = scheduler.submit_all(tasks);
    info!(
        worker_id = %worker_id,
        running_vms = report.running_vms,
        cached_vms = report.cached_vms,
        allocations = report.allocations,
        vm_deletions = report.vm_deletions,
        session_deletions = report.session_deletions,
        mounts = report.mounts,
        unmounts = report.unmounts,
        submitted,
        "Restore complete"
    );
    Ok(report)
}

/// Mount sagas for mounts whose VM is usable, unmounts for the rest.
async fn restore_pending_mounts(
    ctx: &AllocationContext,
    pending: Vec<DynamicMount>,
    vms: Vec<Vm>,
) -> Result<(Vec<BoxedTask>, Vec<BoxedTask>)> {
    let mut by_vm: BTreeMap<String, Vec<DynamicMount>> = BTreeMap::new();
    for mount in pending {
        by_vm.entry(mount.vm_id.clone()).or_default().push(mount);
    }
    let vms: HashMap<String, Vm> = vms.into_iter().map(|vm| (vm.id.clone(), vm)).collect();

    let mut mounts = Vec::new();
    let mut unmounts = Vec::new();
    for (vm_id, vm_mounts) in by_vm {
        let vm = vms.get(&vm_id).filter(|vm| vm.status != VmStatus::Deleting);
        for mount in vm_mounts {
            match vm {
                Some(vm) => mounts.push(MountSaga::task(ctx.clone(), mount, vm.clone())),
                None => {
                    if let Some(task) = abandon_mount(ctx, &mount).await? {
                        unmounts.push(task);
                    }
                }
            }
        }
    }
    Ok((mounts, unmounts))
}

/// Fail a mount whose VM is gone and build its unmount saga.
async fn abandon_mount(ctx: &AllocationContext, mount: &DynamicMount) -> Result<Option<BoxedTask>> {
    let status = OperationStatus::cancelled("VM removed");
    let unmount_op = unmount_operation(mount);
    let operation_id = match ctx
        .store
        .fail_mount(&mount.id, &mount.mount_operation_id, &status, &unmount_op)
        .await
    {
        Ok(id) => id,
        Err(e) if e.is_already_completed() => ctx.store.begin_unmount(&mount.id, &unmount_op).await?,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    info!(mount_id = %mount.id, vm_id = %mount.vm_id, "VM of pending mount is gone, unmounting");
    Ok(Some(UnmountSaga::task(
        ctx.clone(),
        &mount.id,
        &operation_id,
        UnmountOrigin::MountFailed(status),
    )))
}
