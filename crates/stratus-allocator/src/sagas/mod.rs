// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocator sagas.
//!
//! | Saga | Operation | Compensation / spawned |
//! |------|-----------|------------------------|
//! | [`allocate_vm::AllocateVmSaga`] | allocate (deadline) | Delete VM on failure or expiry |
//! | [`delete_vm::DeleteVmSaga`] | delete VM | Unmount for attached volumes |
//! | [`delete_session::DeleteSessionSaga`] | delete session | Delete VM per usable VM |
//! | [`mount::MountSaga`] | mount (deadline) | Unmount on failure or expiry |
//! | [`unmount::UnmountSaga`] | unmount | none |
//!
//! Every step re-derives its own completion from the saga's persisted entity,
//! so a saga rebuilt from the store resumes where the last process stopped.

pub mod allocate_vm;
pub mod delete_session;
pub mod delete_vm;
pub mod mount;
pub mod unmount;

pub use self::allocate_vm::AllocateVmSaga;
pub use self::delete_session::DeleteSessionSaga;
pub use self::delete_vm::DeleteVmSaga;
pub use self::mount::MountSaga;
pub use self::unmount::{UnmountOrigin, UnmountSaga};

use std::time::Duration;

use stratus_core::{Operation, StepResult};

use crate::model::{DynamicMount, Vm};

/// Principal recorded on operations the allocator starts by itself.
pub const ALLOCATOR_PRINCIPAL: &str = "allocator";

/// Re-run the saga at once so the runner re-reads its operation.
///
/// Used when a store write reports the operation was completed concurrently.
pub(crate) const RECHECK: StepResult = StepResult::Restart(Duration::ZERO);

/// Saga timing and feature settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Delay before the first VM readiness poll.
    pub vm_wait_initial_delay: Duration,
    /// Interval between VM readiness polls.
    pub vm_wait_poll_interval: Duration,
    /// Interval between session deletion passes.
    pub session_poll_interval: Duration,
    /// Interval between mount holder pod polls.
    pub pod_poll_interval: Duration,
    /// Deadline of allocate operations.
    pub allocation_timeout: Duration,
    /// Deadline of mount operations.
    pub mount_timeout: Duration,
    /// Activity deadline extension granted by registration and keep-alive.
    pub activity_timeout: Duration,
    /// Whether dynamic mounts are supported.
    pub mounts_enabled: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            vm_wait_initial_delay: Duration::from_secs(5),
            vm_wait_poll_interval: Duration::from_secs(1),
            session_poll_interval: Duration::from_secs(1),
            pod_poll_interval: Duration::from_secs(1),
            allocation_timeout: Duration::from_secs(15 * 60),
            mount_timeout: Duration::from_secs(10 * 60),
            activity_timeout: Duration::from_secs(10 * 60),
            mounts_enabled: true,
        }
    }
}

/// Delete operation for a VM.
pub(crate) fn delete_vm_operation(vm: &Vm) -> Operation {
    Operation::create(
        ALLOCATOR_PRINCIPAL,
        format!("Delete VM {}", vm.id),
        None,
        None,
    )
}

/// Unmount operation for a mount.
pub(crate) fn unmount_operation(mount: &DynamicMount) -> Operation {
    Operation::create(
        ALLOCATOR_PRINCIPAL,
        format!("Unmount {} from VM {}", mount.mount_path, mount.vm_id),
        None,
        None,
    )
}

/// `now + duration`, saturating on overflow.
pub(crate) fn deadline_after(duration: Duration) -> chrono::DateTime<chrono::Utc> {
    let now = chrono::Utc::now();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
