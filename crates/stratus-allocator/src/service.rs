// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request facade.
//!
//! [`AllocatorService`] validates requests, writes the initial entity and
//! operation rows, and hands long-running work to sagas. Every long-running
//! call returns the [`Operation`] that tracks it; callers poll it with
//! [`AllocatorService::get_operation`].

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use stratus_core::{IdempotencyKey, Operation, SagaScheduler, StoreError};

use crate::context::AllocationContext;
use crate::error::{Error, Result};
use crate::model::{
    AllocateResponse, CachePolicy, DynamicMount, MountState, Session, TunnelSettings, Vm, VmSpec,
    VmStatus, VolumeRequest, Workload,
};
use crate::sagas::{
    AllocateVmSaga, DeleteSessionSaga, DeleteVmSaga, MountSaga, UnmountOrigin, UnmountSaga,
    deadline_after, delete_vm_operation, unmount_operation,
};

/// Allocate VM request.
#[derive(Debug, Clone, Serialize)]
pub struct AllocateRequest {
    /// Owning session.
    pub session_id: String,
    /// Pool label.
    pub pool_label: String,
    /// Availability zone.
    pub zone: String,
    /// Cluster to allocate in.
    pub cluster_id: String,
    /// Tunnel settings.
    pub tunnel: Option<TunnelSettings>,
    /// Workloads to start.
    pub workloads: Vec<Workload>,
    /// Caller's request ID, for tracing.
    #[serde(skip)]
    pub request_id: String,
    /// Idempotency key, unique per session owner.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

impl AllocateRequest {
    /// Request for a VM without tunnel and workloads.
    pub fn new(
        session_id: impl Into<String>,
        pool_label: impl Into<String>,
        zone: impl Into<String>,
        cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            pool_label: pool_label.into(),
            zone: zone.into(),
            cluster_id: cluster_id.into(),
            tunnel: None,
            workloads: Vec::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: None,
        }
    }

    /// Hash of the fields that define the request, for idempotency checks.
    fn request_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("pool_label", &self.pool_label),
            ("zone", &self.zone),
            ("cluster_id", &self.cluster_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidRequest(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Mount request.
#[derive(Debug, Clone)]
pub struct MountRequest {
    /// VM to mount to.
    pub vm_id: String,
    /// Absolute mount path inside the VM.
    pub mount_path: String,
    /// Requested volume.
    pub volume: VolumeRequest,
}

/// Entry point for allocator requests.
#[derive(Clone)]
pub struct AllocatorService {
    ctx: AllocationContext,
    scheduler: SagaScheduler,
}

impl AllocatorService {
    /// Create a service submitting sagas to `scheduler`.
    pub fn new(ctx: AllocationContext, scheduler: SagaScheduler) -> Self {
        Self { ctx, scheduler }
    }

    /// Shared saga context.
    pub fn context(&self) -> &AllocationContext {
        &self.ctx
    }

    /// Saga scheduler.
    pub fn scheduler(&self) -> &SagaScheduler {
        &self.scheduler
    }

    fn ensure_running(&self) -> Result<()> {
        if self.scheduler.is_shut_down() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Create a session.
    pub async fn create_session(
        &self,
        owner: &str,
        description: &str,
        cache_policy: CachePolicy,
    ) -> Result<Session> {
        self.ensure_running()?;
        if owner.trim().is_empty() {
            return Err(Error::InvalidRequest("owner must not be empty".to_string()));
        }
        let session = Session::new(owner, description, cache_policy);
        self.ctx.store.create_session(&session).await?;
        info!(session_id = %session.id, owner = %owner, "Session created");
        Ok(session)
    }

    /// Get a session.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.ctx
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Delete a session and all of its VMs.
    ///
    /// A second call returns the operation of the deletion already in progress.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str, request_id: &str) -> Result<Operation> {
        self.ensure_running()?;
        let session = self.get_session(session_id).await?;
        let delete_op = Operation::create(
            session.owner.as_str(),
            format!("Delete session {session_id}"),
            None,
            None,
        );

        let operation_id = self
            .ctx
            .store
            .mark_session_deleting(session_id, &delete_op, request_id)
            .await
            .map_err(|e| not_found_as(e, || Error::SessionNotFound(session_id.to_string())))?;

        if operation_id == delete_op.id {
            info!(session_id = %session_id, operation_id = %operation_id, "Deleting session");
            self.scheduler.submit(DeleteSessionSaga::task(
                self.ctx.clone(),
                session_id,
                &operation_id,
                request_id,
            ));
        }
        self.get_operation(&operation_id).await
    }

    // ------------------------------------------------------------------
    // VMs
    // ------------------------------------------------------------------

    /// Allocate a VM, reusing an idle VM of the session and pool if there is one.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, pool = %request.pool_label))]
    pub async fn allocate(&self, request: AllocateRequest) -> Result<Operation> {
        self.ensure_running()?;
        request.validate()?;

        let session = self.get_session(&request.session_id).await?;
        if session.is_deleting() {
            return Err(Error::FailedPrecondition(format!(
                "session {} is being deleted",
                session.id
            )));
        }

        let idempotency_key = match &request.idempotency_key {
            Some(token) => {
                let request_hash = request.request_hash()?;
                if let Some(existing) = self
                    .ctx
                    .store
                    .get_by_idempotency_key(&session.owner, token)
                    .await?
                {
                    return check_idempotent_replay(existing, &request_hash);
                }
                Some(IdempotencyKey {
                    token: token.clone(),
                    request_hash,
                })
            }
            None => None,
        };

        if let Some(op) = self
            .reuse_idle_vm(&session, &request, idempotency_key.clone())
            .await?
        {
            return Ok(op);
        }

        let allocate_op = Operation::with_timeout(
            session.owner.as_str(),
            format!("Allocate VM in pool {}", request.pool_label),
            self.ctx.config.allocation_timeout,
            idempotency_key,
        );
        let deadline = allocate_op
            .deadline
            .unwrap_or_else(|| deadline_after(self.ctx.config.allocation_timeout));
        let spec = VmSpec {
            session_id: session.id.clone(),
            pool_label: request.pool_label,
            zone: request.zone,
            cluster_id: request.cluster_id,
            tunnel: request.tunnel,
            workloads: request.workloads,
        };
        let vm = Vm::new_allocating(
            spec,
            allocate_op.id.as_str(),
            request.request_id,
            self.ctx.worker_id.as_str(),
            deadline,
        );

        match self.ctx.store.create_vm(&vm, &allocate_op).await {
            Ok(()) => {}
            Err(StoreError::IdempotencyConflict { operation_id, .. }) => {
                debug!(operation_id = %operation_id, "Concurrent request with the same idempotency key");
                return self.get_operation(&operation_id).await;
            }
            Err(e) => return Err(e.into()),
        }

        info!(vm_id = %vm.id, operation_id = %allocate_op.id, "Allocating VM");
        self.scheduler.submit(AllocateVmSaga::task(self.ctx.clone(), vm));
        Ok(allocate_op)
    }

    async fn reuse_idle_vm(
        &self,
        session: &Session,
        request: &AllocateRequest,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Option<Operation>> {
        let activity_deadline = deadline_after(self.ctx.config.activity_timeout);
        let Some(vm) = self
            .ctx
            .store
            .acquire_idle_vm(
                &session.id,
                &request.pool_label,
                &request.zone,
                activity_deadline,
            )
            .await?
        else {
            return Ok(None);
        };
        self.ctx.metrics.vm_reused();

        let op = Operation::create(
            session.owner.as_str(),
            format!("Allocate VM in pool {}", request.pool_label),
            None,
            idempotency_key,
        );
        let response = serde_json::to_vec(&AllocateResponse {
            vm_id: vm.id.clone(),
            session_id: session.id.clone(),
            pool_label: vm.spec.pool_label.clone(),
            zone: vm.spec.zone.clone(),
            from_cache: true,
        })?;
        match self.ctx.store.create_operation(&op).await {
            Ok(()) => {}
            Err(StoreError::IdempotencyConflict { operation_id, .. }) => {
                // The acquired VM stays RUNNING and is collected at its activity deadline.
                return self.get_operation(&operation_id).await.map(Some);
            }
            Err(e) => return Err(e.into()),
        }
        self.ctx.store.complete_operation(&op.id, &response).await?;
        info!(vm_id = %vm.id, operation_id = %op.id, "Reused idle VM");
        self.get_operation(&op.id).await.map(Some)
    }

    /// Get a VM.
    pub async fn get_vm(&self, vm_id: &str) -> Result<Vm> {
        self.ctx
            .store
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| Error::VmNotFound(vm_id.to_string()))
    }

    /// Signal that an allocated VM is up; completes its allocate operation.
    ///
    /// Registering a RUNNING VM again is a no-op.
    #[instrument(skip(self))]
    pub async fn register_vm(&self, vm_id: &str) -> Result<()> {
        let vm = self.get_vm(vm_id).await?;
        match vm.status {
            VmStatus::Allocating => {}
            VmStatus::Running => return Ok(()),
            status => {
                return Err(Error::FailedPrecondition(format!(
                    "VM {vm_id} is {status}"
                )));
            }
        }

        let response = serde_json::to_vec(&AllocateResponse {
            vm_id: vm.id.clone(),
            session_id: vm.spec.session_id.clone(),
            pool_label: vm.spec.pool_label.clone(),
            zone: vm.spec.zone.clone(),
            from_cache: false,
        })?;
        let activity_deadline = deadline_after(self.ctx.config.activity_timeout);
        match self
            .ctx
            .store
            .complete_allocation(vm_id, vm.allocate_operation_id(), &response, activity_deadline)
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyCompleted(_)) => {
                return Err(Error::FailedPrecondition(format!(
                    "allocation of VM {vm_id} is no longer active"
                )));
            }
            Err(e) => return Err(map_vm_error(e, vm_id)),
        }

        self.ctx.metrics.vm_started();
        self.ctx.metrics.allocation_completed();
        info!(vm_id = %vm_id, "VM registered");
        Ok(())
    }

    /// Extend the activity deadline of a RUNNING VM.
    pub async fn keep_alive(&self, vm_id: &str) -> Result<chrono::DateTime<Utc>> {
        let deadline = deadline_after(self.ctx.config.activity_timeout);
        self.ctx
            .store
            .update_activity_deadline(vm_id, deadline)
            .await
            .map_err(|e| map_vm_error(e, vm_id))?;
        Ok(deadline)
    }

    /// Release a RUNNING VM back to its session's cache.
    ///
    /// With a zero idle timeout, or when the session is being deleted, the VM
    /// is deleted instead.
    #[instrument(skip(self))]
    pub async fn free(&self, vm_id: &str) -> Result<()> {
        self.ensure_running()?;
        let vm = self.get_vm(vm_id).await?;
        if vm.status != VmStatus::Running {
            return Err(Error::FailedPrecondition(format!(
                "VM {vm_id} is {}",
                vm.status
            )));
        }

        let session = self.ctx.store.get_session(&vm.spec.session_id).await?;
        let idle_timeout = match &session {
            Some(session) if !session.is_deleting() => session.cache_policy.idle_timeout,
            _ => std::time::Duration::ZERO,
        };

        if idle_timeout.is_zero() {
            let delete_op = delete_vm_operation(&vm);
            let delete_state = self
                .ctx
                .store
                .begin_vm_deletion(vm_id, &delete_op, &vm.allocate_state.request_id, &self.ctx.worker_id)
                .await
                .map_err(|e| map_vm_error(e, vm_id))?;
            if delete_state.operation_id == delete_op.id {
                self.ctx.metrics.vm_retired(false);
                info!(vm_id = %vm_id, "VM freed without cache, deleting");
                self.scheduler.submit(DeleteVmSaga::task(
                    self.ctx.clone(),
                    vm_id,
                    &delete_state.operation_id,
                ));
            }
            return Ok(());
        }

        let now = Utc::now();
        self.ctx
            .store
            .release_vm(vm_id, now, deadline_after(idle_timeout))
            .await
            .map_err(|e| map_vm_error(e, vm_id))?;
        self.ctx.metrics.vm_cached();
        info!(vm_id = %vm_id, idle_timeout_secs = idle_timeout.as_secs(), "VM cached");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dynamic mounts
    // ------------------------------------------------------------------

    /// Mount a dynamic disk to a VM.
    #[instrument(skip(self, request), fields(vm_id = %request.vm_id, mount_path = %request.mount_path))]
    pub async fn mount(&self, request: MountRequest) -> Result<Operation> {
        self.ensure_running()?;
        if !self.ctx.config.mounts_enabled {
            return Err(Error::FailedPrecondition(
                "dynamic mounts are disabled".to_string(),
            ));
        }
        if !request.mount_path.starts_with('/') {
            return Err(Error::InvalidRequest(format!(
                "mount path '{}' is not absolute",
                request.mount_path
            )));
        }
        if request.volume.disk_id.trim().is_empty() || request.volume.size_gb == 0 {
            return Err(Error::InvalidRequest(
                "volume needs a disk and a positive size".to_string(),
            ));
        }

        let vm = self.get_vm(&request.vm_id).await?;
        if !vm.is_usable() {
            return Err(Error::FailedPrecondition(format!(
                "VM {} is {}",
                vm.id, vm.status
            )));
        }
        let existing = self.ctx.store.get_mounts_by_vm(&vm.id).await?;
        if existing
            .iter()
            .any(|m| m.mount_path == request.mount_path && m.state != MountState::Deleting)
        {
            return Err(Error::InvalidRequest(format!(
                "{} is already mounted on VM {}",
                request.mount_path, vm.id
            )));
        }

        let owner = self
            .ctx
            .store
            .get_session(&vm.spec.session_id)
            .await?
            .map(|s| s.owner)
            .unwrap_or_else(|| crate::sagas::ALLOCATOR_PRINCIPAL.to_string());
        let mount_op = Operation::with_timeout(
            owner,
            format!("Mount {} to VM {}", request.mount_path, vm.id),
            self.ctx.config.mount_timeout,
            None,
        );
        let mount = DynamicMount::new_pending(
            &vm,
            request.mount_path,
            request.volume,
            self.ctx.worker_id.as_str(),
            mount_op.id.as_str(),
        );
        self.ctx.store.create_mount(&mount, &mount_op).await?;

        info!(mount_id = %mount.id, operation_id = %mount_op.id, "Mounting volume");
        self.scheduler.submit(MountSaga::task(self.ctx.clone(), mount, vm));
        Ok(mount_op)
    }

    /// Get a mount.
    pub async fn get_mount(&self, mount_id: &str) -> Result<DynamicMount> {
        self.ctx
            .store
            .get_mount(mount_id)
            .await?
            .ok_or_else(|| Error::MountNotFound(mount_id.to_string()))
    }

    /// Unmount a READY mount.
    ///
    /// A mount already being unmounted returns its unmount operation.
    #[instrument(skip(self))]
    pub async fn unmount(&self, mount_id: &str) -> Result<Operation> {
        self.ensure_running()?;
        let mount = self.get_mount(mount_id).await?;
        match mount.state {
            MountState::Pending => {
                return Err(Error::FailedPrecondition(format!(
                    "mount {mount_id} is not ready"
                )));
            }
            MountState::Deleting => {
                if let Some(operation_id) = &mount.unmount_operation_id {
                    return self.get_operation(operation_id).await;
                }
            }
            MountState::Ready => {}
        }

        let unmount_op = unmount_operation(&mount);
        let operation_id = self
            .ctx
            .store
            .begin_unmount(mount_id, &unmount_op)
            .await
            .map_err(|e| not_found_as(e, || Error::MountNotFound(mount_id.to_string())))?;
        if operation_id == unmount_op.id {
            info!(mount_id = %mount_id, operation_id = %operation_id, "Unmounting volume");
            self.scheduler.submit(UnmountSaga::task(
                self.ctx.clone(),
                mount_id,
                &operation_id,
                UnmountOrigin::Requested,
            ));
        }
        self.get_operation(&operation_id).await
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Get an operation.
    pub async fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        self.ctx
            .operations
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))
    }
}

fn check_idempotent_replay(existing: Operation, request_hash: &str) -> Result<Operation> {
    let matches = existing
        .idempotency_key
        .as_ref()
        .is_some_and(|key| key.request_hash == request_hash);
    if !matches {
        return Err(Error::InvalidRequest(
            "idempotency key was used with a different request".to_string(),
        ));
    }
    debug!(operation_id = %existing.id, "Idempotent replay");
    Ok(existing)
}

fn not_found_as(e: StoreError, not_found: impl FnOnce() -> Error) -> Error {
    if e.is_not_found() {
        not_found()
    } else {
        e.into()
    }
}

fn map_vm_error(e: StoreError, vm_id: &str) -> Error {
    match e {
        StoreError::NotFound { .. } => Error::VmNotFound(vm_id.to_string()),
        StoreError::InvalidState { state, .. } => {
            Error::FailedPrecondition(format!("VM {vm_id} is {state}"))
        }
        e => e.into(),
    }
}
