// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL allocator store.
//!
//! Composite writes run in one transaction and lock the domain row with
//! `SELECT ... FOR UPDATE` before touching the operation, so concurrent sagas
//! of the same VM or mount serialize on the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::time::Duration;

use stratus_core::error::{Result, StoreError};
use stratus_core::persistence::postgres as ops;
use stratus_core::{Operation, OperationStatus, OperationStore};

use super::{AllocatorStore, RestoreSnapshot};
use crate::model::{
    AllocateState, CachePolicy, DeleteState, DynamicMount, HolderPod, IdleState,
    InstanceProperties, MountState, RunState, Session, Vm, VmSpec, VmStatus, VolumeRequest,
};

// ============================================================================
// Rows
// ============================================================================

const SESSION_COLUMNS: &str =
    "id, owner, description, idle_timeout_ms, created_at, delete_operation_id, delete_request_id";

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    owner: String,
    description: String,
    idle_timeout_ms: i64,
    created_at: DateTime<Utc>,
    delete_operation_id: Option<String>,
    delete_request_id: Option<String>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        let idle_timeout = Duration::from_millis(u64::try_from(row.idle_timeout_ms).unwrap_or(0));
        Self {
            id: row.id,
            owner: row.owner,
            description: row.description,
            cache_policy: CachePolicy { idle_timeout },
            created_at: row.created_at,
            delete_operation_id: row.delete_operation_id,
            delete_request_id: row.delete_request_id,
        }
    }
}

const VM_COLUMNS: &str = "id, status, spec::text AS spec, \
     alloc_operation_id, alloc_request_id, alloc_worker_id, alloc_started_at, alloc_deadline, \
     allocated_at, delete_operation_id, delete_request_id, delete_worker_id, \
     tunnel_pod_name, mount_pod_name, mount_pod_generation, mount_pod_reserved_generation, \
     vm_subject_id, activity_deadline, idle_since, idle_deadline";

#[derive(Debug, sqlx::FromRow)]
struct VmRow {
    id: String,
    status: String,
    spec: String,
    alloc_operation_id: String,
    alloc_request_id: String,
    alloc_worker_id: String,
    alloc_started_at: DateTime<Utc>,
    alloc_deadline: DateTime<Utc>,
    allocated_at: Option<DateTime<Utc>>,
    delete_operation_id: Option<String>,
    delete_request_id: Option<String>,
    delete_worker_id: Option<String>,
    tunnel_pod_name: Option<String>,
    mount_pod_name: Option<String>,
    mount_pod_generation: i64,
    mount_pod_reserved_generation: i64,
    vm_subject_id: Option<String>,
    activity_deadline: Option<DateTime<Utc>>,
    idle_since: Option<DateTime<Utc>>,
    idle_deadline: Option<DateTime<Utc>>,
}

impl TryFrom<VmRow> for Vm {
    type Error = StoreError;

    fn try_from(row: VmRow) -> Result<Self> {
        let status = VmStatus::parse(&row.status).ok_or_else(|| StoreError::InvalidState {
            kind: "vm",
            id: row.id.clone(),
            state: row.status.clone(),
        })?;
        let spec: VmSpec = serde_json::from_str(&row.spec)?;
        let delete_state = row.delete_operation_id.map(|operation_id| DeleteState {
            operation_id,
            request_id: row.delete_request_id.unwrap_or_default(),
            worker_id: row.delete_worker_id.unwrap_or_default(),
        });
        Ok(Self {
            id: row.id,
            spec,
            status,
            allocate_state: AllocateState {
                operation_id: row.alloc_operation_id,
                request_id: row.alloc_request_id,
                worker_id: row.alloc_worker_id,
                started_at: row.alloc_started_at,
                deadline: row.alloc_deadline,
                allocated_at: row.allocated_at,
            },
            delete_state,
            instance_properties: InstanceProperties {
                tunnel_pod_name: row.tunnel_pod_name,
                mount_pod_name: row.mount_pod_name,
                mount_pod_generation: row.mount_pod_generation,
                mount_pod_reserved_generation: row.mount_pod_reserved_generation,
                vm_subject_id: row.vm_subject_id,
            },
            run_state: RunState {
                activity_deadline: row.activity_deadline,
            },
            idle_state: IdleState {
                idle_since: row.idle_since,
                idle_deadline: row.idle_deadline,
            },
        })
    }
}

const MOUNT_COLUMNS: &str = "id, vm_id, cluster_id, mount_path, volume_request::text AS volume_request, \
     volume_name, volume_claim_name, mount_name, state, worker_id, mount_operation_id, \
     unmount_operation_id";

#[derive(Debug, sqlx::FromRow)]
struct MountRow {
    id: String,
    vm_id: String,
    cluster_id: String,
    mount_path: String,
    volume_request: String,
    volume_name: Option<String>,
    volume_claim_name: Option<String>,
    mount_name: Option<String>,
    state: String,
    worker_id: String,
    mount_operation_id: String,
    unmount_operation_id: Option<String>,
}

impl TryFrom<MountRow> for DynamicMount {
    type Error = StoreError;

    fn try_from(row: MountRow) -> Result<Self> {
        let state = MountState::parse(&row.state).ok_or_else(|| StoreError::InvalidState {
            kind: "mount",
            id: row.id.clone(),
            state: row.state.clone(),
        })?;
        let volume_request: VolumeRequest = serde_json::from_str(&row.volume_request)?;
        Ok(Self {
            id: row.id,
            vm_id: row.vm_id,
            cluster_id: row.cluster_id,
            mount_path: row.mount_path,
            volume_request,
            volume_name: row.volume_name,
            volume_claim_name: row.volume_claim_name,
            mount_name: row.mount_name,
            state,
            worker_id: row.worker_id,
            mount_operation_id: row.mount_operation_id,
            unmount_operation_id: row.unmount_operation_id,
        })
    }
}

fn vms_from_rows(rows: Vec<VmRow>) -> Result<Vec<Vm>> {
    rows.into_iter().map(Vm::try_from).collect()
}

fn mounts_from_rows(rows: Vec<MountRow>) -> Result<Vec<DynamicMount>> {
    rows.into_iter().map(DynamicMount::try_from).collect()
}

fn invalid_state(kind: &'static str, id: &str, state: impl ToString) -> StoreError {
    StoreError::InvalidState {
        kind,
        id: id.to_string(),
        state: state.to_string(),
    }
}

// ============================================================================
// Row helpers
// ============================================================================

async fn select_vm(conn: &mut PgConnection, vm_id: &str, lock: bool) -> Result<Option<Vm>> {
    let suffix = if lock { " FOR UPDATE" } else { "" };
    let row = sqlx::query_as::<_, VmRow>(&format!(
        "SELECT {VM_COLUMNS} FROM vms WHERE id = $1{suffix}"
    ))
    .bind(vm_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Vm::try_from).transpose()
}

async fn lock_vm(conn: &mut PgConnection, vm_id: &str) -> Result<Vm> {
    select_vm(conn, vm_id, true)
        .await?
        .ok_or_else(|| StoreError::not_found("vm", vm_id))
}

async fn select_mount(
    conn: &mut PgConnection,
    mount_id: &str,
    lock: bool,
) -> Result<Option<DynamicMount>> {
    let suffix = if lock { " FOR UPDATE" } else { "" };
    let row = sqlx::query_as::<_, MountRow>(&format!(
        "SELECT {MOUNT_COLUMNS} FROM dynamic_mounts WHERE id = $1{suffix}"
    ))
    .bind(mount_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(DynamicMount::try_from).transpose()
}

async fn lock_mount(conn: &mut PgConnection, mount_id: &str) -> Result<DynamicMount> {
    select_mount(conn, mount_id, true)
        .await?
        .ok_or_else(|| StoreError::not_found("mount", mount_id))
}

async fn ensure_active(conn: &mut PgConnection, operation_id: &str) -> Result<()> {
    match ops::get_operation_for_update(conn, operation_id).await? {
        None => Err(StoreError::not_found("operation", operation_id)),
        Some(op) if op.done => Err(StoreError::AlreadyCompleted(operation_id.to_string())),
        Some(_) => Ok(()),
    }
}

/// Start deletion of a locked VM.
async fn begin_vm_deletion_locked(
    conn: &mut PgConnection,
    vm: &Vm,
    delete_op: &Operation,
    request_id: &str,
    worker_id: &str,
) -> Result<DeleteState> {
    if let Some(existing) = &vm.delete_state {
        return Ok(existing.clone());
    }
    ops::create_operation(conn, delete_op).await?;
    sqlx::query(
        r#"
        UPDATE vms
        SET status = 'DELETING', delete_operation_id = $2, delete_request_id = $3,
            delete_worker_id = $4
        WHERE id = $1
        "#,
    )
    .bind(&vm.id)
    .bind(&delete_op.id)
    .bind(request_id)
    .bind(worker_id)
    .execute(&mut *conn)
    .await?;

    Ok(DeleteState {
        operation_id: delete_op.id.clone(),
        request_id: request_id.to_string(),
        worker_id: worker_id.to_string(),
    })
}

/// Start the unmount of a locked mount.
async fn begin_unmount_locked(
    conn: &mut PgConnection,
    mount: &DynamicMount,
    unmount_op: &Operation,
) -> Result<String> {
    if let Some(existing) = &mount.unmount_operation_id {
        return Ok(existing.clone());
    }
    ops::create_operation(conn, unmount_op).await?;
    sqlx::query(
        r#"
        UPDATE dynamic_mounts
        SET state = 'DELETING', unmount_operation_id = $2
        WHERE id = $1
        "#,
    )
    .bind(&mount.id)
    .bind(&unmount_op.id)
    .execute(&mut *conn)
    .await?;
    Ok(unmount_op.id.clone())
}

/// Record `holder` on the VM unless a newer holder generation is stored.
async fn update_vm_mount_pod(
    conn: &mut PgConnection,
    vm_id: &str,
    holder: &HolderPod,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE vms
        SET mount_pod_name = $2,
            mount_pod_generation = $3,
            mount_pod_reserved_generation = GREATEST(mount_pod_reserved_generation, $3)
        WHERE id = $1 AND mount_pod_generation < $3
        "#,
    )
    .bind(vm_id)
    .bind(&holder.pod.pod_name)
    .bind(holder.generation)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return match select_vm(conn, vm_id, false).await? {
            None => Err(StoreError::not_found("vm", vm_id)),
            Some(_) => Ok(false),
        };
    }
    Ok(true)
}

// ============================================================================
// Restore queries
// ============================================================================

async fn fetch_vms(conn: &mut PgConnection, query: &str, bind: &str) -> Result<Vec<Vm>> {
    let rows = sqlx::query_as::<_, VmRow>(query)
        .bind(bind)
        .fetch_all(&mut *conn)
        .await?;
    vms_from_rows(rows)
}

async fn fetch_mounts(
    conn: &mut PgConnection,
    query: &str,
    bind: &str,
) -> Result<Vec<DynamicMount>> {
    let rows = sqlx::query_as::<_, MountRow>(query)
        .bind(bind)
        .fetch_all(&mut *conn)
        .await?;
    mounts_from_rows(rows)
}

async fn select_deleting_sessions(conn: &mut PgConnection) -> Result<Vec<Session>> {
    let rows = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE delete_operation_id IS NOT NULL ORDER BY created_at"
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Session::from).collect())
}

async fn select_active_vm_actions(conn: &mut PgConnection, worker_id: &str) -> Result<Vec<Vm>> {
    let query = format!(
        "SELECT {VM_COLUMNS} FROM vms \
         WHERE (status = 'ALLOCATING' AND alloc_worker_id = $1) \
            OR (status = 'DELETING' AND delete_worker_id = $1)"
    );
    fetch_vms(conn, &query, worker_id).await
}

async fn select_running_vms(conn: &mut PgConnection, worker_id: &str) -> Result<Vec<Vm>> {
    let query = format!(
        "SELECT {VM_COLUMNS} FROM vms \
         WHERE status IN ('RUNNING', 'IDLE') AND alloc_worker_id = $1"
    );
    fetch_vms(conn, &query, worker_id).await
}

async fn select_pending_mounts(
    conn: &mut PgConnection,
    worker_id: &str,
) -> Result<Vec<DynamicMount>> {
    let query = format!(
        "SELECT {MOUNT_COLUMNS} FROM dynamic_mounts \
         WHERE state <> 'DELETING' AND worker_id = $1 \
         AND EXISTS (SELECT 1 FROM operations o \
                     WHERE o.id = mount_operation_id AND NOT o.done)"
    );
    fetch_mounts(conn, &query, worker_id).await
}

async fn select_deleting_mounts(
    conn: &mut PgConnection,
    worker_id: &str,
) -> Result<Vec<DynamicMount>> {
    let query = format!(
        "SELECT {MOUNT_COLUMNS} FROM dynamic_mounts \
         WHERE state = 'DELETING' AND worker_id = $1"
    );
    fetch_mounts(conn, &query, worker_id).await
}

async fn select_vms_by_ids(conn: &mut PgConnection, vm_ids: &[String]) -> Result<Vec<Vm>> {
    let rows = sqlx::query_as::<_, VmRow>(&format!(
        "SELECT {VM_COLUMNS} FROM vms WHERE id = ANY($1)"
    ))
    .bind(vm_ids)
    .fetch_all(&mut *conn)
    .await?;
    vms_from_rows(rows)
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed allocator store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply core and allocator migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> crate::error::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::migrations::run(&pool).await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_vms(&self, query: &str, bind: &str) -> Result<Vec<Vm>> {
        let mut conn = self.pool.acquire().await?;
        fetch_vms(&mut conn, query, bind).await
    }

    async fn fetch_mounts(&self, query: &str, bind: &str) -> Result<Vec<DynamicMount>> {
        let mut conn = self.pool.acquire().await?;
        fetch_mounts(&mut conn, query, bind).await
    }

    /// Set a nullable VM column once; repeating the same value is a no-op.
    async fn set_vm_property_once(&self, vm_id: &str, column: &str, value: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE vms SET {column} = $2 WHERE id = $1 AND ({column} IS NULL OR {column} = $2)"
        ))
        .bind(vm_id)
        .bind(value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let mut conn = self.pool.acquire().await?;
            return match select_vm(&mut conn, vm_id, false).await? {
                None => Err(StoreError::not_found("vm", vm_id)),
                Some(_) => Err(invalid_state("vm", vm_id, format!("{column} already set"))),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl OperationStore for PostgresStore {
    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ops::create_operation(&mut conn, operation).await
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        let mut conn = self.pool.acquire().await?;
        ops::get_operation(&mut conn, id).await
    }

    async fn get_by_idempotency_key(&self, owner: &str, key: &str) -> Result<Option<Operation>> {
        let mut conn = self.pool.acquire().await?;
        ops::get_by_idempotency_key(&mut conn, owner, key).await
    }

    async fn update_progress(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ops::update_progress(&mut conn, id).await
    }

    async fn update_meta(&self, id: &str, meta: &[u8]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ops::update_meta(&mut conn, id, meta).await
    }

    async fn complete_operation(&self, id: &str, response: &[u8]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ops::complete_operation(&mut conn, id, response).await
    }

    async fn fail_operation(&self, id: &str, status: &OperationStatus) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ops::fail_operation(&mut conn, id, status).await
    }

    async fn list_incomplete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        ops::list_incomplete_older_than(&mut conn, cutoff, limit).await
    }
}

#[async_trait]
impl AllocatorStore for PostgresStore {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn create_session(&self, session: &Session) -> Result<()> {
        let idle_timeout_ms =
            i64::try_from(session.cache_policy.idle_timeout.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (id, owner, description, idle_timeout_ms, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&session.id)
        .bind(&session.owner)
        .bind(&session.description)
        .bind(idle_timeout_ms)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind: "session",
                id: session.id.clone(),
            });
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn mark_session_deleting(
        &self,
        session_id: &str,
        delete_op: &Operation,
        request_id: &str,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_scalar::<_, Option<String>>(
            "SELECT delete_operation_id FROM sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("session", session_id))?;

        if let Some(existing) = existing {
            return Ok(existing);
        }

        ops::create_operation(&mut tx, delete_op).await?;
        sqlx::query(
            r#"
            UPDATE sessions
            SET delete_operation_id = $2, delete_request_id = $3
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(&delete_op.id)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(delete_op.id.clone())
    }

    async fn list_deleting_sessions(&self) -> Result<Vec<Session>> {
        let mut conn = self.pool.acquire().await?;
        select_deleting_sessions(&mut conn).await
    }

    async fn finish_session_deletion(
        &self,
        session_id: &str,
        operation_id: &str,
        response: &[u8],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let remaining =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM vms WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;
        if remaining > 0 {
            return Err(invalid_state("session", session_id, "has VMs"));
        }

        ops::complete_operation(&mut tx, operation_id, response).await?;
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // VMs
    // ------------------------------------------------------------------

    async fn create_vm(&self, vm: &Vm, allocate_op: &Operation) -> Result<()> {
        let spec = serde_json::to_string(&vm.spec)?;
        let mut tx = self.pool.begin().await?;

        ops::create_operation(&mut tx, allocate_op).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO vms (id, session_id, pool_label, zone, cluster_id, status, spec,
                             alloc_operation_id, alloc_request_id, alloc_worker_id,
                             alloc_started_at, alloc_deadline)
            VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&vm.id)
        .bind(&vm.spec.session_id)
        .bind(&vm.spec.pool_label)
        .bind(&vm.spec.zone)
        .bind(&vm.spec.cluster_id)
        .bind(vm.status.as_str())
        .bind(spec)
        .bind(&vm.allocate_state.operation_id)
        .bind(&vm.allocate_state.request_id)
        .bind(&vm.allocate_state.worker_id)
        .bind(vm.allocate_state.started_at)
        .bind(vm.allocate_state.deadline)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind: "vm",
                id: vm.id.clone(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<Vm>> {
        let mut conn = self.pool.acquire().await?;
        select_vm(&mut conn, vm_id, false).await
    }

    async fn get_session_vms(&self, session_id: &str) -> Result<Vec<Vm>> {
        self.fetch_vms(
            &format!(
                "SELECT {VM_COLUMNS} FROM vms WHERE session_id = $1 ORDER BY alloc_started_at"
            ),
            session_id,
        )
        .await
    }

    async fn set_vm_subject_id(&self, vm_id: &str, subject_id: &str) -> Result<()> {
        self.set_vm_property_once(vm_id, "vm_subject_id", subject_id)
            .await
    }

    async fn set_tunnel_pod(&self, vm_id: &str, tunnel_pod_name: &str) -> Result<()> {
        self.set_vm_property_once(vm_id, "tunnel_pod_name", tunnel_pod_name)
            .await
    }

    async fn reserve_mount_pod_generation(&self, vm_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE vms
            SET mount_pod_reserved_generation = mount_pod_reserved_generation + 1
            WHERE id = $1
            RETURNING mount_pod_reserved_generation
            "#,
        )
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("vm", vm_id))
    }

    async fn set_vm_mount_pod(&self, vm_id: &str, holder: &HolderPod) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        update_vm_mount_pod(&mut conn, vm_id, holder).await
    }

    async fn set_vm_allocated(&self, vm_id: &str, allocated_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE vms
            SET allocated_at = COALESCE(allocated_at, $2)
            WHERE id = $1 AND status = 'ALLOCATING'
            "#,
        )
        .bind(vm_id)
        .bind(allocated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let vm = self.get_vm(vm_id).await?;
            return Err(match vm {
                None => StoreError::not_found("vm", vm_id),
                Some(vm) => invalid_state("vm", vm_id, vm.status),
            });
        }
        Ok(())
    }

    async fn complete_allocation(
        &self,
        vm_id: &str,
        operation_id: &str,
        response: &[u8],
        activity_deadline: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let vm = lock_vm(&mut tx, vm_id).await?;
        if vm.status != VmStatus::Allocating {
            return Err(invalid_state("vm", vm_id, vm.status));
        }
        ops::complete_operation(&mut tx, operation_id, response).await?;
        sqlx::query(
            r#"
            UPDATE vms
            SET status = 'RUNNING', activity_deadline = $2
            WHERE id = $1
            "#,
        )
        .bind(vm_id)
        .bind(activity_deadline)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_allocation(
        &self,
        vm_id: &str,
        operation_id: &str,
        status: &OperationStatus,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState> {
        let mut tx = self.pool.begin().await?;

        let vm = lock_vm(&mut tx, vm_id).await?;
        ensure_active(&mut tx, operation_id).await?;
        let delete_state =
            begin_vm_deletion_locked(&mut tx, &vm, delete_op, request_id, worker_id).await?;
        ops::fail_operation(&mut tx, operation_id, status).await?;

        tx.commit().await?;
        Ok(delete_state)
    }

    async fn begin_vm_deletion(
        &self,
        vm_id: &str,
        delete_op: &Operation,
        request_id: &str,
        worker_id: &str,
    ) -> Result<DeleteState> {
        let mut tx = self.pool.begin().await?;

        let vm = lock_vm(&mut tx, vm_id).await?;
        let delete_state =
            begin_vm_deletion_locked(&mut tx, &vm, delete_op, request_id, worker_id).await?;

        tx.commit().await?;
        Ok(delete_state)
    }

    async fn release_vm(
        &self,
        vm_id: &str,
        idle_since: DateTime<Utc>,
        idle_deadline: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE vms
            SET status = 'IDLE', activity_deadline = NULL, idle_since = $2, idle_deadline = $3
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(vm_id)
        .bind(idle_since)
        .bind(idle_deadline)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let vm = self.get_vm(vm_id).await?;
            return Err(match vm {
                None => StoreError::not_found("vm", vm_id),
                Some(vm) => invalid_state("vm", vm_id, vm.status),
            });
        }
        Ok(())
    }

    async fn acquire_idle_vm(
        &self,
        session_id: &str,
        pool_label: &str,
        zone: &str,
        activity_deadline: DateTime<Utc>,
    ) -> Result<Option<Vm>> {
        let row = sqlx::query_as::<_, VmRow>(&format!(
            r#"
            UPDATE vms
            SET status = 'RUNNING', activity_deadline = $4, idle_since = NULL, idle_deadline = NULL
            WHERE id = (
                SELECT id FROM vms
                WHERE status = 'IDLE' AND session_id = $1 AND pool_label = $2 AND zone = $3
                ORDER BY idle_since
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {VM_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(pool_label)
        .bind(zone)
        .bind(activity_deadline)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Vm::try_from).transpose()
    }

    async fn update_activity_deadline(&self, vm_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vms SET activity_deadline = $2 WHERE id = $1 AND status = 'RUNNING'",
        )
        .bind(vm_id)
        .bind(deadline)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let vm = self.get_vm(vm_id).await?;
            return Err(match vm {
                None => StoreError::not_found("vm", vm_id),
                Some(vm) => invalid_state("vm", vm_id, vm.status),
            });
        }
        Ok(())
    }

    async fn cleanup_vm(&self, vm_id: &str, operation_id: &str, response: &[u8]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        ops::complete_operation(&mut tx, operation_id, response).await?;
        sqlx::query("DELETE FROM vms WHERE id = $1")
            .bind(vm_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_active_vm_actions(&self, worker_id: &str) -> Result<Vec<Vm>> {
        let mut conn = self.pool.acquire().await?;
        select_active_vm_actions(&mut conn, worker_id).await
    }

    async fn load_running_vms(&self, worker_id: &str) -> Result<Vec<Vm>> {
        let mut conn = self.pool.acquire().await?;
        select_running_vms(&mut conn, worker_id).await
    }

    async fn list_expired_vms(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Vm>> {
        let rows = sqlx::query_as::<_, VmRow>(&format!(
            "SELECT {VM_COLUMNS} FROM vms \
             WHERE (status = 'RUNNING' AND activity_deadline <= $1) \
                OR (status = 'IDLE' AND idle_deadline <= $1) \
             ORDER BY id LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        vms_from_rows(rows)
    }

    // ------------------------------------------------------------------
    // Dynamic mounts
    // ------------------------------------------------------------------

    async fn create_mount(&self, mount: &DynamicMount, mount_op: &Operation) -> Result<()> {
        let volume_request = serde_json::to_string(&mount.volume_request)?;
        let mut tx = self.pool.begin().await?;

        ops::create_operation(&mut tx, mount_op).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO dynamic_mounts (id, vm_id, cluster_id, mount_path, volume_request,
                                        state, worker_id, mount_operation_id)
            VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&mount.id)
        .bind(&mount.vm_id)
        .bind(&mount.cluster_id)
        .bind(&mount.mount_path)
        .bind(volume_request)
        .bind(mount.state.as_str())
        .bind(&mount.worker_id)
        .bind(&mount.mount_operation_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind: "mount",
                id: mount.id.clone(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_mount(&self, mount_id: &str) -> Result<Option<DynamicMount>> {
        let mut conn = self.pool.acquire().await?;
        select_mount(&mut conn, mount_id, false).await
    }

    async fn get_mounts_by_vm(&self, vm_id: &str) -> Result<Vec<DynamicMount>> {
        self.fetch_mounts(
            &format!("SELECT {MOUNT_COLUMNS} FROM dynamic_mounts WHERE vm_id = $1"),
            vm_id,
        )
        .await
    }

    async fn set_mount_volume(
        &self,
        mount_id: &str,
        volume_name: &str,
        claim_name: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dynamic_mounts
            SET volume_name = $2, volume_claim_name = $3
            WHERE id = $1
              AND ((volume_name IS NULL AND volume_claim_name IS NULL)
                   OR (volume_name = $2 AND volume_claim_name = $3))
            "#,
        )
        .bind(mount_id)
        .bind(volume_name)
        .bind(claim_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.get_mount(mount_id).await? {
                None => StoreError::not_found("mount", mount_id),
                Some(_) => invalid_state("mount", mount_id, "volume already set"),
            });
        }
        Ok(())
    }

    async fn set_mount_ready(
        &self,
        mount_id: &str,
        vm_id: &str,
        mount_name: &str,
        holder: &HolderPod,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mount = lock_mount(&mut tx, mount_id).await?;
        if mount.state != MountState::Pending {
            return Err(invalid_state("mount", mount_id, mount.state));
        }
        lock_vm(&mut tx, vm_id).await?;

        sqlx::query("UPDATE dynamic_mounts SET state = 'READY', mount_name = $2 WHERE id = $1")
            .bind(mount_id)
            .bind(mount_name)
            .execute(&mut *tx)
            .await?;
        update_vm_mount_pod(&mut tx, vm_id, holder).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_mount(
        &self,
        mount_id: &str,
        operation_id: &str,
        status: &OperationStatus,
        unmount_op: &Operation,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        let mount = lock_mount(&mut tx, mount_id).await?;
        ensure_active(&mut tx, operation_id).await?;
        let unmount_id = begin_unmount_locked(&mut tx, &mount, unmount_op).await?;
        ops::fail_operation(&mut tx, operation_id, status).await?;

        tx.commit().await?;
        Ok(unmount_id)
    }

    async fn begin_unmount(&self, mount_id: &str, unmount_op: &Operation) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        let mount = lock_mount(&mut tx, mount_id).await?;
        let unmount_id = begin_unmount_locked(&mut tx, &mount, unmount_op).await?;

        tx.commit().await?;
        Ok(unmount_id)
    }

    async fn count_mounts_for_claim(&self, cluster_id: &str, claim_name: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM dynamic_mounts WHERE cluster_id = $1 AND volume_claim_name = $2",
        )
        .bind(cluster_id)
        .bind(claim_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn finish_unmount(
        &self,
        mount_id: &str,
        operation_id: &str,
        response: &[u8],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        ops::complete_operation(&mut tx, operation_id, response).await?;
        sqlx::query("DELETE FROM dynamic_mounts WHERE id = $1")
            .bind(mount_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_pending_mounts(&self, worker_id: &str) -> Result<Vec<DynamicMount>> {
        let mut conn = self.pool.acquire().await?;
        select_pending_mounts(&mut conn, worker_id).await
    }

    async fn load_deleting_mounts(&self, worker_id: &str) -> Result<Vec<DynamicMount>> {
        let mut conn = self.pool.acquire().await?;
        select_deleting_mounts(&mut conn, worker_id).await
    }

    async fn load_restore_snapshot(&self, worker_id: &str) -> Result<RestoreSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let running_vms = select_running_vms(&mut tx, worker_id).await?;
        let vm_actions = select_active_vm_actions(&mut tx, worker_id).await?;
        let deleting_sessions = select_deleting_sessions(&mut tx).await?;
        let pending_mounts = select_pending_mounts(&mut tx, worker_id).await?;
        let deleting_mounts = select_deleting_mounts(&mut tx, worker_id).await?;

        let mut vm_ids: Vec<String> = pending_mounts.iter().map(|m| m.vm_id.clone()).collect();
        vm_ids.sort();
        vm_ids.dedup();
        let pending_mount_vms = select_vms_by_ids(&mut tx, &vm_ids).await?;

        tx.commit().await?;
        Ok(RestoreSnapshot {
            running_vms,
            vm_actions,
            deleting_sessions,
            pending_mounts,
            pending_mount_vms,
            deleting_mounts,
        })
    }
}
