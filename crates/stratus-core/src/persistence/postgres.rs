// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL operation store.
//!
//! The free functions take a `&mut PgConnection` so callers can run them inside
//! their own transaction together with domain row updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use super::OperationStore;
use crate::error::{Result, StoreError};
use crate::operation::{IdempotencyKey, Operation, OperationStatus, StatusCode};

/// Columns selected for [`OperationRow`].
pub const OPERATION_COLUMNS: &str = "id, created_by, description, created_at, modified_at, \
     deadline, idempotency_key, request_hash, meta, done, response, error_code, error_message";

/// Row of the `operations` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRow {
    /// Operation ID.
    pub id: String,
    /// Owner principal.
    pub created_by: String,
    /// Description.
    pub description: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub modified_at: DateTime<Utc>,
    /// Optional deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Idempotency key token.
    pub idempotency_key: Option<String>,
    /// Hash of the request bound to the key.
    pub request_hash: Option<String>,
    /// Progress metadata.
    pub meta: Option<Vec<u8>>,
    /// Completion flag.
    pub done: bool,
    /// Response payload.
    pub response: Option<Vec<u8>>,
    /// Error code of a failed operation.
    pub error_code: Option<String>,
    /// Error message of a failed operation.
    pub error_message: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        let idempotency_key = row.idempotency_key.map(|token| IdempotencyKey {
            token,
            request_hash: row.request_hash.unwrap_or_default(),
        });
        let error = row.error_code.map(|code| OperationStatus {
            code: StatusCode::parse(&code),
            message: row.error_message.unwrap_or_default(),
        });
        Self {
            id: row.id,
            created_by: row.created_by,
            description: row.description,
            created_at: row.created_at,
            modified_at: row.modified_at,
            deadline: row.deadline,
            idempotency_key,
            meta: row.meta,
            done: row.done,
            response: row.response,
            error,
        }
    }
}

/// PostgreSQL-backed operation store.
#[derive(Clone)]
pub struct PostgresOperationStore {
    pool: PgPool,
}

impl PostgresOperationStore {
    /// Create a store on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Operation Queries
// ============================================================================

/// Insert an operation.
pub async fn create_operation(conn: &mut PgConnection, operation: &Operation) -> Result<()> {
    let (key, hash) = match &operation.idempotency_key {
        Some(k) => (Some(k.token.as_str()), Some(k.request_hash.as_str())),
        None => (None, None),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO operations (id, created_by, description, created_at, modified_at,
                                deadline, idempotency_key, request_hash, meta, done)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&operation.id)
    .bind(&operation.created_by)
    .bind(&operation.description)
    .bind(operation.created_at)
    .bind(operation.modified_at)
    .bind(operation.deadline)
    .bind(key)
    .bind(hash)
    .bind(operation.meta.as_deref())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    if let Some(key) = key {
        if let Some(existing) = get_by_idempotency_key(conn, &operation.created_by, key).await? {
            return Err(StoreError::IdempotencyConflict {
                owner: operation.created_by.clone(),
                key: key.to_string(),
                operation_id: existing.id,
            });
        }
    }
    Err(StoreError::AlreadyExists {
        kind: "operation",
        id: operation.id.clone(),
    })
}

/// Get an operation by ID.
pub async fn get_operation(conn: &mut PgConnection, id: &str) -> Result<Option<Operation>> {
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(Operation::from))
}

/// Get an operation by ID, locking its row until the transaction ends.
pub async fn get_operation_for_update(
    conn: &mut PgConnection,
    id: &str,
) -> Result<Option<Operation>> {
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(Operation::from))
}

/// Get the operation bound to an owner's idempotency key.
pub async fn get_by_idempotency_key(
    conn: &mut PgConnection,
    owner: &str,
    key: &str,
) -> Result<Option<Operation>> {
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM operations WHERE created_by = $1 AND idempotency_key = $2"
    ))
    .bind(owner)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(Operation::from))
}

/// Map a zero-row update of `id` to NotFound or AlreadyCompleted.
async fn missing_or_done(conn: &mut PgConnection, id: &str) -> StoreError {
    let done = sqlx::query_scalar::<_, bool>("SELECT done FROM operations WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await;
    match done {
        Ok(Some(true)) => StoreError::AlreadyCompleted(id.to_string()),
        Ok(Some(false)) => StoreError::Unavailable(format!("operation '{id}' update lost")),
        Ok(None) => StoreError::not_found("operation", id),
        Err(e) => StoreError::Database(e),
    }
}

/// Touch `modified_at` of an active operation.
pub async fn update_progress(conn: &mut PgConnection, id: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET modified_at = NOW()
        WHERE id = $1 AND done = FALSE
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_done(conn, id).await);
    }
    Ok(())
}

/// Replace the progress metadata of an active operation.
pub async fn update_meta(conn: &mut PgConnection, id: &str, meta: &[u8]) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET meta = $2, modified_at = NOW()
        WHERE id = $1 AND done = FALSE
        "#,
    )
    .bind(id)
    .bind(meta)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_done(conn, id).await);
    }
    Ok(())
}

/// Complete an active operation.
pub async fn complete_operation(conn: &mut PgConnection, id: &str, response: &[u8]) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET done = TRUE, response = $2, modified_at = NOW()
        WHERE id = $1 AND done = FALSE
        "#,
    )
    .bind(id)
    .bind(response)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_done(conn, id).await);
    }
    Ok(())
}

/// Fail an active operation.
pub async fn fail_operation(
    conn: &mut PgConnection,
    id: &str,
    status: &OperationStatus,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET done = TRUE, error_code = $2, error_message = $3, modified_at = NOW()
        WHERE id = $1 AND done = FALSE
        "#,
    )
    .bind(id)
    .bind(status.code.as_str())
    .bind(&status.message)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_done(conn, id).await);
    }
    Ok(())
}

/// Incomplete operations not modified since `cutoff`.
pub async fn list_incomplete_older_than(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Operation>> {
    let rows = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM operations \
         WHERE done = FALSE AND modified_at < $1 \
         ORDER BY modified_at ASC LIMIT $2"
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(Operation::from).collect())
}

#[async_trait]
impl OperationStore for PostgresOperationStore {
    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        create_operation(&mut conn, operation).await
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        let mut conn = self.pool.acquire().await?;
        get_operation(&mut conn, id).await
    }

    async fn get_by_idempotency_key(&self, owner: &str, key: &str) -> Result<Option<Operation>> {
        let mut conn = self.pool.acquire().await?;
        get_by_idempotency_key(&mut conn, owner, key).await
    }

    async fn update_progress(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_progress(&mut conn, id).await
    }

    async fn update_meta(&self, id: &str, meta: &[u8]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_meta(&mut conn, id, meta).await
    }

    async fn complete_operation(&self, id: &str, response: &[u8]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        complete_operation(&mut conn, id, response).await
    }

    async fn fail_operation(&self, id: &str, status: &OperationStatus) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        fail_operation(&mut conn, id, status).await
    }

    async fn list_incomplete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        list_incomplete_older_than(&mut conn, cutoff, limit).await
    }
}
