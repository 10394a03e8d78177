// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation store interfaces and backends.
//!
//! [`OperationStore`] is the only way sagas touch operation records. Backends:
//! - [`postgres::PostgresOperationStore`] for production
//! - [`memory::InMemoryOperationStore`] for tests and embedding
//!
//! [`OperationTable`] holds the backend-independent rules (idempotency keys,
//! immutability of done operations) so in-memory stores of other crates can
//! reuse them.

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryOperationStore;
pub use self::postgres::PostgresOperationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::{Result, StoreError};
use crate::operation::{Operation, OperationStatus};

/// Persistence of operation records.
///
/// Every mutation of a done operation fails with [`StoreError::AlreadyCompleted`].
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a new operation. Fails with [`StoreError::IdempotencyConflict`]
    /// if its owner and idempotency key are bound to another operation.
    async fn create_operation(&self, operation: &Operation) -> Result<()>;

    /// Get an operation by ID.
    async fn get_operation(&self, id: &str) -> Result<Option<Operation>>;

    /// Get the operation bound to an owner's idempotency key.
    async fn get_by_idempotency_key(&self, owner: &str, key: &str) -> Result<Option<Operation>>;

    /// Record that the operation made progress.
    async fn update_progress(&self, id: &str) -> Result<()>;

    /// Replace the operation's progress metadata.
    async fn update_meta(&self, id: &str, meta: &[u8]) -> Result<()>;

    /// Complete the operation with a response payload.
    async fn complete_operation(&self, id: &str, response: &[u8]) -> Result<()>;

    /// Fail the operation.
    async fn fail_operation(&self, id: &str, status: &OperationStatus) -> Result<()>;

    /// Incomplete operations not modified since `cutoff`, oldest first.
    async fn list_incomplete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>>;
}

/// In-memory operation table.
#[derive(Debug, Default, Clone)]
pub struct OperationTable {
    operations: HashMap<String, Operation>,
    idempotency: HashMap<(String, String), String>,
}

impl OperationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new operation.
    pub fn create(&mut self, operation: &Operation) -> Result<()> {
        if self.operations.contains_key(&operation.id) {
            return Err(StoreError::AlreadyExists {
                kind: "operation",
                id: operation.id.clone(),
            });
        }
        if let Some(key) = &operation.idempotency_key {
            let slot = (operation.created_by.clone(), key.token.clone());
            if let Some(existing) = self.idempotency.get(&slot) {
                return Err(StoreError::IdempotencyConflict {
                    owner: operation.created_by.clone(),
                    key: key.token.clone(),
                    operation_id: existing.clone(),
                });
            }
            self.idempotency.insert(slot, operation.id.clone());
        }
        self.operations
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    /// Get an operation.
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.operations.get(id)
    }

    /// Get the operation bound to an owner's key.
    pub fn get_by_idempotency_key(&self, owner: &str, key: &str) -> Option<&Operation> {
        self.idempotency
            .get(&(owner.to_string(), key.to_string()))
            .and_then(|id| self.operations.get(id))
    }

    /// Ensure the operation exists and is not done.
    pub fn check_active(&self, id: &str) -> Result<()> {
        match self.operations.get(id) {
            None => Err(StoreError::not_found("operation", id)),
            Some(op) if op.done => Err(StoreError::AlreadyCompleted(id.to_string())),
            Some(_) => Ok(()),
        }
    }

    fn active_mut(&mut self, id: &str) -> Result<&mut Operation> {
        self.check_active(id)?;
        self.operations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("operation", id))
    }

    /// Touch `modified_at`.
    pub fn update_progress(&mut self, id: &str) -> Result<()> {
        let op = self.active_mut(id)?;
        op.modified_at = Utc::now();
        Ok(())
    }

    /// Replace progress metadata.
    pub fn update_meta(&mut self, id: &str, meta: &[u8]) -> Result<()> {
        let op = self.active_mut(id)?;
        op.meta = Some(meta.to_vec());
        op.modified_at = Utc::now();
        Ok(())
    }

    /// Complete with a response.
    pub fn complete(&mut self, id: &str, response: &[u8]) -> Result<()> {
        let op = self.active_mut(id)?;
        op.done = true;
        op.response = Some(response.to_vec());
        op.modified_at = Utc::now();
        Ok(())
    }

    /// Fail with a status.
    pub fn fail(&mut self, id: &str, status: &OperationStatus) -> Result<()> {
        let op = self.active_mut(id)?;
        op.done = true;
        op.error = Some(status.clone());
        op.modified_at = Utc::now();
        Ok(())
    }

    /// Incomplete operations not modified since `cutoff`, oldest first.
    pub fn list_incomplete_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Vec<Operation> {
        let mut ops: Vec<_> = self
            .operations
            .values()
            .filter(|op| !op.done && op.modified_at < cutoff)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.modified_at);
        ops.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
