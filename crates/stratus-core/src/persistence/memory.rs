// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory operation store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use super::{OperationStore, OperationTable};
use crate::error::{Result, StoreError};
use crate::operation::{Operation, OperationStatus};

/// Operation store kept in process memory.
///
/// [`InMemoryOperationStore::inject_unavailable`] makes the next calls fail with
/// [`StoreError::Unavailable`] to simulate database contention.
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    table: Mutex<OperationTable>,
    unavailable: AtomicU32,
}

impl InMemoryOperationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `calls` store calls with [`StoreError::Unavailable`].
    pub fn inject_unavailable(&self, calls: u32) {
        self.unavailable.fetch_add(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected contention".to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Number of stored operations.
    pub async fn operation_count(&self) -> usize {
        self.table.lock().await.len()
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        self.check_available()?;
        self.table.lock().await.create(operation)
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        self.check_available()?;
        Ok(self.table.lock().await.get(id).cloned())
    }

    async fn get_by_idempotency_key(&self, owner: &str, key: &str) -> Result<Option<Operation>> {
        self.check_available()?;
        Ok(self
            .table
            .lock()
            .await
            .get_by_idempotency_key(owner, key)
            .cloned())
    }

    async fn update_progress(&self, id: &str) -> Result<()> {
        self.check_available()?;
        self.table.lock().await.update_progress(id)
    }

    async fn update_meta(&self, id: &str, meta: &[u8]) -> Result<()> {
        self.check_available()?;
        self.table.lock().await.update_meta(id, meta)
    }

    async fn complete_operation(&self, id: &str, response: &[u8]) -> Result<()> {
        self.check_available()?;
        self.table.lock().await.complete(id, response)
    }

    async fn fail_operation(&self, id: &str, status: &OperationStatus) -> Result<()> {
        self.check_available()?;
        self.table.lock().await.fail(id, status)
    }

    async fn list_incomplete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>> {
        self.check_available()?;
        Ok(self
            .table
            .lock()
            .await
            .list_incomplete_older_than(cutoff, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_unavailability_is_consumed() {
        let store = InMemoryOperationStore::new();
        let op = Operation::create("svc", "op", None, None);
        store.create_operation(&op).await.unwrap();

        store.inject_unavailable(2);
        assert!(matches!(
            store.get_operation(&op.id).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.complete_operation(&op.id, b"x").await.is_err());
        store.complete_operation(&op.id, b"x").await.unwrap();

        let op = store.get_operation(&op.id).await.unwrap().unwrap();
        assert!(op.is_succeeded());
        assert_eq!(store.operation_count().await, 1);
    }
}
