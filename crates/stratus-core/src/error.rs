// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-core.
//!
//! [`StoreError`] is what persistence backends return; [`SagaError`] is what a
//! saga step may return to its runner.

use thiserror::Error;

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by operation and resource stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind (operation, vm, session, mount).
        kind: &'static str,
        /// Record identifier.
        id: String,
    },

    /// The operation is already done; its outcome is immutable.
    #[error("Operation '{0}' is already completed")]
    AlreadyCompleted(String),

    /// A record with the same identity already exists.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Record kind.
        kind: &'static str,
        /// Identifier of the existing record.
        id: String,
    },

    /// Owner and idempotency key are already bound to another operation.
    #[error("Idempotency key '{key}' of '{owner}' is bound to operation '{operation_id}'")]
    IdempotencyConflict {
        /// Operation owner.
        owner: String,
        /// Idempotency key.
        key: String,
        /// The operation holding the key.
        operation_id: String,
    },

    /// The entity is in a state that does not allow the update.
    #[error("{kind} '{id}' is in invalid state: {state}")]
    InvalidState {
        /// Record kind.
        kind: &'static str,
        /// Record identifier.
        id: String,
        /// Actual state.
        state: String,
    },

    /// Storage is temporarily unavailable (contention, connection loss).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the error means the operation was completed by someone else.
    pub fn is_already_completed(&self) -> bool {
        matches!(self, Self::AlreadyCompleted(_))
    }

    /// Whether the error means the record is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors a saga step can hand back to its runner.
///
/// Steps translate expected failures into a [`crate::step::StepResult`] themselves;
/// anything that reaches the runner as an error is either a simulated crash or
/// a programming error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SagaError {
    /// Fault-injection point fired. The runner stops without touching the operation.
    #[error("Injected failure at {0}")]
    Injected(String),

    /// Store access failed where the step did not handle it.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected condition inside a step.
    #[error("Internal saga error: {0}")]
    Internal(String),
}

impl SagaError {
    /// Whether this error simulates a process crash.
    pub fn is_injected(&self) -> bool {
        matches!(self, Self::Injected(_))
    }
}
