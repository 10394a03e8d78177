// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-allocator.

use thiserror::Error;

/// Allocator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] stratus_core::StoreError),

    /// Session was not found.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// Operation was not found.
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Mount was not found.
    #[error("Mount not found: {0}")]
    MountNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The entity is in a state that does not allow the request.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// The scheduler no longer accepts sagas.
    #[error("Allocator is shutting down")]
    ShuttingDown,
}

/// Result type using allocator Error.
pub type Result<T> = std::result::Result<T, Error>;
