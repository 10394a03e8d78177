// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation record model.
//!
//! An [`Operation`] is the durable handle a caller receives for a long-running
//! request. It is created before any side effect starts and is finished exactly
//! once, either with an opaque response payload or with an [`OperationStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Status code attached to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// The request was cancelled (e.g. its session was removed).
    Cancelled,
    /// The request carried an invalid configuration.
    InvalidArgument,
    /// The operation deadline passed.
    DeadlineExceeded,
    /// A required resource does not exist.
    NotFound,
    /// The system is not in a state that allows the request.
    FailedPrecondition,
    /// The request was aborted by a concurrent change.
    Aborted,
    /// Internal error.
    Internal,
    /// A dependency is unavailable.
    Unavailable,
}

impl StatusCode {
    /// Returns the string representation stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "CANCELLED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        }
    }

    /// Parse a code from its database representation. Unknown codes map to `Internal`.
    pub fn parse(s: &str) -> Self {
        match s {
            "CANCELLED" => Self::Cancelled,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "NOT_FOUND" => Self::NotFound,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "ABORTED" => Self::Aborted,
            "UNAVAILABLE" => Self::Unavailable,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Error code.
    pub code: StatusCode,
    /// Human-readable description.
    pub message: String,
}

impl OperationStatus {
    /// Create a status with the given code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `CANCELLED` status.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    /// `INVALID_ARGUMENT` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// `DEADLINE_EXCEEDED` status.
    pub fn deadline_exceeded() -> Self {
        Self::new(StatusCode::DeadlineExceeded, "Operation deadline exceeded")
    }

    /// `FAILED_PRECONDITION` status.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    /// `INTERNAL` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Owner-scoped idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// The key supplied by the caller.
    pub token: String,
    /// Hash of the original request, used to detect key reuse with another request.
    pub request_hash: String,
}

/// A persisted long-running unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID.
    pub id: String,
    /// Principal that started the operation.
    pub created_by: String,
    /// Human-readable description.
    pub description: String,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// Last progress update.
    pub modified_at: DateTime<Utc>,
    /// Optional deadline after which the operation expires.
    pub deadline: Option<DateTime<Utc>>,
    /// Optional idempotency key, unique per owner.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Opaque progress metadata.
    pub meta: Option<Vec<u8>>,
    /// Whether the operation reached its terminal state.
    pub done: bool,
    /// Response payload of a successful operation.
    pub response: Option<Vec<u8>>,
    /// Error of a failed operation.
    pub error: Option<OperationStatus>,
}

impl Operation {
    /// Create a new, not yet done operation.
    pub fn create(
        created_by: impl Into<String>,
        description: impl Into<String>,
        deadline: Option<DateTime<Utc>>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_by: created_by.into(),
            description: description.into(),
            created_at: now,
            modified_at: now,
            deadline,
            idempotency_key,
            meta: None,
            done: false,
            response: None,
            error: None,
        }
    }

    /// Create an operation whose deadline is `timeout` from now.
    pub fn with_timeout(
        created_by: impl Into<String>,
        description: impl Into<String>,
        timeout: Duration,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Self {
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .map(|timeout| Utc::now() + timeout);
        Self::create(created_by, description, deadline, idempotency_key)
    }

    /// Whether the deadline is set and has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Whether the operation finished successfully.
    pub fn is_succeeded(&self) -> bool {
        self.done && self.error.is_none()
    }

    /// Whether the operation finished with an error.
    pub fn is_failed(&self) -> bool {
        self.done && self.error.is_some()
    }

    /// Decode the JSON response payload.
    pub fn decode_response<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Option<Result<T, serde_json::Error>> {
        self.response
            .as_deref()
            .map(|bytes| serde_json::from_slice(bytes))
    }
}
