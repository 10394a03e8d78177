// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity service client contract.
//!
//! Every VM gets an identity subject so its workloads can authenticate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An identity subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject ID.
    pub id: String,
    /// Subject name (the VM id).
    pub name: String,
}

/// Identity service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The subject does not exist.
    #[error("Subject '{0}' not found")]
    NotFound(String),

    /// The service is temporarily unavailable.
    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
}

impl IdentityError {
    /// Whether the subject is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Client of the identity service.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Create a VM subject. Calls with the same idempotency key return the same subject.
    async fn create_subject(&self, idempotency_key: &str, vm_id: &str)
    -> Result<Subject, IdentityError>;

    /// Look up a subject.
    async fn find_subject(&self, subject_id: &str) -> Result<Option<Subject>, IdentityError>;

    /// Remove a subject. Removing a missing subject succeeds.
    async fn remove_subject(&self, subject_id: &str) -> Result<(), IdentityError>;
}
