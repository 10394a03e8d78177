// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Core - Durable Operation Framework
//!
//! This crate provides the resumable saga engine used by the stratus allocator:
//! persisted operation records, the step runner that drives a saga against its
//! operation, and the scheduler that runs many sagas in one process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Request handlers                                │
//! │           create Operation + domain row, build saga, submit              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ submit(BoxedTask)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            SagaScheduler                                 │
//! │     registry by operation id · semaphore-bounded · Restart delays        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ run_once()
//!                                    ▼
//! ┌───────────────────────┐   steps   ┌─────────────────────────────────────┐
//! │    OperationRunner    │──────────►│  Saga (allocate, delete, mount ...) │
//! │ deadline · outside    │◄──────────│  StepResult per step                │
//! │ completion · finish   │           └─────────────────────────────────────┘
//! └───────────────────────┘                           │
//!           │                                         │
//!           ▼                                         ▼
//! ┌───────────────────────┐           ┌─────────────────────────────────────┐
//! │    OperationStore     │           │  Domain stores, external clients    │
//! │ (PostgreSQL / memory) │           │                                     │
//! └───────────────────────┘           └─────────────────────────────────────┘
//! ```
//!
//! # Step Results
//!
//! | Result | Runner behaviour |
//! |--------|------------------|
//! | `AlreadyDone` | Effect already present, move to the next step |
//! | `Continue` | Record progress, move to the next step |
//! | `Restart(delay)` | Run the same step again after `delay` |
//! | `Finish` | Saga done (success, or failure already recorded) |
//!
//! Every invocation starts from the first step. Steps re-derive their own
//! completion from persisted state, so a saga rebuilt after a crash resumes
//! where the previous process stopped.
//!
//! # Compensation
//!
//! [`runner::Saga::notify_finished`] returns the compensating saga instead of
//! submitting it, so the runner hands it to the scheduler and tests can assert
//! on it directly.
//!
//! # Fault Injection
//!
//! [`failpoints::FailPoints`] simulates crashes at step boundaries. An injected
//! failure stops the runner without failing the operation.

#![deny(missing_docs)]

/// Error types for stores and sagas.
pub mod error;

/// Fault-injection points.
pub mod failpoints;

/// Database migrations.
pub mod migrations;

/// Operation record model.
pub mod operation;

/// Operation store trait and backends.
pub mod persistence;

/// Step runner and saga trait.
pub mod runner;

/// Saga scheduler.
pub mod scheduler;

/// Step results.
pub mod step;

pub use error::{SagaError, StoreError};
pub use failpoints::FailPoints;
pub use operation::{IdempotencyKey, Operation, OperationStatus, StatusCode};
pub use persistence::{
    InMemoryOperationStore, OperationStore, OperationTable, PostgresOperationStore,
};
pub use runner::{BoxedTask, OperationRunner, RunOutcome, RunnerState, Saga, SagaTask};
pub use scheduler::{SagaScheduler, SchedulerConfig};
pub use step::{DEFAULT_RESTART_DELAY, StepResult};
