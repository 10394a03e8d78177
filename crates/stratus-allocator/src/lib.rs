// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Allocator - VM, Session and Dynamic Mount Lifecycle
//!
//! This crate is the control plane for compute sessions. It allocates VMs for
//! sessions, caches idle VMs for reuse, deletes VMs and sessions, and attaches
//! dynamic disks to running VMs. Every long-running action is a saga from
//! `stratus-core`, driven against a persisted operation so it survives process
//! restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Request layer (gRPC, HTTP, CLI)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   stratus-allocator (This Crate)                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ Allocator   │  │   Sagas     │  │  Restore    │  │  VM garbage │     │
//! │  │  Service    │─►│ (allocate,  │◄─│ On Startup  │  │  collector  │     │
//! │  │             │  │ delete ...) │  │             │  │             │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                 │                              │
//!           │                 │ VMs, tunnels, volumes        │ subjects
//!           │                 ▼                              ▼
//!           │       ┌───────────────────┐        ┌─────────────────────────┐
//!           │       │   Cluster APIs    │        │    Identity service     │
//!           │       └───────────────────┘        └─────────────────────────┘
//!           ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           PostgreSQL                                   │
//! │             (Operations, Sessions, VMs, Dynamic Mounts)               │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Sagas
//!
//! | Saga | Started by | Compensation |
//! |------|------------|--------------|
//! | Allocate VM | `allocate` | Delete VM |
//! | Delete VM | `free` on a non-cacheable session, GC, session deletion | - |
//! | Delete Session | `delete_session` | - |
//! | Mount | `mount` | Unmount |
//! | Unmount | `unmount`, failed mount, VM deletion | - |
//!
//! # VM Status State Machine
//!
//! ```text
//!            allocate
//!               │
//!               ▼
//!        ┌────────────┐  fail / expire   ┌──────────┐
//!        │ ALLOCATING │─────────────────►│ DELETING │──► removed
//!        └─────┬──────┘                  └──────────┘
//!              │ register                      ▲
//!              ▼                               │
//!        ┌────────────┐  deadline / session    │
//!        │  RUNNING   │────────────────────────┤
//!        └─────┬──────┘                        │
//!         free │  ▲ allocate (reuse)           │
//!              ▼  │                            │
//!        ┌────────────┐  idle deadline         │
//!        │    IDLE    │────────────────────────┘
//!        └────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables, see [`config::Config::from_env`].
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STRATUS_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `STRATUS_WORKER_ID` | No | `$HOSTNAME` | Owner of sagas started here |
//! | `STRATUS_MAX_CONCURRENT_SAGAS` | No | `32` | Saga concurrency |
//! | `STRATUS_ALLOCATION_TIMEOUT_SECS` | No | `900` | Allocate deadline |
//! | `STRATUS_MOUNT_TIMEOUT_SECS` | No | `600` | Mount deadline |
//! | `STRATUS_MOUNTS_ENABLED` | No | `true` | Dynamic mount support |
//!
//! # Modules
//!
//! - [`cluster`]: VM, volume and mount holder client traits
//! - [`config`]: Configuration from environment variables
//! - [`context`]: Shared saga dependencies
//! - [`error`]: Error types
//! - [`gc`]: Expired VM collection
//! - [`identity`]: Identity service client trait
//! - [`metrics`]: VM and operation counters
//! - [`model`]: Sessions, VMs and dynamic mounts
//! - [`restore`]: Restore-On-Startup
//! - [`runtime`]: Embeddable runtime
//! - [`sagas`]: The allocator sagas
//! - [`service`]: Request facade
//! - [`store`]: PostgreSQL and in-memory persistence

#![deny(missing_docs)]

/// Database migrations for stratus-allocator.
///
/// The allocator extends stratus-core's schema. Calling `migrations::run()`
/// applies both core and allocator migrations in the correct order.
///
/// ```ignore
/// use stratus_allocator::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// VM, volume and mount holder client traits.
pub mod cluster;

/// Configuration loaded from environment variables.
pub mod config;

/// Dependencies shared by sagas, the service and workers.
pub mod context;

/// Error types for allocator operations.
pub mod error;

/// Background worker that deletes expired VMs.
pub mod gc;

/// Identity service client trait.
pub mod identity;

/// VM gauges and operation counters.
pub mod metrics;

/// In-process cluster and identity clients.
pub mod mock;

/// Sessions, VMs, dynamic mounts and operation payloads.
pub mod model;

/// Rebuilding unfinished sagas on startup.
pub mod restore;

/// Embeddable allocator runtime.
pub mod runtime;

/// Allocate, delete, mount and unmount sagas.
pub mod sagas;

/// Request facade.
pub mod service;

/// Allocator persistence.
pub mod store;

pub use config::Config;
pub use context::{AllocationContext, ClusterClients};
pub use error::{Error, Result};
pub use runtime::{AllocatorRuntime, AllocatorRuntimeBuilder, AllocatorRuntimeConfig};
pub use service::{AllocateRequest, AllocatorService, MountRequest};
pub use store::{AllocatorStore, InMemoryStore, PostgresStore};
