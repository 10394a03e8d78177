// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stratus-allocator.
//!
//! [`AllocatorRuntime`] wires a store and cluster clients into a saga
//! scheduler, restores this worker's unfinished sagas and starts the VM
//! garbage collector.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_allocator::config::Config;
//! use stratus_allocator::context::ClusterClients;
//! use stratus_allocator::runtime::AllocatorRuntime;
//! use stratus_allocator::store::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(PostgresStore::connect(&config.database_url, 10).await?);
//!
//!     let runtime = AllocatorRuntime::builder()
//!         .config(&config)
//!         .store(store)
//!         .clients(my_cluster_clients())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let session = runtime
//!         .service()
//!         .create_session("team-a", "CI runners", Default::default())
//!         .await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use stratus_core::{FailPoints, OperationStore, SagaScheduler, SchedulerConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::context::{AllocationContext, ClusterClients};
use crate::gc::{GcConfig, VmGarbageCollector};
use crate::metrics::AllocatorMetrics;
use crate::restore::{RestoreReport, restore};
use crate::sagas::SagaConfig;
use crate::service::AllocatorService;
use crate::store::AllocatorStore;

/// Store seen through both of its trait objects.
#[derive(Clone)]
struct StoreHandles {
    store: Arc<dyn AllocatorStore>,
    operations: Arc<dyn OperationStore>,
}

/// Builder for creating an [`AllocatorRuntime`].
pub struct AllocatorRuntimeBuilder {
    store: Option<StoreHandles>,
    clients: Option<ClusterClients>,
    worker_id: String,
    scheduler: SchedulerConfig,
    saga: SagaConfig,
    gc: GcConfig,
    restore_on_start: bool,
    fail_points: Option<Arc<FailPoints>>,
    metrics: Option<Arc<AllocatorMetrics>>,
}

impl Default for AllocatorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            clients: None,
            worker_id: "allocator-0".to_string(),
            scheduler: SchedulerConfig::default(),
            saga: SagaConfig::default(),
            gc: GcConfig::default(),
            restore_on_start: true,
            fail_points: None,
            metrics: None,
        }
    }
}

impl AllocatorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take worker ID, scheduler, saga and collector settings from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.worker_id = config.worker_id.clone();
        self.scheduler = config.scheduler.clone();
        self.saga = config.saga.clone();
        self.gc = config.gc.clone();
        self
    }

    /// Set the store (required).
    pub fn store<S: AllocatorStore + 'static>(mut self, store: Arc<S>) -> Self {
        let operations: Arc<dyn OperationStore> = store.clone();
        self.store = Some(StoreHandles { store, operations });
        self
    }

    /// Set the cluster and identity clients (required).
    pub fn clients(mut self, clients: ClusterClients) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Set the worker that owns sagas started by this runtime.
    ///
    /// Default: `allocator-0`
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the saga scheduler configuration.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Set saga timing and feature settings.
    pub fn saga_config(mut self, config: SagaConfig) -> Self {
        self.saga = config;
        self
    }

    /// Set the VM garbage collector configuration.
    pub fn gc_config(mut self, config: GcConfig) -> Self {
        self.gc = config;
        self
    }

    /// Whether to rebuild unfinished sagas on start.
    ///
    /// Default: `true`
    pub fn restore_on_start(mut self, enabled: bool) -> Self {
        self.restore_on_start = enabled;
        self
    }

    /// Enable fault injection.
    pub fn fail_points(mut self, fail_points: Arc<FailPoints>) -> Self {
        self.fail_points = Some(fail_points);
        self
    }

    /// Share metrics with the caller.
    pub fn metrics(mut self, metrics: Arc<AllocatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<AllocatorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let clients = self
            .clients
            .ok_or_else(|| anyhow::anyhow!("clients are required"))?;
        if self.worker_id.trim().is_empty() {
            return Err(anyhow::anyhow!("worker_id must not be empty"));
        }

        Ok(AllocatorRuntimeConfig {
            store,
            clients,
            worker_id: self.worker_id,
            scheduler: self.scheduler,
            saga: self.saga,
            gc: self.gc,
            restore_on_start: self.restore_on_start,
            fail_points: self.fail_points,
            metrics: self.metrics,
        })
    }
}

/// Configuration for an [`AllocatorRuntime`].
pub struct AllocatorRuntimeConfig {
    store: StoreHandles,
    clients: ClusterClients,
    worker_id: String,
    scheduler: SchedulerConfig,
    saga: SagaConfig,
    gc: GcConfig,
    restore_on_start: bool,
    fail_points: Option<Arc<FailPoints>>,
    metrics: Option<Arc<AllocatorMetrics>>,
}

impl AllocatorRuntimeConfig {
    /// Start the runtime: restore unfinished sagas, then spawn the collector.
    pub async fn start(self) -> Result<AllocatorRuntime> {
        let mut ctx = AllocationContext::from_parts(
            self.store.store,
            self.store.operations,
            self.clients,
            self.worker_id,
            self.saga,
        );
        if let Some(fail_points) = self.fail_points {
            ctx = ctx.with_fail_points(fail_points);
        }
        if let Some(metrics) = self.metrics {
            ctx = ctx.with_metrics(metrics);
        }

        let scheduler = SagaScheduler::new(self.scheduler);

        let restore_report = if self.restore_on_start {
            restore(&ctx, &scheduler).await?
        } else {
            RestoreReport::default()
        };

        let collector = VmGarbageCollector::new(ctx.clone(), scheduler.clone(), self.gc);
        let gc_shutdown = collector.shutdown_handle();
        let gc_handle = tokio::spawn(async move {
            collector.run().await;
        });

        info!(
            worker_id = %ctx.worker_id,
            restored_sagas = restore_report.sagas(),
            mounts_enabled = ctx.config.mounts_enabled,
            "AllocatorRuntime started"
        );

        Ok(AllocatorRuntime {
            service: AllocatorService::new(ctx, scheduler.clone()),
            scheduler,
            restore_report,
            gc_handle,
            gc_shutdown,
        })
    }
}

/// A running allocator that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct AllocatorRuntime {
    service: AllocatorService,
    scheduler: SagaScheduler,
    restore_report: RestoreReport,
    gc_handle: JoinHandle<()>,
    gc_shutdown: Arc<Notify>,
}

impl AllocatorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> AllocatorRuntimeBuilder {
        AllocatorRuntimeBuilder::new()
    }

    /// Request facade.
    pub fn service(&self) -> &AllocatorService {
        &self.service
    }

    /// Saga scheduler.
    pub fn scheduler(&self) -> &SagaScheduler {
        &self.scheduler
    }

    /// What the startup restore submitted.
    pub fn restore_report(&self) -> RestoreReport {
        self.restore_report
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the collector, then stops the scheduler and waits for in-flight
    /// saga invocations. Unfinished sagas resume on the next start.
    pub async fn shutdown(self) -> Result<()> {
        info!("AllocatorRuntime shutting down...");

        self.gc_shutdown.notify_one();
        if let Err(e) = self.gc_handle.await {
            error!("VM garbage collector task panicked: {}", e);
        }

        self.scheduler.shutdown().await;

        info!("AllocatorRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.gc_handle.is_finished() && !self.scheduler.is_shut_down()
    }
}
