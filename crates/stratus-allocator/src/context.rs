// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared dependencies of sagas, the service facade and background workers.

use std::sync::Arc;

use stratus_core::failpoints;
use stratus_core::{BoxedTask, FailPoints, OperationRunner, OperationStore, Saga, SagaError};

use crate::cluster::{MountHolderManager, VmAllocator, VolumeManager};
use crate::identity::IdentityClient;
use crate::metrics::AllocatorMetrics;
use crate::mock::{MockCluster, MockIdentity};
use crate::sagas::SagaConfig;
use crate::store::AllocatorStore;

/// External clients used by sagas.
#[derive(Clone)]
pub struct ClusterClients {
    /// VM and tunnel lifecycle.
    pub vms: Arc<dyn VmAllocator>,
    /// Volumes and claims.
    pub volumes: Arc<dyn VolumeManager>,
    /// Mount holder pods.
    pub mount_holders: Arc<dyn MountHolderManager>,
    /// Identity service.
    pub identity: Arc<dyn IdentityClient>,
}

impl ClusterClients {
    /// Clients backed by in-process mocks.
    pub fn mock(cluster: Arc<MockCluster>, identity: Arc<MockIdentity>) -> Self {
        Self {
            vms: cluster.clone(),
            volumes: cluster.clone(),
            mount_holders: cluster,
            identity,
        }
    }
}

/// Everything a saga needs besides its own state.
#[derive(Clone)]
pub struct AllocationContext {
    /// Domain store.
    pub store: Arc<dyn AllocatorStore>,
    /// The same store seen as an operation store, for runners.
    pub operations: Arc<dyn OperationStore>,
    /// External clients.
    pub clients: ClusterClients,
    /// Gauges and counters.
    pub metrics: Arc<AllocatorMetrics>,
    /// Saga timing.
    pub config: SagaConfig,
    /// Worker that owns sagas started through this context.
    pub worker_id: String,
    /// Fault injection, for tests.
    pub fail_points: Option<Arc<FailPoints>>,
}

impl AllocationContext {
    /// Create a context over `store`.
    pub fn new<S: AllocatorStore + 'static>(
        store: Arc<S>,
        clients: ClusterClients,
        worker_id: impl Into<String>,
        config: SagaConfig,
    ) -> Self {
        let operations: Arc<dyn OperationStore> = store.clone();
        Self::from_parts(store, operations, clients, worker_id, config)
    }

    /// Create a context from a store already split into its two views.
    ///
    /// `store` and `operations` must be the same backend.
    pub fn from_parts(
        store: Arc<dyn AllocatorStore>,
        operations: Arc<dyn OperationStore>,
        clients: ClusterClients,
        worker_id: impl Into<String>,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            operations,
            clients,
            metrics: Arc::new(AllocatorMetrics::new()),
            config,
            worker_id: worker_id.into(),
            fail_points: None,
        }
    }

    /// Enable fault injection in runners and steps.
    pub fn with_fail_points(mut self, fail_points: Arc<FailPoints>) -> Self {
        self.fail_points = Some(fail_points);
        self
    }

    /// Share metrics with another component.
    pub fn with_metrics(mut self, metrics: Arc<AllocatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Fire the named in-step fail point, if armed.
    pub(crate) fn fail_point(&self, point: &str) -> Result<(), SagaError> {
        failpoints::check(self.fail_points.as_deref(), point)
    }

    /// Wrap a saga in a runner for `operation_id`.
    pub(crate) fn runner<S: Saga>(&self, operation_id: &str, saga: S) -> BoxedTask {
        OperationRunner::new(operation_id, self.operations.clone(), saga)
            .with_fail_points(self.fail_points.clone())
            .boxed()
    }
}
