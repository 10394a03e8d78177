// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-allocator tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use stratus_allocator::context::{AllocationContext, ClusterClients};
use stratus_allocator::metrics::AllocatorMetrics;
use stratus_allocator::mock::{MockCluster, MockIdentity};
use stratus_allocator::model::{CachePolicy, Session, VolumeRequest};
use stratus_allocator::restore::{RestoreReport, restore};
use stratus_allocator::sagas::SagaConfig;
use stratus_allocator::service::{AllocateRequest, AllocatorService, MountRequest};
use stratus_allocator::store::{AllocatorStore, InMemoryStore};
use stratus_core::{FailPoints, Operation, OperationStore, RunnerState, SagaScheduler};

pub const WORKER_ID: &str = "worker-1";

/// Upper bound for any saga to settle in tests.
pub const SETTLE: Duration = Duration::from_secs(10);

/// Skip the test if no test database is configured.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_STRATUS_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_STRATUS_DATABASE_URL not set");
            return;
        }
    };
}

/// Connect to the test database and apply core and allocator migrations.
pub async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_STRATUS_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    stratus_allocator::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// Initialise tracing once for noisy debugging sessions (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Saga timings short enough for tests.
pub fn fast_config() -> SagaConfig {
    SagaConfig {
        vm_wait_initial_delay: Duration::from_millis(10),
        vm_wait_poll_interval: Duration::from_millis(10),
        session_poll_interval: Duration::from_millis(10),
        pod_poll_interval: Duration::from_millis(10),
        ..SagaConfig::default()
    }
}

/// An allocator over in-memory store and mock clients.
///
/// [`Harness::restart`] replaces the scheduler and service as a process
/// restart would, keeping the store and the cluster.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub cluster: Arc<MockCluster>,
    pub identity: Arc<MockIdentity>,
    pub fail_points: Arc<FailPoints>,
    pub metrics: Arc<AllocatorMetrics>,
    pub config: SagaConfig,
    pub service: AllocatorService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: SagaConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(MockCluster::new());
        let identity = Arc::new(MockIdentity::new());
        let fail_points = Arc::new(FailPoints::new());
        let metrics = Arc::new(AllocatorMetrics::new());
        let service = Self::build_service(
            &store,
            &cluster,
            &identity,
            &fail_points,
            &metrics,
            config.clone(),
        );
        Self {
            store,
            cluster,
            identity,
            fail_points,
            metrics,
            config,
            service,
        }
    }

    fn build_service(
        store: &Arc<InMemoryStore>,
        cluster: &Arc<MockCluster>,
        identity: &Arc<MockIdentity>,
        fail_points: &Arc<FailPoints>,
        metrics: &Arc<AllocatorMetrics>,
        config: SagaConfig,
    ) -> AllocatorService {
        let clients = ClusterClients::mock(cluster.clone(), identity.clone());
        let ctx = AllocationContext::new(store.clone(), clients, WORKER_ID, config)
            .with_fail_points(fail_points.clone())
            .with_metrics(metrics.clone());
        AllocatorService::new(ctx, SagaScheduler::default())
    }

    pub fn ctx(&self) -> &AllocationContext {
        self.service.context()
    }

    pub fn scheduler(&self) -> &SagaScheduler {
        self.service.scheduler()
    }

    /// Stop the scheduler, start a fresh one and run Restore-On-Startup.
    pub async fn restart(&mut self) -> RestoreReport {
        self.scheduler().shutdown().await;
        self.service = Self::build_service(
            &self.store,
            &self.cluster,
            &self.identity,
            &self.fail_points,
            &self.metrics,
            self.config.clone(),
        );
        restore(self.ctx(), self.scheduler())
            .await
            .expect("restore")
    }

    pub async fn session(&self, idle_timeout: Duration) -> Session {
        self.service
            .create_session("team-a", "test session", CachePolicy { idle_timeout })
            .await
            .expect("create session")
    }

    pub fn allocate_request(&self, session: &Session) -> AllocateRequest {
        AllocateRequest::new(&session.id, "small", "zone-a", "cluster-1")
    }

    /// Allocate a VM and wait until the saga reaches WaitVm.
    pub async fn allocate(&self, session: &Session) -> (Operation, String) {
        let op = self
            .service
            .allocate(self.allocate_request(session))
            .await
            .expect("allocate");
        let vm_id = self.wait_for_vm_of(&session.id, &op.id).await;
        (op, vm_id)
    }

    /// Allocate a VM and register it.
    pub async fn running_vm(&self, session: &Session) -> String {
        let (op, vm_id) = self.allocate(session).await;
        self.wait_allocated(&vm_id).await;
        self.service.register_vm(&vm_id).await.expect("register");
        assert_eq!(self.wait(&op.id).await, RunnerState::Done);
        vm_id
    }

    /// The VM created by an allocate operation.
    pub async fn wait_for_vm_of(&self, session_id: &str, operation_id: &str) -> String {
        let deadline = tokio::time::Instant::now() + SETTLE;
        loop {
            let vms = self
                .store
                .get_session_vms(session_id)
                .await
                .expect("session VMs");
            if let Some(vm) = vms
                .into_iter()
                .find(|vm| vm.allocate_operation_id() == operation_id)
            {
                return vm.id;
            }
            assert!(tokio::time::Instant::now() < deadline, "VM not created");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the cluster accepted the VM.
    pub async fn wait_allocated(&self, vm_id: &str) {
        let deadline = tokio::time::Instant::now() + SETTLE;
        while !self.cluster.is_allocated(vm_id) {
            assert!(tokio::time::Instant::now() < deadline, "VM not allocated");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait for the saga of `operation_id` to end.
    pub async fn wait(&self, operation_id: &str) -> RunnerState {
        self.scheduler()
            .wait_for_timeout(operation_id, SETTLE)
            .await
            .expect("saga did not finish in time")
    }

    /// Wait until the VM row is gone.
    pub async fn wait_vm_removed(&self, vm_id: &str) {
        let deadline = tokio::time::Instant::now() + SETTLE;
        while self.store.get_vm(vm_id).await.expect("get vm").is_some() {
            assert!(tokio::time::Instant::now() < deadline, "VM {vm_id} not removed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the mount row is gone.
    pub async fn wait_mount_removed(&self, mount_id: &str) {
        let deadline = tokio::time::Instant::now() + SETTLE;
        while self.store.get_mount(mount_id).await.expect("get mount").is_some() {
            assert!(tokio::time::Instant::now() < deadline, "mount {mount_id} not removed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn operation(&self, operation_id: &str) -> Operation {
        self.store
            .get_operation(operation_id)
            .await
            .expect("get operation")
            .expect("operation exists")
    }

    /// ID of the single mount row of a VM.
    pub async fn only_mount_of(&self, vm_id: &str) -> String {
        let mounts = self.store.get_mounts_by_vm(vm_id).await.expect("mounts");
        assert_eq!(mounts.len(), 1, "expected one mount on VM {vm_id}");
        mounts[0].id.clone()
    }

    pub fn mount_request(&self, vm_id: &str, path: &str, disk_id: &str) -> MountRequest {
        MountRequest {
            vm_id: vm_id.to_string(),
            mount_path: path.to_string(),
            volume: VolumeRequest {
                name: "data".to_string(),
                size_gb: 10,
                disk_id: disk_id.to_string(),
            },
        }
    }
}
