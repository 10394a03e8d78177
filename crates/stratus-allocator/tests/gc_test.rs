// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the VM garbage collector.

mod common;

use std::time::Duration;

use common::{Harness, fast_config};
use stratus_allocator::gc::{GcConfig, VmGarbageCollector};
use stratus_allocator::model::VmStatus;

fn collector(h: &Harness, poll_interval: Duration) -> VmGarbageCollector {
    VmGarbageCollector::new(
        h.ctx().clone(),
        h.scheduler().clone(),
        GcConfig {
            poll_interval,
            batch_size: 10,
        },
    )
}

#[tokio::test]
async fn test_collects_expired_idle_vm() {
    let h = Harness::new();
    let session = h.session(Duration::from_millis(20)).await;
    let vm_id = h.running_vm(&session).await;
    h.service.free(&vm_id).await.unwrap();

    let gc = collector(&h, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(gc.collect_once().await.unwrap(), 1);

    h.wait_vm_removed(&vm_id).await;
    assert!(!h.cluster.is_allocated(&vm_id));
    assert_eq!(h.metrics.snapshot().cached_vms, 0);

    assert_eq!(gc.collect_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_keep_alive_defers_collection() {
    let mut config = fast_config();
    config.activity_timeout = Duration::from_millis(300);
    let h = Harness::with_config(config);
    let session = h.session(Duration::ZERO).await;
    let vm_id = h.running_vm(&session).await;
    let gc = collector(&h, Duration::from_secs(60));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let deadline = h.service.keep_alive(&vm_id).await.unwrap();
    assert!(deadline > chrono::Utc::now());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gc.collect_once().await.unwrap(), 0);
    assert_eq!(
        h.service.get_vm(&vm_id).await.unwrap().status,
        VmStatus::Running
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gc.collect_once().await.unwrap(), 1);
    h.wait_vm_removed(&vm_id).await;
}

#[tokio::test]
async fn test_collector_loop_stops_on_shutdown() {
    let h = Harness::new();
    let session = h.session(Duration::from_millis(10)).await;
    let vm_id = h.running_vm(&session).await;
    h.service.free(&vm_id).await.unwrap();

    let gc = collector(&h, Duration::from_millis(20));
    let shutdown = gc.shutdown_handle();
    let handle = tokio::spawn(async move { gc.run().await });

    h.wait_vm_removed(&vm_id).await;

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("collector stopped")
        .unwrap();
}
