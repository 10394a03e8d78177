// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process allocator gauges and counters.
//!
//! Gauges are recomputed from the store on startup; counters start at zero.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Allocator gauges and counters.
#[derive(Debug, Default)]
pub struct AllocatorMetrics {
    running_vms: AtomicI64,
    cached_vms: AtomicI64,
    allocations: AtomicU64,
    allocation_errors: AtomicU64,
    allocation_timeouts: AtomicU64,
    deleted_vms: AtomicU64,
    mount_errors: AtomicU64,
}

/// Point-in-time copy of [`AllocatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// VMs in RUNNING.
    pub running_vms: i64,
    /// VMs in IDLE.
    pub cached_vms: i64,
    /// Completed allocations.
    pub allocations: u64,
    /// Failed allocations.
    pub allocation_errors: u64,
    /// Expired allocations.
    pub allocation_timeouts: u64,
    /// Deleted VMs.
    pub deleted_vms: u64,
    /// Failed mounts.
    pub mount_errors: u64,
}

impl AllocatorMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both gauges.
    pub fn set_vm_gauges(&self, running: i64, cached: i64) {
        self.running_vms.store(running, Ordering::Relaxed);
        self.cached_vms.store(cached, Ordering::Relaxed);
    }

    /// A VM became RUNNING.
    pub fn vm_started(&self) {
        self.running_vms.fetch_add(1, Ordering::Relaxed);
    }

    /// A RUNNING VM became IDLE.
    pub fn vm_cached(&self) {
        self.running_vms.fetch_sub(1, Ordering::Relaxed);
        self.cached_vms.fetch_add(1, Ordering::Relaxed);
    }

    /// An IDLE VM was reused.
    pub fn vm_reused(&self) {
        self.cached_vms.fetch_sub(1, Ordering::Relaxed);
        self.running_vms.fetch_add(1, Ordering::Relaxed);
    }

    /// A RUNNING or IDLE VM left service.
    pub fn vm_retired(&self, was_idle: bool) {
        let gauge = if was_idle {
            &self.cached_vms
        } else {
            &self.running_vms
        };
        gauge.fetch_sub(1, Ordering::Relaxed);
    }

    /// An allocation completed.
    pub fn allocation_completed(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// An allocation failed.
    pub fn allocation_failed(&self) {
        self.allocation_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An allocation expired.
    pub fn allocation_timed_out(&self) {
        self.allocation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A VM row was removed.
    pub fn vm_deleted(&self) {
        self.deleted_vms.fetch_add(1, Ordering::Relaxed);
    }

    /// A mount failed.
    pub fn mount_failed(&self) {
        self.mount_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            running_vms: self.running_vms.load(Ordering::Relaxed),
            cached_vms: self.cached_vms.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            allocation_errors: self.allocation_errors.load(Ordering::Relaxed),
            allocation_timeouts: self.allocation_timeouts.load(Ordering::Relaxed),
            deleted_vms: self.deleted_vms.load(Ordering::Relaxed),
            mount_errors: self.mount_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_gauges_follow_transitions() {
        let metrics = AllocatorMetrics::new();
        metrics.set_vm_gauges(1, 0);
        metrics.vm_started();
        metrics.vm_cached();
        metrics.vm_reused();
        metrics.vm_retired(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.running_vms, 1);
        assert_eq!(snapshot.cached_vms, 0);
    }
}
