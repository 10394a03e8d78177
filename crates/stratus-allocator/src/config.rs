// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use stratus_core::SchedulerConfig;

use crate::gc::GcConfig;
use crate::sagas::SagaConfig;

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Worker that owns the sagas started by this process
    pub worker_id: String,
    /// Saga scheduler settings
    pub scheduler: SchedulerConfig,
    /// Saga timing and feature settings
    pub saga: SagaConfig,
    /// VM garbage collector settings
    pub gc: GcConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATUS_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `STRATUS_WORKER_ID`: worker identity (default: `$HOSTNAME` or `allocator-0`)
    /// - `STRATUS_MAX_CONCURRENT_SAGAS`: concurrently running saga steps (default: 32)
    /// - `STRATUS_VM_WAIT_INITIAL_DELAY_MS`: first VM readiness poll delay (default: 5000)
    /// - `STRATUS_VM_WAIT_POLL_INTERVAL_MS`: VM readiness poll interval (default: 1000)
    /// - `STRATUS_SESSION_POLL_INTERVAL_MS`: session deletion poll interval (default: 1000)
    /// - `STRATUS_POD_POLL_INTERVAL_MS`: mount holder pod poll interval (default: 1000)
    /// - `STRATUS_ALLOCATION_TIMEOUT_SECS`: allocate operation deadline (default: 900)
    /// - `STRATUS_MOUNT_TIMEOUT_SECS`: mount operation deadline (default: 600)
    /// - `STRATUS_VM_ACTIVITY_TIMEOUT_SECS`: activity deadline extension (default: 600)
    /// - `STRATUS_GC_POLL_INTERVAL_SECS`: VM garbage collector period (default: 10)
    /// - `STRATUS_MOUNTS_ENABLED`: dynamic mount support (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRATUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRATUS_DATABASE_URL"))?;

        let worker_id = std::env::var("STRATUS_WORKER_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| "allocator-0".to_string());

        let max_concurrent_sagas: usize = parse_var(
            "STRATUS_MAX_CONCURRENT_SAGAS",
            32,
            "must be a positive integer",
        )?;
        if max_concurrent_sagas == 0 {
            return Err(ConfigError::Invalid(
                "STRATUS_MAX_CONCURRENT_SAGAS",
                "must be a positive integer",
            ));
        }

        let saga_defaults = SagaConfig::default();
        let saga = SagaConfig {
            vm_wait_initial_delay: millis_var("STRATUS_VM_WAIT_INITIAL_DELAY_MS", 5000)?,
            vm_wait_poll_interval: millis_var("STRATUS_VM_WAIT_POLL_INTERVAL_MS", 1000)?,
            session_poll_interval: millis_var("STRATUS_SESSION_POLL_INTERVAL_MS", 1000)?,
            pod_poll_interval: millis_var("STRATUS_POD_POLL_INTERVAL_MS", 1000)?,
            allocation_timeout: secs_var("STRATUS_ALLOCATION_TIMEOUT_SECS", 900)?,
            mount_timeout: secs_var("STRATUS_MOUNT_TIMEOUT_SECS", 600)?,
            activity_timeout: secs_var("STRATUS_VM_ACTIVITY_TIMEOUT_SECS", 600)?,
            mounts_enabled: std::env::var("STRATUS_MOUNTS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(saga_defaults.mounts_enabled),
        };

        let gc = GcConfig {
            poll_interval: secs_var("STRATUS_GC_POLL_INTERVAL_SECS", 10)?,
            ..GcConfig::default()
        };

        Ok(Self {
            database_url,
            worker_id,
            scheduler: SchedulerConfig {
                max_concurrent_sagas,
                ..SchedulerConfig::default()
            },
            saga,
            gc,
        })
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default, "must be a non-negative number of milliseconds")
        .map(Duration::from_millis)
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default, "must be a non-negative number of seconds").map(Duration::from_secs)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
