// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-core tests.

#![allow(dead_code)]

use sqlx::PgPool;

/// Skip the test if no test database is configured.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_STRATUS_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_STRATUS_DATABASE_URL not set");
            return;
        }
    };
}

/// Connect to the test database and apply core migrations.
pub async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_STRATUS_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    stratus_core::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

/// Initialise tracing once for noisy debugging sessions (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
