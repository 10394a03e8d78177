// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema of the durable operation log.
//!
//! Creates the `operations` table that [`crate::persistence::postgres`] reads
//! and writes. The allocator folds [`POSTGRES`] into its own migrator so both
//! schemas share one `_sqlx_migrations` history; standalone users of the
//! operation log call [`run_postgres`] instead.

use sqlx::migrate::MigrateError;

/// Embedded migrations for the `operations` table.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Create or upgrade the `operations` table on `pool`. Applied versions are
/// skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
