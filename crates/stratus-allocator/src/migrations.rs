// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for stratus-allocator.
//!
//! The allocator extends stratus-core's `operations` table with sessions, VMs
//! and dynamic mounts. [`run`] applies both sets as one migrator so SQLx sees a
//! single ordered history.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use stratus_allocator::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migration, Migrator};
use std::borrow::Cow;

/// Allocator migrations embedded at compile time.
///
/// Versions start at 20250101000000 so they sort after core's (001, ...).
static ALLOCATOR_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Migration source merging core and allocator migrations.
#[derive(Debug)]
struct CombinedMigrations;

impl<'s> sqlx::migrate::MigrationSource<'s> for CombinedMigrations {
    fn resolve(
        self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<Vec<Migration>, Box<dyn std::error::Error + Send + Sync>>,
                > + Send
                + 's,
        >,
    > {
        Box::pin(async move { Ok(iter().map(Cow::into_owned).collect()) })
    }
}

/// Migrator with core and allocator migrations.
pub async fn migrator() -> Result<Migrator, MigrateError> {
    Migrator::new(CombinedMigrations).await
}

/// Run core and allocator migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    migrator().await?.run(pool).await
}

/// All migrations, sorted by version.
pub fn iter() -> impl Iterator<Item = Cow<'static, Migration>> {
    let core = stratus_core::migrations::POSTGRES.iter().map(Cow::Borrowed);
    let allocator = ALLOCATOR_MIGRATOR.iter().map(Cow::Borrowed);

    let mut all: Vec<_> = core.chain(allocator).collect();
    all.sort_by_key(|m| m.version);
    all.into_iter()
}
