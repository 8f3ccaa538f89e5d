//! Postgres-backed durable queue (spec §4.B Queue DAO port, §4.C DB-backed queue).
//!
//! Two tables per queue, `<table>` (live: AVAILABLE + IN_PROCESSING) and
//! `<table>_history` (terminal: PROCESSED + FAILED), with identical columns
//! (spec §6 External Interfaces).

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod dao;
pub mod postgres;
pub mod queue;

pub use dao::QueueDao;
pub use postgres::PgQueueDao;
pub use queue::{DbBackedQueue, PostedHandle};

pub const ENV_DB_URL: &str = "QBUS_DATABASE_URL";

/// Connect to Postgres using `QBUS_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper: connect via `QBUS_DATABASE_URL` and ensure `table`'s schema exists.
pub async fn testkit_db_pool(table: &str) -> Result<PgPool> {
    let pool = connect_from_env().await?;
    PgQueueDao::new(pool.clone(), table)?.ensure_schema().await?;
    Ok(pool)
}

/// Connectivity + schema presence check, mirrored on the teacher's `status()` helper.
pub async fn status(pool: &PgPool, table: &str) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = $1
        )
        "#,
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_table: bool,
}
