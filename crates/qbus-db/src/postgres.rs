//! Postgres implementation of the queue DAO port (spec §4.B), plus the
//! per-queue schema DDL (spec §6 External Interfaces).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use qbus_core::{EventRow, NewEventRow, ProcessingState, SearchKeys};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::dao::QueueDao;

/// A live/history table pair backed by Postgres (spec §4.B, §4.C).
#[derive(Clone)]
pub struct PgQueueDao {
    pool: PgPool,
    table: String,
    history_table: String,
}

impl PgQueueDao {
    /// `table` becomes the live table name; the history table is
    /// `<table>_history` (spec §6).
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            history_table: format!("{table}_history"),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the live and history tables (and their indexes) if absent.
    /// Idempotent — safe to call on every process startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        for table in [self.table.as_str(), self.history_table.as_str()] {
            let ddl = format!(
                r#"
                create table if not exists {table} (
                    record_id                  bigserial primary key,
                    class_name                 text not null,
                    event_json                 jsonb not null,
                    user_token                 uuid not null,
                    search_key1                bigint,
                    search_key2                bigint not null,
                    created_date               timestamptz not null default now(),
                    creator_name               text not null,
                    processing_owner           text,
                    processing_available_date  timestamptz,
                    processing_state           text not null default 'AVAILABLE',
                    error_count                integer not null default 0
                )
                "#
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("ensure_schema: create table {table}"))?;

            let idx_state = format!(
                "create index if not exists idx_{table}_state_date on {table} (processing_state, processing_available_date)"
            );
            sqlx::query(&idx_state)
                .execute(&self.pool)
                .await
                .with_context(|| format!("ensure_schema: create index on {table}"))?;

            let idx_keys = format!(
                "create index if not exists idx_{table}_search_keys on {table} (search_key2, search_key1)"
            );
            sqlx::query(&idx_keys)
                .execute(&self.pool)
                .await
                .with_context(|| format!("ensure_schema: create search-key index on {table}"))?;
        }

        Ok(())
    }
}

/// Table and column identifiers are interpolated into SQL text (Postgres
/// has no bind-parameter form for identifiers), so every identifier is
/// restricted to `[a-zA-Z_][a-zA-Z0-9_]*` before being used in a query.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if name.is_empty() || !first_ok || !rest_ok {
        return Err(anyhow!(
            "invalid table name '{name}': must match [a-zA-Z_][a-zA-Z0-9_]*"
        ));
    }
    Ok(())
}

fn row_to_event_row(row: &sqlx::postgres::PgRow) -> Result<EventRow> {
    Ok(EventRow {
        record_id: row.try_get("record_id")?,
        class_name: row.try_get("class_name")?,
        event_json: row.try_get("event_json")?,
        user_token: row.try_get("user_token")?,
        search_key1: row.try_get("search_key1")?,
        search_key2: row.try_get("search_key2")?,
        created_date: row.try_get("created_date")?,
        creator_name: row.try_get("creator_name")?,
        processing_owner: row.try_get("processing_owner")?,
        processing_available_date: row.try_get("processing_available_date")?,
        processing_state: ProcessingState::parse(&row.try_get::<String, _>("processing_state")?)?,
        error_count: row.try_get("error_count")?,
    })
}

const SELECT_COLUMNS: &str = "record_id, class_name, event_json, user_token, search_key1, \
     search_key2, created_date, creator_name, processing_owner, processing_available_date, \
     processing_state, error_count";

#[async_trait]
impl QueueDao for PgQueueDao {
    async fn insert(&self, row: NewEventRow) -> Result<EventRow> {
        let table = &self.table;
        let sql = format!(
            r#"
            insert into {table}
                (class_name, event_json, user_token, search_key1, search_key2,
                 creator_name, processing_available_date, processing_state, error_count)
            values ($1, $2, $3, $4, $5, $6, now(), 'AVAILABLE', 0)
            returning {SELECT_COLUMNS}
            "#
        );

        let pg_row = sqlx::query(&sql)
            .bind(&row.class_name)
            .bind(&row.event_json)
            .bind(row.user_token)
            .bind(row.search_key1)
            .bind(row.search_key2)
            .bind(&row.creator_name)
            .fetch_one(&self.pool)
            .await
            .context("insert failed")?;

        row_to_event_row(&pg_row)
    }

    async fn insert_from_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: NewEventRow,
    ) -> Result<EventRow> {
        let table = &self.table;
        let sql = format!(
            r#"
            insert into {table}
                (class_name, event_json, user_token, search_key1, search_key2,
                 creator_name, processing_available_date, processing_state, error_count)
            values ($1, $2, $3, $4, $5, $6, now(), 'AVAILABLE', 0)
            returning {SELECT_COLUMNS}
            "#
        );

        let pg_row = sqlx::query(&sql)
            .bind(&row.class_name)
            .bind(&row.event_json)
            .bind(row.user_token)
            .bind(row.search_key1)
            .bind(row.search_key2)
            .bind(&row.creator_name)
            .fetch_one(&mut **tx)
            .await
            .context("insert_from_transaction failed")?;

        row_to_event_row(&pg_row)
    }

    async fn claim_ready(
        &self,
        owner_tag: &str,
        lease_duration: Duration,
        limit: i64,
    ) -> Result<Vec<EventRow>> {
        let table = &self.table;
        let lease_until = Utc::now()
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| anyhow!("invalid lease duration: {e}"))?;

        // CTE + FOR UPDATE SKIP LOCKED: concurrent claimers never observe the
        // same row (spec §5 "Claim atomicity").
        let sql = format!(
            r#"
            with to_claim as (
                select record_id
                from {table}
                where processing_state = 'AVAILABLE'
                  and processing_available_date <= now()
                order by record_id asc
                limit $1
                for update skip locked
            )
            update {table}
               set processing_state          = 'IN_PROCESSING',
                   processing_owner          = $2,
                   processing_available_date = $3
             where record_id in (select record_id from to_claim)
            returning {SELECT_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(owner_tag)
            .bind(lease_until)
            .fetch_all(&self.pool)
            .await
            .context("claim_ready failed")?;

        rows.iter().map(row_to_event_row).collect()
    }

    async fn update_on_error(
        &self,
        record_id: i64,
        error_count: i32,
        backoff: Duration,
    ) -> Result<()> {
        let table = &self.table;
        let next_available = Utc::now()
            + chrono::Duration::from_std(backoff).map_err(|e| anyhow!("invalid backoff: {e}"))?;

        let sql = format!(
            r#"
            update {table}
               set processing_state          = 'AVAILABLE',
                   processing_owner          = null,
                   error_count               = $2,
                   processing_available_date = $3
             where record_id = $1
            "#
        );

        sqlx::query(&sql)
            .bind(record_id)
            .bind(error_count)
            .bind(next_available)
            .execute(&self.pool)
            .await
            .context("update_on_error failed")?;

        Ok(())
    }

    async fn move_to_history(&self, processed_ids: &[i64], failed: &[(i64, i32)]) -> Result<()> {
        if processed_ids.is_empty() && failed.is_empty() {
            return Ok(());
        }

        let table = &self.table;
        let history = &self.history_table;
        let failed_ids: Vec<i64> = failed.iter().map(|(id, _)| *id).collect();
        let mut all_ids: Vec<i64> = Vec::with_capacity(processed_ids.len() + failed_ids.len());
        all_ids.extend_from_slice(processed_ids);
        all_ids.extend_from_slice(&failed_ids);

        let mut tx = self.pool.begin().await.context("move_to_history: begin")?;

        // Stamp each failed row with its terminal error_count before the
        // copy: the live row's own error_count only reflects the last
        // persisted retry, not the attempt that exhausted retries.
        for (record_id, error_count) in failed {
            let update_sql = format!("update {table} set error_count = $2 where record_id = $1");
            sqlx::query(&update_sql)
                .bind(record_id)
                .bind(error_count)
                .execute(&mut *tx)
                .await
                .context("move_to_history: stamp terminal error_count")?;
        }

        let insert_sql = format!(
            r#"
            insert into {history}
                (record_id, class_name, event_json, user_token, search_key1, search_key2,
                 created_date, creator_name, processing_owner, processing_available_date,
                 processing_state, error_count)
            select
                record_id, class_name, event_json, user_token, search_key1, search_key2,
                created_date, creator_name, processing_owner, processing_available_date,
                case when record_id = any($1) then 'PROCESSED' else 'FAILED' end,
                error_count
            from {table}
            where record_id = any($2)
            on conflict (record_id) do nothing
            "#
        );

        sqlx::query(&insert_sql)
            .bind(processed_ids)
            .bind(&all_ids)
            .execute(&mut *tx)
            .await
            .context("move_to_history: insert into history")?;

        let delete_sql = format!("delete from {table} where record_id = any($1)");
        sqlx::query(&delete_sql)
            .bind(&all_ids)
            .execute(&mut *tx)
            .await
            .context("move_to_history: delete from live table")?;

        tx.commit().await.context("move_to_history: commit")?;
        Ok(())
    }

    async fn get_in_processing(&self) -> Result<Vec<EventRow>> {
        let table = &self.table;
        let sql = format!(
            "select {SELECT_COLUMNS} from {table} where processing_state = 'IN_PROCESSING' order by record_id asc"
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("get_in_processing failed")?;

        rows.iter().map(row_to_event_row).collect()
    }

    async fn get_ready(&self, keys: SearchKeys) -> Result<Vec<EventRow>> {
        self.select_by_state_and_keys(&["AVAILABLE"], keys).await
    }

    async fn get_ready_or_in_processing(&self, keys: SearchKeys) -> Result<Vec<EventRow>> {
        self.select_by_state_and_keys(&["AVAILABLE", "IN_PROCESSING"], keys)
            .await
    }

    async fn get_ready_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>> {
        self.select_by_state_and_keys_in_executor(&mut **tx, &["AVAILABLE"], keys)
            .await
    }

    async fn get_ready_or_in_processing_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>> {
        self.select_by_state_and_keys_in_executor(&mut **tx, &["AVAILABLE", "IN_PROCESSING"], keys)
            .await
    }

    async fn reclaim_stale_leases(&self) -> Result<u64> {
        let table = &self.table;
        let sql = format!(
            r#"
            update {table}
               set processing_state = 'AVAILABLE',
                   processing_owner = null
             where processing_state = 'IN_PROCESSING'
               and processing_available_date <= now()
            "#
        );

        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .context("reclaim_stale_leases failed")?;

        Ok(result.rows_affected())
    }
}

impl PgQueueDao {
    async fn select_by_state_and_keys(
        &self,
        states: &[&str],
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>> {
        self.select_by_state_and_keys_in_executor(&self.pool, states, keys)
            .await
    }

    /// Shared by the pool-backed and transaction-backed selectors (spec
    /// §4.F: the eight inspection queries differ only in whether they read
    /// through the pool or through a caller's open transaction).
    async fn select_by_state_and_keys_in_executor<'e, E>(
        &self,
        executor: E,
        states: &[&str],
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let table = &self.table;

        // `search_key1` absent => filter on `search_key2` only (spec §4.B).
        let rows = match keys.search_key1 {
            Some(key1) => {
                let sql = format!(
                    "select {SELECT_COLUMNS} from {table} \
                     where processing_state = any($1) and search_key2 = $2 and search_key1 = $3 \
                     order by record_id asc"
                );
                sqlx::query(&sql)
                    .bind(states)
                    .bind(keys.search_key2)
                    .bind(key1)
                    .fetch_all(executor)
                    .await
            }
            None => {
                let sql = format!(
                    "select {SELECT_COLUMNS} from {table} \
                     where processing_state = any($1) and search_key2 = $2 \
                     order by record_id asc"
                );
                sqlx::query(&sql)
                    .bind(states)
                    .bind(keys.search_key2)
                    .fetch_all(executor)
                    .await
            }
        }
        .context("select_by_state_and_keys failed")?;

        rows.iter().map(row_to_event_row).collect()
    }
}
