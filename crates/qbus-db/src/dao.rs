//! The queue DAO port (spec §4.B): a narrow data-access contract any
//! conforming storage backend can implement. The rest of the workspace
//! depends only on this trait, not on Postgres directly.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use qbus_core::{EventRow, NewEventRow, SearchKeys};
use sqlx::{Postgres, Transaction};

/// Narrow data-access contract for a durable event queue (spec §4.B).
#[async_trait]
pub trait QueueDao: Send + Sync {
    /// Unconditional append to the live table.
    async fn insert(&self, row: NewEventRow) -> Result<EventRow>;

    /// Append bound to a caller-supplied transaction; commits/rolls back with it.
    async fn insert_from_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: NewEventRow,
    ) -> Result<EventRow>;

    /// Atomically select up to `limit` AVAILABLE-and-due rows, flip them to
    /// IN_PROCESSING under `owner_tag` with a lease of `lease_duration`, and
    /// return the updated rows. Must be atomic against concurrent claimers:
    /// a row is returned to at most one caller (spec §4.B, §5).
    async fn claim_ready(
        &self,
        owner_tag: &str,
        lease_duration: Duration,
        limit: i64,
    ) -> Result<Vec<EventRow>>;

    /// Write back `error_count`, reset to AVAILABLE, and set the next
    /// available date to `now + backoff`.
    async fn update_on_error(&self, record_id: i64, error_count: i32, backoff: Duration)
        -> Result<()>;

    /// Move claimed rows to history as PROCESSED or FAILED, deleting them
    /// from the live table. `failed` carries each row's final `error_count`
    /// (`maxFailureRetries + 1`, spec §8) since the live row's own
    /// `error_count` column only reflects the last *persisted* retry, not
    /// the terminal attempt that exhausted retries. Bulk-batched; safe to
    /// retry on partial failure (spec §4.B).
    async fn move_to_history(&self, processed_ids: &[i64], failed: &[(i64, i32)]) -> Result<()>;

    /// Rows currently IN_PROCESSING.
    async fn get_in_processing(&self) -> Result<Vec<EventRow>>;

    /// Rows currently AVAILABLE, filtered by `keys` (search_key2 only when
    /// `search_key1` is absent).
    async fn get_ready(&self, keys: SearchKeys) -> Result<Vec<EventRow>>;

    /// Rows currently AVAILABLE or IN_PROCESSING, filtered by `keys`.
    async fn get_ready_or_in_processing(&self, keys: SearchKeys) -> Result<Vec<EventRow>>;

    /// As `get_ready`, but reads through a caller-supplied transaction so
    /// the inspection observes that transaction's own uncommitted writes
    /// (spec §4.F "transactional" inspection variant).
    async fn get_ready_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>>;

    /// As `get_ready_or_in_processing`, but reads through a caller-supplied
    /// transaction.
    async fn get_ready_or_in_processing_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>>;

    /// Reset any IN_PROCESSING row whose lease has already elapsed back to
    /// AVAILABLE. Called by `DbBackedQueue::initialize()` for crash recovery
    /// (spec §4.C, §9 Open Question, §5 "Lease expiry reclaim is mandatory").
    async fn reclaim_stale_leases(&self) -> Result<u64>;
}
