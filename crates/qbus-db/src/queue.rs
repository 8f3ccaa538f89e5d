//! `DbBackedQueue` (spec §4.C): the thin layer between the narrow
//! [`QueueDao`] port and the runtime/bus layers above it. Owns the
//! owner-tag/lease bookkeeping for claims and the post-commit
//! notification handshake for transactional publish (spec §9 Design Note
//! "explicit hook").

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use qbus_core::{EventRow, NewEventRow, SearchKeys};
use sqlx::{Postgres, Transaction};
use tokio::sync::broadcast;

use crate::dao::QueueDao;

/// A notification fired once a publish has durably committed. Carries the
/// `search_key2` of the posted event so subscribers can cheaply filter
/// before re-querying (spec §4.C, §9).
#[derive(Debug, Clone)]
pub struct Posted {
    pub record_id: i64,
    pub search_key2: i64,
}

/// Wraps a [`QueueDao`] with owner/lease bookkeeping and an in-process
/// notification channel.
///
/// `notify_committed` is deliberately NOT called automatically by
/// `insert_from_transaction`: sqlx has no commit callback on
/// `Transaction`, so the caller must call it explicitly after they commit
/// their own transaction. Calling it after a rollback would violate the
/// "never on rollback" guarantee (spec §4.C, §9 Design Note), so
/// `insert_from_transaction` instead returns a [`PostedHandle`] that makes
/// that step explicit at the call site.
pub struct DbBackedQueue<D: QueueDao> {
    dao: Arc<D>,
    owner_tag: String,
    notify_tx: broadcast::Sender<Posted>,
}

/// A pending notification for a row inserted inside a caller-owned
/// transaction. Call [`PostedHandle::notify_committed`] only after the
/// caller has successfully committed that transaction.
#[must_use = "a Posted notification is only meaningful after the caller's transaction commits"]
pub struct PostedHandle {
    posted: Posted,
    notify_tx: broadcast::Sender<Posted>,
}

impl PostedHandle {
    /// Fire the notification. Must be called only after the transaction
    /// that inserted the row has committed.
    pub fn notify_committed(self) {
        // No receivers is not an error: nothing is listening yet.
        let _ = self.notify_tx.send(self.posted);
    }

    pub fn record_id(&self) -> i64 {
        self.posted.record_id
    }
}

impl<D: QueueDao> DbBackedQueue<D> {
    pub fn new(dao: D, owner_tag: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(dao), owner_tag)
    }

    /// As [`Self::new`], but takes a pre-shared `Arc<D>` so the caller
    /// retains a handle to the DAO (useful for test fakes that assert on
    /// recorded calls).
    pub fn from_arc(dao: Arc<D>, owner_tag: impl Into<String>) -> Self {
        let (notify_tx, _rx) = broadcast::channel(1024);
        Self {
            dao,
            owner_tag: owner_tag.into(),
            notify_tx,
        }
    }

    /// Subscribe to post-commit notifications for this process.
    pub fn subscribe(&self) -> broadcast::Receiver<Posted> {
        self.notify_tx.subscribe()
    }

    /// Idempotent startup hook: reclaims any lease left stale by a crashed
    /// worker, so a prior owner's in-flight rows become claimable again
    /// (spec §4.C, §5 "Lease expiry reclaim is mandatory").
    pub async fn initialize(&self) -> Result<u64> {
        self.dao.reclaim_stale_leases().await
    }

    /// Publish unconditionally; notifies immediately since there is no
    /// caller transaction to wait on.
    pub async fn post(&self, row: NewEventRow) -> Result<EventRow> {
        let inserted = self.dao.insert(row).await?;
        let _ = self.notify_tx.send(Posted {
            record_id: inserted.record_id,
            search_key2: inserted.search_key2,
        });
        Ok(inserted)
    }

    /// Publish bound to `tx`. Returns a handle the caller must explicitly
    /// fire after `tx.commit()` succeeds (spec §4.C).
    pub async fn post_from_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: NewEventRow,
    ) -> Result<(EventRow, PostedHandle)> {
        let inserted = self.dao.insert_from_transaction(tx, row).await?;
        let handle = PostedHandle {
            posted: Posted {
                record_id: inserted.record_id,
                search_key2: inserted.search_key2,
            },
            notify_tx: self.notify_tx.clone(),
        };
        Ok((inserted, handle))
    }

    /// Claim up to `limit` due rows under this queue's owner tag.
    pub async fn claim_ready(&self, lease_duration: Duration, limit: i64) -> Result<Vec<EventRow>> {
        self.dao
            .claim_ready(&self.owner_tag, lease_duration, limit)
            .await
    }

    pub async fn update_on_error(&self, record_id: i64, error_count: i32, backoff: Duration) -> Result<()> {
        self.dao.update_on_error(record_id, error_count, backoff).await
    }

    pub async fn move_to_history(&self, processed_ids: &[i64], failed: &[(i64, i32)]) -> Result<()> {
        self.dao.move_to_history(processed_ids, failed).await
    }

    pub async fn get_in_processing(&self) -> Result<Vec<EventRow>> {
        self.dao.get_in_processing().await
    }

    pub async fn get_ready(&self, keys: SearchKeys) -> Result<Vec<EventRow>> {
        self.dao.get_ready(keys).await
    }

    pub async fn get_ready_or_in_processing(&self, keys: SearchKeys) -> Result<Vec<EventRow>> {
        self.dao.get_ready_or_in_processing(keys).await
    }

    pub async fn get_ready_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>> {
        self.dao.get_ready_in_transaction(tx, keys).await
    }

    pub async fn get_ready_or_in_processing_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: SearchKeys,
    ) -> Result<Vec<EventRow>> {
        self.dao.get_ready_or_in_processing_in_transaction(tx, keys).await
    }

    pub fn owner_tag(&self) -> &str {
        &self.owner_tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDao {
        reclaimed: Mutex<u64>,
    }

    #[async_trait]
    impl QueueDao for FakeDao {
        async fn insert(&self, row: NewEventRow) -> Result<EventRow> {
            Ok(EventRow {
                record_id: 1,
                class_name: row.class_name,
                event_json: row.event_json,
                user_token: row.user_token,
                search_key1: row.search_key1,
                search_key2: row.search_key2,
                created_date: chrono::Utc::now(),
                creator_name: row.creator_name,
                processing_owner: None,
                processing_available_date: None,
                processing_state: qbus_core::ProcessingState::Available,
                error_count: 0,
            })
        }

        async fn insert_from_transaction(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            row: NewEventRow,
        ) -> Result<EventRow> {
            self.insert(row).await
        }

        async fn claim_ready(&self, _owner_tag: &str, _lease: Duration, _limit: i64) -> Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn update_on_error(&self, _record_id: i64, _error_count: i32, _backoff: Duration) -> Result<()> {
            Ok(())
        }

        async fn move_to_history(&self, _processed_ids: &[i64], _failed: &[(i64, i32)]) -> Result<()> {
            Ok(())
        }

        async fn get_in_processing(&self) -> Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready(&self, _keys: SearchKeys) -> Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready_or_in_processing(&self, _keys: SearchKeys) -> Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready_in_transaction(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _keys: SearchKeys,
        ) -> Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready_or_in_processing_in_transaction(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _keys: SearchKeys,
        ) -> Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn reclaim_stale_leases(&self) -> Result<u64> {
            *self.reclaimed.lock().unwrap() += 1;
            Ok(0)
        }
    }

    fn sample_row() -> NewEventRow {
        NewEventRow {
            class_name: "Widget".to_string(),
            event_json: serde_json::json!({"name": "gadget"}),
            user_token: uuid::Uuid::new_v4(),
            search_key1: None,
            search_key2: 42,
            creator_name: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn post_notifies_subscribers_immediately() {
        let queue = DbBackedQueue::new(FakeDao::default(), "worker-1");
        let mut rx = queue.subscribe();

        let inserted = queue.post(sample_row()).await.unwrap();

        let posted = rx.try_recv().expect("expected an immediate notification");
        assert_eq!(posted.record_id, inserted.record_id);
        assert_eq!(posted.search_key2, 42);
    }

    #[tokio::test]
    async fn posted_handle_does_not_notify_until_called() {
        // `insert_from_transaction` needs a live Postgres transaction, which
        // a unit test has no access to; build the handle directly to
        // exercise the same notify-on-demand contract instead.
        let queue = DbBackedQueue::new(FakeDao::default(), "worker-1");
        let mut rx = queue.subscribe();

        let inserted = queue.dao.insert(sample_row()).await.unwrap();
        let handle = PostedHandle {
            posted: Posted {
                record_id: inserted.record_id,
                search_key2: inserted.search_key2,
            },
            notify_tx: queue.notify_tx.clone(),
        };

        assert!(rx.try_recv().is_err(), "no notification before commit");
        handle.notify_committed();
        assert!(rx.try_recv().is_ok(), "notification after explicit commit");
    }

    #[tokio::test]
    async fn initialize_delegates_to_reclaim_stale_leases() {
        let queue = DbBackedQueue::new(FakeDao::default(), "worker-1");
        queue.initialize().await.unwrap();
        assert_eq!(*queue.dao.reclaimed.lock().unwrap(), 1);
    }
}
