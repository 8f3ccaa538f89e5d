//! The public bus facade (spec §4.F): the only externally visible contract.
//! Wires the DB-backed queue, the dispatch delegate, and the lifecycle
//! runner into `start`/`stop`/`post`/`register`/`unregister` and the eight
//! inspection queries.

use std::sync::Arc;

use anyhow::Result;
use qbus_core::{EventBusError, EventCodec, JsonEventCodec, NewEventRow, SearchKeys};
use qbus_db::{DbBackedQueue, PostedHandle, QueueDao};
use qbus_dispatch::{DispatchDelegate, EventHandler, HandlerId};
use qbus_runtime::{Runtime, RuntimeConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Policy for handling a storage failure during non-transactional `post`
/// (spec §9 Open Question): by default the bus preserves the source's
/// "log and swallow" behavior; strict mode propagates the error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFailurePolicy {
    LogAndSwallow,
    Strict,
}

impl Default for PublishFailurePolicy {
    fn default() -> Self {
        PublishFailurePolicy::LogAndSwallow
    }
}

/// Everything needed to publish an event: its type tag, correlation
/// handles, and the producing process's identity.
#[derive(Debug, Clone)]
pub struct Publish {
    pub class_name: String,
    pub search_key1: Option<i64>,
    pub search_key2: i64,
    pub user_token: Uuid,
}

pub struct EventBus<D: QueueDao + 'static> {
    queue: Arc<DbBackedQueue<D>>,
    dispatch: Arc<DispatchDelegate>,
    runtime: Runtime<D>,
    codec: JsonEventCodec,
    creator_name: String,
    publish_failure_policy: PublishFailurePolicy,
}

impl<D: QueueDao + 'static> EventBus<D> {
    pub fn new(
        queue: Arc<DbBackedQueue<D>>,
        dispatch: Arc<DispatchDelegate>,
        runtime_config: RuntimeConfig,
        creator_name: impl Into<String>,
    ) -> Self {
        let runtime = Runtime::new(queue.clone(), dispatch.clone(), runtime_config);
        Self {
            queue,
            dispatch,
            runtime,
            codec: JsonEventCodec,
            creator_name: creator_name.into(),
            publish_failure_policy: PublishFailurePolicy::default(),
        }
    }

    pub fn with_publish_failure_policy(mut self, policy: PublishFailurePolicy) -> Self {
        self.publish_failure_policy = policy;
        self
    }

    pub async fn start(&self) -> Result<()> {
        self.runtime.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.runtime.stop().await
    }

    pub async fn is_started(&self) -> bool {
        self.runtime.is_started().await
    }

    /// Register `handler` for `class_name`. A no-op (logged WARN) if the
    /// bus is not STARTED (spec §4.E, §7 "Lifecycle misuse").
    pub async fn register<E, H>(&self, class_name: impl Into<String>, handler: H) -> Option<HandlerId>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        H: EventHandler<E> + 'static,
    {
        let class_name = class_name.into();
        if !self.is_started().await {
            tracing::warn!(class_name, "register called while bus is not started, ignoring");
            return None;
        }
        Some(self.dispatch.register::<E, H>(class_name, handler).await)
    }

    /// A no-op (logged WARN) if the bus is not STARTED.
    pub async fn unregister(&self, id: HandlerId) {
        if !self.is_started().await {
            tracing::warn!("unregister called while bus is not started, ignoring");
            return;
        }
        self.dispatch.unregister(id).await;
    }

    /// Publish unconditionally. Encoding failure is always logged and
    /// swallowed (spec §7 error kind 1). A DAO failure is logged and
    /// swallowed under the default policy, or propagated under
    /// [`PublishFailurePolicy::Strict`] (spec §9 Open Question).
    pub async fn post<E: Serialize>(&self, meta: Publish, event: &E) -> Result<()> {
        if !self.is_started().await {
            tracing::warn!(class_name = %meta.class_name, "post called while bus is not started, ignoring");
            return Ok(());
        }

        let event_json = match self.codec.encode_value(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, class_name = %meta.class_name, "post: encoding failed, event dropped");
                return Ok(());
            }
        };

        let row = NewEventRow {
            class_name: meta.class_name.clone(),
            event_json,
            user_token: meta.user_token,
            search_key1: meta.search_key1,
            search_key2: meta.search_key2,
            creator_name: self.creator_name.clone(),
        };

        match self.queue.post(row).await {
            Ok(_) => Ok(()),
            Err(e) if self.publish_failure_policy == PublishFailurePolicy::Strict => Err(e),
            Err(e) => {
                tracing::error!(error = %e, class_name = %meta.class_name, "post: storage failure, event dropped");
                Ok(())
            }
        }
    }

    /// Publish bound to `tx`. Encoding failure is logged WARN and the row
    /// is simply not inserted, leaving the caller's transaction unaffected
    /// (spec §4.F). A DAO failure propagates, since it reflects a failed
    /// statement inside the caller's own transaction.
    pub async fn post_from_transaction<E: Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        meta: Publish,
        event: &E,
    ) -> Result<Option<PostedHandle>> {
        let event_json = match self.codec.encode_value(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, class_name = %meta.class_name, "post_from_transaction: encoding failed, skipping insert");
                return Ok(None);
            }
        };

        let row = NewEventRow {
            class_name: meta.class_name,
            event_json,
            user_token: meta.user_token,
            search_key1: meta.search_key1,
            search_key2: meta.search_key2,
            creator_name: self.creator_name.clone(),
        };

        let (_inserted, handle) = self.queue.post_from_transaction(tx, row).await?;
        Ok(Some(handle))
    }

    // --- Inspection queries: permitted in any lifecycle state (spec §4.F) ---

    pub async fn get_ready(&self, search_key2: i64) -> Result<Vec<qbus_core::EventRow>> {
        self.queue.get_ready(SearchKeys::new(search_key2)).await
    }

    pub async fn get_ready_with_both_keys(&self, search_key1: i64, search_key2: i64) -> Result<Vec<qbus_core::EventRow>> {
        self.queue
            .get_ready(SearchKeys::new(search_key2).with_key1(search_key1))
            .await
    }

    pub async fn get_ready_or_in_processing(&self, search_key2: i64) -> Result<Vec<qbus_core::EventRow>> {
        self.queue
            .get_ready_or_in_processing(SearchKeys::new(search_key2))
            .await
    }

    pub async fn get_ready_or_in_processing_with_both_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<qbus_core::EventRow>> {
        self.queue
            .get_ready_or_in_processing(SearchKeys::new(search_key2).with_key1(search_key1))
            .await
    }

    pub async fn get_ready_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        search_key2: i64,
    ) -> Result<Vec<qbus_core::EventRow>> {
        self.queue.get_ready_in_transaction(tx, SearchKeys::new(search_key2)).await
    }

    pub async fn get_ready_with_both_keys_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<qbus_core::EventRow>> {
        self.queue
            .get_ready_in_transaction(tx, SearchKeys::new(search_key2).with_key1(search_key1))
            .await
    }

    pub async fn get_ready_or_in_processing_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        search_key2: i64,
    ) -> Result<Vec<qbus_core::EventRow>> {
        self.queue
            .get_ready_or_in_processing_in_transaction(tx, SearchKeys::new(search_key2))
            .await
    }

    pub async fn get_ready_or_in_processing_with_both_keys_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<qbus_core::EventRow>> {
        self.queue
            .get_ready_or_in_processing_in_transaction(tx, SearchKeys::new(search_key2).with_key1(search_key1))
            .await
    }

    pub async fn get_in_processing(&self) -> Result<Vec<qbus_core::EventRow>> {
        self.queue.get_in_processing().await
    }
}

pub use qbus_runtime::LifecycleState as BusLifecycleState;
