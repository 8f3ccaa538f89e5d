//! Test fixtures for exercising the event bus end to end (spec §8
//! "Testable properties"): a Postgres-backed bus builder plus handler
//! doubles for the retry and concurrency scenarios.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use qbus_bus::EventBus;
use qbus_core::EventBusError;
use qbus_db::PgQueueDao;
use qbus_dispatch::{DispatchDelegate, EventHandler};
use qbus_runtime::RuntimeConfig;
use sqlx::PgPool;

pub use qbus_db::ENV_DB_URL;

/// Connect via `QBUS_DATABASE_URL`, ensure `table`'s schema exists, and
/// build a fully-wired bus over it.
pub async fn test_bus(table: &str, runtime_config: RuntimeConfig) -> Result<(EventBus<PgQueueDao>, PgPool)> {
    let pool = qbus_db::testkit_db_pool(table).await?;
    let dao = PgQueueDao::new(pool.clone(), table)?;
    let queue = Arc::new(qbus_db::DbBackedQueue::new(dao, format!("testkit-{table}")));
    let dispatch = Arc::new(DispatchDelegate::new());
    let bus = EventBus::new(queue, dispatch, runtime_config, "qbus-testkit");
    Ok((bus, pool))
}

/// Truncate both the live and history tables for a clean scenario run.
pub async fn truncate_queue_tables(pool: &PgPool, table: &str) -> Result<()> {
    sqlx::query(&format!("truncate table {table}"))
        .execute(pool)
        .await?;
    sqlx::query(&format!("truncate table {table}_history"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Records every delivery's thread id, keyed by an application-supplied
/// correlation key (handlers see only the decoded event, not the queue's
/// `record_id`, so the key extraction is left to the caller).
///
/// Flags [`RecordingHandler::overlap_detected`] if the same key is ever
/// in flight on two deliveries at once (spec §8 "no two deliveries
/// overlap for the same record").
pub struct RecordingHandler<E> {
    key_fn: Arc<dyn Fn(&E) -> String + Send + Sync>,
    in_flight_keys: Arc<Mutex<HashSet<String>>>,
    overlap: Arc<AtomicBool>,
    deliveries: Arc<Mutex<Vec<(String, std::thread::ThreadId)>>>,
}

impl<E> RecordingHandler<E> {
    pub fn new(key_fn: impl Fn(&E) -> String + Send + Sync + 'static) -> Self {
        Self {
            key_fn: Arc::new(key_fn),
            in_flight_keys: Arc::new(Mutex::new(HashSet::new())),
            overlap: Arc::new(AtomicBool::new(false)),
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub fn deliveries(&self) -> Vec<(String, std::thread::ThreadId)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> EventHandler<E> for RecordingHandler<E> {
    async fn handle(&self, event: &E) -> Result<(), EventBusError> {
        let key = (self.key_fn)(event);

        let first_observer = {
            let mut in_flight = self.in_flight_keys.lock().unwrap();
            in_flight.insert(key.clone())
        };
        if !first_observer {
            self.overlap.store(true, Ordering::SeqCst);
        }

        self.deliveries
            .lock()
            .unwrap()
            .push((key.clone(), std::thread::current().id()));

        // Give a genuinely concurrent caller a chance to interleave before
        // this delivery clears its key.
        tokio::task::yield_now().await;

        self.in_flight_keys.lock().unwrap().remove(&key);
        Ok(())
    }
}

/// Fails the first `fail_times` invocations, then always succeeds.
/// Grounds the "retry success" / "retry exhaustion" scenarios (spec §8).
pub struct FlakyHandler<E> {
    fail_times: usize,
    attempts: Arc<AtomicUsize>,
    _marker: PhantomData<fn(&E)>,
}

impl<E> FlakyHandler<E> {
    pub fn new(fail_times: usize) -> Self {
        Self {
            fail_times,
            attempts: Arc::new(AtomicUsize::new(0)),
            _marker: PhantomData,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> EventHandler<E> for FlakyHandler<E> {
    async fn handle(&self, _event: &E) -> Result<(), EventBusError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            Err(EventBusError::Handler(format!("flaky handler: induced failure #{attempt}")))
        } else {
            Ok(())
        }
    }
}

/// Always fails, used for the "retry exhaustion" scenario.
pub struct AlwaysFailHandler<E> {
    attempts: Arc<AtomicUsize>,
    _marker: PhantomData<fn(&E)>,
}

impl<E> Default for AlwaysFailHandler<E> {
    fn default() -> Self {
        Self {
            attempts: Arc::new(AtomicUsize::new(0)),
            _marker: PhantomData,
        }
    }
}

impl<E> AlwaysFailHandler<E> {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> EventHandler<E> for AlwaysFailHandler<E> {
    async fn handle(&self, _event: &E) -> Result<(), EventBusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EventBusError::Handler("always-fail handler".to_string()))
    }
}
