//! The lifecycle runner (spec §4.E): a bounded worker pool and poll loop
//! that claims ready rows, dispatches them, and accounts for retries and
//! terminal moves.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use qbus_core::backoff::RetryBackoff;
use qbus_core::EventRow;
use qbus_db::{DbBackedQueue, QueueDao};
use qbus_dispatch::DispatchDelegate;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

/// Tunables for one runner instance (spec §6's `nbThreads`, `pollInterval`,
/// `claimBatchSize`, `claimLease`, `maxFailureRetries`, `retryBackoff`).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub nb_threads: usize,
    pub poll_interval: Duration,
    pub claim_batch_size: i64,
    pub claim_lease: Duration,
    pub max_failure_retries: i32,
    pub retry_backoff: RetryBackoff,
    /// Bound on how long `stop()` waits for in-flight dispatches to drain.
    pub shutdown_deadline: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nb_threads: 4,
            poll_interval: Duration::from_secs(1),
            claim_batch_size: 50,
            claim_lease: Duration::from_secs(30),
            max_failure_retries: 5,
            retry_backoff: RetryBackoff::default(),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

/// Start/stop state machine (spec §4.E: `NEW -> STARTED -> STOPPED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Started,
    Stopped,
}

enum Outcome {
    Processed(i64),
    Failed(i64, i32),
    Retried(i64, i32, Duration),
}

/// Owns the worker pool and poll loop over a single queue table.
pub struct Runtime<D: QueueDao + 'static> {
    queue: Arc<DbBackedQueue<D>>,
    dispatch: Arc<DispatchDelegate>,
    config: RuntimeConfig,
    state: Mutex<LifecycleState>,
    driver: Mutex<Option<DriverHandle>>,
}

struct DriverHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl<D: QueueDao + 'static> Runtime<D> {
    pub fn new(queue: Arc<DbBackedQueue<D>>, dispatch: Arc<DispatchDelegate>, config: RuntimeConfig) -> Self {
        Self {
            queue,
            dispatch,
            config,
            state: Mutex::new(LifecycleState::New),
            driver: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub async fn is_started(&self) -> bool {
        matches!(self.state().await, LifecycleState::Started)
    }

    /// Idempotent: initializes the queue (reclaiming stale leases) and
    /// launches the poll loop. No-op if already STARTED.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == LifecycleState::Started {
            return Ok(());
        }

        self.queue.initialize().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = self.queue.clone();
        let dispatch = self.dispatch.clone();
        let config = self.config.clone();

        let join = tokio::spawn(async move {
            run_poll_loop(queue, dispatch, config, shutdown_rx).await;
        });

        *self.driver.lock().await = Some(DriverHandle { shutdown_tx, join });
        *state = LifecycleState::Started;
        tracing::info!("runtime started");
        Ok(())
    }

    /// Idempotent: signals the poll loop to drain in-flight work, then
    /// joins it within `shutdown_deadline`.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != LifecycleState::Started {
            return Ok(());
        }

        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.shutdown_tx.send(true);
            match tokio::time::timeout(self.config.shutdown_deadline, handle.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "poll loop task panicked"),
                Err(_) => tracing::warn!("poll loop did not drain within the shutdown deadline"),
            }
        }

        *state = LifecycleState::Stopped;
        tracing::info!("runtime stopped");
        Ok(())
    }
}

async fn run_poll_loop<D: QueueDao + 'static>(
    queue: Arc<DbBackedQueue<D>>,
    dispatch: Arc<DispatchDelegate>,
    config: RuntimeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let full_batch = match process_one_batch(&queue, &dispatch, &config).await {
            Ok(full) => full,
            Err(e) => {
                tracing::error!(error = %e, "poll tick failed");
                false
            }
        };

        // A full batch signals backlog: re-tick immediately (spec §4.E).
        if full_batch {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// One claim -> dispatch -> accounting -> terminal-move cycle.
/// Returns `true` iff the claimed batch was full (signaling backlog).
async fn process_one_batch<D: QueueDao + 'static>(
    queue: &Arc<DbBackedQueue<D>>,
    dispatch: &Arc<DispatchDelegate>,
    config: &RuntimeConfig,
) -> Result<bool> {
    let rows = queue
        .claim_ready(config.claim_lease, config.claim_batch_size)
        .await?;

    if rows.is_empty() {
        return Ok(false);
    }

    let full_batch = rows.len() as i64 >= config.claim_batch_size;
    let semaphore = Arc::new(Semaphore::new(config.nb_threads.max(1)));
    let mut tasks = Vec::with_capacity(rows.len());

    for row in rows {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let dispatch = dispatch.clone();
        let max_retries = config.max_failure_retries;
        let backoff = config.retry_backoff;

        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            process_row(row, &dispatch, max_retries, backoff).await
        }));
    }

    let mut processed_ids = Vec::new();
    let mut failed = Vec::new();

    for task in tasks {
        match task.await {
            Ok(Outcome::Processed(id)) => processed_ids.push(id),
            Ok(Outcome::Failed(id, error_count)) => failed.push((id, error_count)),
            Ok(Outcome::Retried(id, error_count, backoff)) => {
                queue.update_on_error(id, error_count, backoff).await?;
            }
            Err(join_err) => tracing::error!(error = %join_err, "dispatch task panicked"),
        }
    }

    queue.move_to_history(&processed_ids, &failed).await?;

    Ok(full_batch)
}

async fn process_row(
    row: EventRow,
    dispatch: &DispatchDelegate,
    max_retries: i32,
    backoff: RetryBackoff,
) -> Outcome {
    let outcome = dispatch.dispatch(&row.class_name, &row.event_json).await;

    if outcome.is_success() {
        return Outcome::Processed(row.record_id);
    }

    let next_error_count = row.error_count + 1;
    let cause = outcome
        .first_failure
        .map(|e| e.to_string())
        .unwrap_or_default();

    if next_error_count <= max_retries {
        tracing::info!(
            record_id = row.record_id,
            error_count = next_error_count,
            cause = %cause,
            "dispatch failed, scheduling retry"
        );
        Outcome::Retried(row.record_id, next_error_count, backoff.delay_for(next_error_count))
    } else {
        tracing::error!(
            record_id = row.record_id,
            error_count = next_error_count,
            cause = %cause,
            "dispatch failed, retries exhausted"
        );
        Outcome::Failed(row.record_id, next_error_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qbus_core::{NewEventRow, ProcessingState, SearchKeys};
    use qbus_dispatch::EventHandler;
    use serde::{Deserialize, Serialize};
    use sqlx::{Postgres, Transaction};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        name: String,
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl EventHandler<Widget> for AlwaysFailHandler {
        async fn handle(&self, _event: &Widget) -> Result<(), qbus_core::EventBusError> {
            Err(qbus_core::EventBusError::Handler("nope".to_string()))
        }
    }

    struct AlwaysOkHandler;

    #[async_trait]
    impl EventHandler<Widget> for AlwaysOkHandler {
        async fn handle(&self, _event: &Widget) -> Result<(), qbus_core::EventBusError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDao {
        rows: StdMutex<Vec<EventRow>>,
        errored: StdMutex<Vec<(i64, i32, Duration)>>,
        moved: StdMutex<(Vec<i64>, Vec<(i64, i32)>)>,
    }

    #[async_trait]
    impl QueueDao for FakeDao {
        async fn insert(&self, _row: NewEventRow) -> anyhow::Result<EventRow> {
            unimplemented!()
        }

        async fn insert_from_transaction(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _row: NewEventRow,
        ) -> anyhow::Result<EventRow> {
            unimplemented!()
        }

        async fn claim_ready(
            &self,
            _owner_tag: &str,
            _lease: Duration,
            _limit: i64,
        ) -> anyhow::Result<Vec<EventRow>> {
            Ok(std::mem::take(&mut *self.rows.lock().unwrap()))
        }

        async fn update_on_error(&self, record_id: i64, error_count: i32, backoff: Duration) -> anyhow::Result<()> {
            self.errored.lock().unwrap().push((record_id, error_count, backoff));
            Ok(())
        }

        async fn move_to_history(&self, processed_ids: &[i64], failed: &[(i64, i32)]) -> anyhow::Result<()> {
            let mut moved = self.moved.lock().unwrap();
            moved.0.extend_from_slice(processed_ids);
            moved.1.extend_from_slice(failed);
            Ok(())
        }

        async fn get_in_processing(&self) -> anyhow::Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready(&self, _keys: SearchKeys) -> anyhow::Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready_or_in_processing(&self, _keys: SearchKeys) -> anyhow::Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready_in_transaction(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _keys: SearchKeys,
        ) -> anyhow::Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn get_ready_or_in_processing_in_transaction(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _keys: SearchKeys,
        ) -> anyhow::Result<Vec<EventRow>> {
            Ok(vec![])
        }

        async fn reclaim_stale_leases(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    fn sample_row(record_id: i64, error_count: i32) -> EventRow {
        EventRow {
            record_id,
            class_name: "Widget".to_string(),
            event_json: serde_json::to_value(Widget { name: "gadget".to_string() }).unwrap(),
            user_token: uuid::Uuid::new_v4(),
            search_key1: None,
            search_key2: 1,
            created_date: chrono::Utc::now(),
            creator_name: "test".to_string(),
            processing_owner: Some("worker-1".to_string()),
            processing_available_date: None,
            processing_state: ProcessingState::InProcessing,
            error_count,
        }
    }

    #[tokio::test]
    async fn successful_dispatch_stages_a_processed_row() {
        let dispatch = Arc::new(DispatchDelegate::new());
        dispatch.register::<Widget, _>("Widget", AlwaysOkHandler).await;

        let dao = Arc::new(FakeDao::default());
        dao.rows.lock().unwrap().push(sample_row(1, 0));
        let queue = Arc::new(DbBackedQueue::from_arc(dao.clone(), "worker-1"));

        let config = RuntimeConfig {
            nb_threads: 2,
            claim_batch_size: 10,
            ..RuntimeConfig::default()
        };

        process_one_batch(&queue, &dispatch, &config).await.unwrap();

        let moved = dao.moved.lock().unwrap();
        assert_eq!(moved.0, vec![1]);
        assert!(moved.1.is_empty());
    }

    #[tokio::test]
    async fn failure_under_the_retry_limit_schedules_a_retry() {
        let dispatch = Arc::new(DispatchDelegate::new());
        dispatch.register::<Widget, _>("Widget", AlwaysFailHandler).await;

        let dao = Arc::new(FakeDao::default());
        dao.rows.lock().unwrap().push(sample_row(7, 0));
        let queue = Arc::new(DbBackedQueue::from_arc(dao.clone(), "worker-1"));

        let config = RuntimeConfig {
            max_failure_retries: 5,
            claim_batch_size: 10,
            ..RuntimeConfig::default()
        };

        process_one_batch(&queue, &dispatch, &config).await.unwrap();

        let errored = dao.errored.lock().unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].0, 7);
        assert_eq!(errored[0].1, 1);

        let moved = dao.moved.lock().unwrap();
        assert!(moved.0.is_empty() && moved.1.is_empty());
    }

    #[tokio::test]
    async fn failure_past_the_retry_limit_is_staged_failed() {
        let dispatch = Arc::new(DispatchDelegate::new());
        dispatch.register::<Widget, _>("Widget", AlwaysFailHandler).await;

        let dao = Arc::new(FakeDao::default());
        dao.rows.lock().unwrap().push(sample_row(9, 5));
        let queue = Arc::new(DbBackedQueue::from_arc(dao.clone(), "worker-1"));

        let config = RuntimeConfig {
            max_failure_retries: 5,
            claim_batch_size: 10,
            ..RuntimeConfig::default()
        };

        process_one_batch(&queue, &dispatch, &config).await.unwrap();

        let moved = dao.moved.lock().unwrap();
        assert_eq!(moved.1, vec![(9, 6)]);
        assert!(moved.0.is_empty());
    }

    #[tokio::test]
    async fn start_stop_is_idempotent_and_reaches_stopped() {
        let dispatch = Arc::new(DispatchDelegate::new());
        let dao = Arc::new(FakeDao::default());
        let queue = Arc::new(DbBackedQueue::from_arc(dao, "worker-1"));
        let runtime = Runtime::new(queue, dispatch, RuntimeConfig::default());

        assert_eq!(runtime.state().await, LifecycleState::New);

        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.is_started().await);

        runtime.stop().await.unwrap();
        runtime.stop().await.unwrap();
        assert_eq!(runtime.state().await, LifecycleState::Stopped);
    }
}
