//! Consumer pool that claims queued tasks and dispatches them to the extraction worker

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extraction::{ExtractionClient, ExtractionRequest};
use super::producer::TaskProducer;
use super::types::ExecutionStats;
use crate::config::Config;
use crate::errors::{AppResult, StoreError};
use crate::models::{CompletedTask, FailedTask, Task};
use crate::store::QueueStore;

/// Tunables for a [`ConsumerPool`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// Expiry of completed and failed records
    pub record_ttl: Duration,
    /// How long shutdown waits for in-flight dispatches
    pub shutdown_grace: Duration,
}

impl From<&Config> for ConsumerSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue_name: config.queue.name.clone(),
            max_concurrent: config.queue.max_concurrent,
            poll_interval: config.queue.poll_interval,
            max_retries: config.queue.max_retries,
            record_ttl: config.retention.max_age,
            shutdown_grace: config.web.shutdown_grace,
        }
    }
}

/// Decrements the in-flight counter when a dispatch finishes, even on panic
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a spawned dispatch needs, detached from the pool itself
#[derive(Clone)]
struct Dispatcher {
    queue_name: String,
    store: Arc<dyn QueueStore>,
    producer: TaskProducer,
    extractor: Arc<dyn ExtractionClient>,
    max_retries: u32,
    record_ttl: Duration,
    poll_interval: Duration,
}

/// Ceiling on the outcome-write backoff, in poll intervals
const MAX_BACKOFF_INTERVALS: u32 = 30;

impl Dispatcher {
    async fn process(&self, task: Task, cancellation_token: &CancellationToken) -> AppResult<()> {
        let request = ExtractionRequest {
            url: task.url.clone(),
            depth: task.depth,
            task_id: task.task_id.clone(),
        };

        match self.extractor.extract(&request).await {
            Ok(result) => {
                let record = CompletedTask {
                    task,
                    completed_at: Utc::now(),
                    result,
                };
                let completed = &record;
                self.persist(&completed.task.task_id, cancellation_token, move || {
                    self.store
                        .record_completed(&self.queue_name, completed, self.record_ttl)
                })
                .await?;
                info!("Task {} completed", record.task.task_id);
            }
            Err(e) if task.retry_count < self.max_retries => {
                let retry = task.next_attempt(&e.to_string(), Utc::now());
                warn!(
                    "Task {} failed (attempt {}), retrying: {}",
                    task.task_id, retry.retry_count, e
                );
                let retry = &retry;
                self.persist(&retry.task_id, cancellation_token, move || {
                    self.producer.requeue(&self.queue_name, retry)
                })
                .await?;
            }
            Err(e) => {
                error!(
                    "Task {} failed permanently after {} retries: {}",
                    task.task_id, task.retry_count, e
                );
                let record = FailedTask {
                    task,
                    failed_at: Utc::now(),
                    error: e.to_string(),
                };
                let failed = &record;
                self.persist(&failed.task.task_id, cancellation_token, move || {
                    self.store
                        .record_failed(&self.queue_name, failed, self.record_ttl)
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Retry an outcome write with a growing wait until it lands or the pool shuts down
    ///
    /// Until the write lands the claimed task exists only in this dispatch.
    async fn persist<F, Fut, E>(
        &self,
        task_id: &str,
        cancellation_token: &CancellationToken,
        mut write: F,
    ) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 1;
        loop {
            let error = match write().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if cancellation_token.is_cancelled() {
                return Err(error);
            }

            let backoff = self.poll_interval * attempt.min(MAX_BACKOFF_INTERVALS);
            warn!(
                "Recording outcome of task {} failed (attempt {}), retrying in {:?}: {}",
                task_id, attempt, backoff, error
            );
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = cancellation_token.cancelled() => return Err(error),
            }
            attempt += 1;
        }
    }
}

/// Bounded-concurrency loop over a single queue
pub struct ConsumerPool {
    dispatcher: Dispatcher,
    max_concurrent: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    cancellation: Mutex<Option<CancellationToken>>,
}

impl ConsumerPool {
    pub fn new(
        store: Arc<dyn QueueStore>,
        producer: TaskProducer,
        extractor: Arc<dyn ExtractionClient>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                queue_name: settings.queue_name,
                store,
                producer,
                extractor,
                max_retries: settings.max_retries,
                record_ttl: settings.record_ttl,
                poll_interval: settings.poll_interval,
            },
            max_concurrent: Arc::new(AtomicUsize::new(settings.max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            poll_interval: settings.poll_interval,
            shutdown_grace: settings.shutdown_grace,
            cancellation: Mutex::new(None),
        }
    }

    /// Spawn the polling loop with `concurrency_limit` slots
    ///
    /// The loop stops when [`ConsumerPool::stop`] is called or `parent` is
    /// cancelled. Starting an already running pool only updates the limit.
    pub fn start(
        self: &Arc<Self>,
        concurrency_limit: usize,
        parent: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        self.update_limit(concurrency_limit);

        let token = {
            let mut slot = match self.cancellation.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
                debug!("Consumer pool already running");
                return None;
            }
            let token = parent.child_token();
            *slot = Some(token.clone());
            token
        };

        let pool = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = pool.run(token).await {
                error!("Consumer pool stopped with error: {}", e);
            }
        }))
    }

    /// Signal the polling loop to stop; in-flight dispatches run to completion
    pub fn stop(&self) {
        let slot = match self.cancellation.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(token) = slot.as_ref() {
            info!("Stopping consumer pool");
            token.cancel();
        }
    }

    /// Run the polling loop until `cancellation_token` fires
    pub async fn run(&self, cancellation_token: CancellationToken) -> AppResult<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting consumer pool for queue '{}' (max concurrent: {}, poll interval: {:?})",
            self.dispatcher.queue_name,
            self.max_concurrent.load(Ordering::Relaxed),
            self.poll_interval
        );

        while !cancellation_token.is_cancelled() {
            let busy = self.in_flight.load(Ordering::SeqCst)
                >= self.max_concurrent.load(Ordering::Relaxed);
            if busy {
                self.idle(&cancellation_token).await;
                continue;
            }

            match self.dispatcher.store.claim_highest(&self.dispatcher.queue_name).await {
                Ok(Some(task)) => self.dispatch(task, &cancellation_token),
                Ok(None) => self.idle(&cancellation_token).await,
                Err(StoreError::CorruptRecord { key, message }) => {
                    warn!("Discarded undecodable task from {}: {}", key, message);
                }
                Err(e) => {
                    error!("Failed to claim task: {}", e);
                    self.idle(&cancellation_token).await;
                }
            }
        }

        info!("Consumer pool received cancellation signal");
        self.wait_for_in_flight_to_complete().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Consumer pool stopped");
        Ok(())
    }

    async fn idle(&self, cancellation_token: &CancellationToken) {
        tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = cancellation_token.cancelled() => {}
        }
    }

    fn dispatch(&self, task: Task, cancellation_token: &CancellationToken) {
        let guard = InFlightGuard::acquire(&self.in_flight);
        let dispatcher = self.dispatcher.clone();
        let cancellation_token = cancellation_token.clone();

        info!(
            "Claimed task {} (priority: {}, retry: {})",
            task.task_id, task.priority, task.retry_count
        );

        tokio::spawn(async move {
            let _guard = guard;
            let task_id = task.task_id.clone();
            let start_time = std::time::Instant::now();
            if let Err(e) = dispatcher.process(task, &cancellation_token).await {
                error!("Failed to record outcome of task {}: {}", task_id, e);
            }
            debug!("Task {} finished in {:?}", task_id, start_time.elapsed());
        });
    }

    /// Wait for running dispatches during shutdown, bounded by the grace period
    async fn wait_for_in_flight_to_complete(&self) {
        let deadline = Instant::now() + self.shutdown_grace;
        let mut check_interval = interval(Duration::from_millis(100));

        loop {
            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                info!("All in-flight tasks completed");
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Timeout waiting for {} in-flight tasks, proceeding with shutdown",
                    in_flight
                );
                break;
            }
            debug!("Still waiting for {} in-flight tasks...", in_flight);
            check_interval.tick().await;
        }
    }

    /// Update the concurrency ceiling at runtime
    pub fn update_limit(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let old_limit = self.max_concurrent.swap(new_limit, Ordering::Relaxed);
        if old_limit != new_limit {
            info!("Updated consumer concurrency limit from {} to {}", old_limit, new_limit);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        ExecutionStats {
            running: self.running.load(Ordering::SeqCst),
            in_flight: self.in_flight(),
            max_concurrent: self.max_concurrent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{StoreResult, UpstreamError, UpstreamResult};
    use crate::models::{PriorityClass, TaskDraft, TaskState, TerminalKind, Trigger};
    use crate::store::{InMemoryQueueStore, QueueCounts, TerminalEntry};
    use async_trait::async_trait;

    /// Fails every call until `failures` calls have been made
    struct ScriptedExtractor {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl ScriptedExtractor {
        fn new(failures: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                delay,
            })
        }
    }

    #[async_trait]
    impl ExtractionClient for ScriptedExtractor {
        async fn extract(&self, request: &ExtractionRequest) -> UpstreamResult<serde_json::Value> {
            sleep(self.delay).await;
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(UpstreamError::Status {
                    status: 500,
                    message: format!("attempt {call} failed"),
                })
            } else {
                Ok(serde_json::json!({"taskId": request.task_id}))
            }
        }
    }

    /// In-memory store whose first `completed_failures` completed-record writes fail
    struct FlakyStore {
        inner: InMemoryQueueStore,
        completed_failures: AtomicUsize,
        completed_attempts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(completed_failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryQueueStore::new(),
                completed_failures: AtomicUsize::new(completed_failures),
                completed_attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl QueueStore for FlakyStore {
        async fn push_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()> {
            self.inner.push_task(queue, task, rank).await
        }

        async fn claim_highest(&self, queue: &str) -> StoreResult<Option<Task>> {
            self.inner.claim_highest(queue).await
        }

        async fn remove_task(&self, queue: &str, task_id: &str) -> StoreResult<bool> {
            self.inner.remove_task(queue, task_id).await
        }

        async fn list_queued(&self, queue: &str) -> StoreResult<Vec<Task>> {
            self.inner.list_queued(queue).await
        }

        async fn requeue_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()> {
            self.inner.requeue_task(queue, task, rank).await
        }

        async fn record_completed(
            &self,
            queue: &str,
            record: &CompletedTask,
            ttl: Duration,
        ) -> StoreResult<()> {
            self.completed_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.completed_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.completed_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::ConnectionFailed {
                    message: "connection reset".to_string(),
                });
            }
            self.inner.record_completed(queue, record, ttl).await
        }

        async fn record_failed(
            &self,
            queue: &str,
            record: &FailedTask,
            ttl: Duration,
        ) -> StoreResult<()> {
            self.inner.record_failed(queue, record, ttl).await
        }

        async fn terminal_entries(
            &self,
            queue: &str,
            kind: TerminalKind,
        ) -> StoreResult<Vec<TerminalEntry>> {
            self.inner.terminal_entries(queue, kind).await
        }

        async fn terminal_record(
            &self,
            queue: &str,
            kind: TerminalKind,
            task_id: &str,
        ) -> StoreResult<Option<serde_json::Value>> {
            self.inner.terminal_record(queue, kind, task_id).await
        }

        async fn purge_terminal(
            &self,
            queue: &str,
            kind: TerminalKind,
            task_ids: &[String],
        ) -> StoreResult<usize> {
            self.inner.purge_terminal(queue, kind, task_ids).await
        }

        async fn task_state(&self, queue: &str, task_id: &str) -> StoreResult<Option<TaskState>> {
            self.inner.task_state(queue, task_id).await
        }

        async fn queue_counts(&self, queue: &str) -> StoreResult<QueueCounts> {
            self.inner.queue_counts(queue).await
        }

        async fn clear_queue(&self, queue: &str) -> StoreResult<usize> {
            self.inner.clear_queue(queue).await
        }

        async fn save_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
            self.inner.save_trigger(trigger).await
        }

        async fn update_trigger(&self, trigger: &Trigger) -> StoreResult<bool> {
            self.inner.update_trigger(trigger).await
        }

        async fn load_triggers(&self) -> StoreResult<Vec<Trigger>> {
            self.inner.load_triggers().await
        }

        async fn delete_trigger(&self, trigger_id: &str) -> StoreResult<bool> {
            self.inner.delete_trigger(trigger_id).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    fn settings(max_concurrent: usize) -> ConsumerSettings {
        ConsumerSettings {
            queue_name: "crawler".to_string(),
            max_concurrent,
            poll_interval: Duration::from_millis(10),
            max_retries: 3,
            record_ttl: Duration::from_secs(7 * 24 * 3600),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn pool_with(
        extractor: Arc<dyn ExtractionClient>,
        max_concurrent: usize,
    ) -> (Arc<ConsumerPool>, Arc<InMemoryQueueStore>, TaskProducer) {
        let store = Arc::new(InMemoryQueueStore::new());
        let producer = TaskProducer::new(store.clone());
        let pool = Arc::new(ConsumerPool::new(
            store.clone(),
            producer.clone(),
            extractor,
            settings(max_concurrent),
        ));
        (pool, store, producer)
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if condition().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_failed_outcome_write_is_retried() {
        let store = FlakyStore::new(2);
        let producer = TaskProducer::new(store.clone());
        let pool = Arc::new(ConsumerPool::new(
            store.clone(),
            producer.clone(),
            ScriptedExtractor::new(0, Duration::ZERO),
            settings(5),
        ));
        let id = producer
            .enqueue("crawler", TaskDraft::new("https://a.example", 2), PriorityClass::Normal)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = pool.start(5, &shutdown).unwrap();

        wait_until(|| {
            let store = store.clone();
            let id = id.clone();
            async move {
                store.task_state("crawler", &id).await.unwrap() == Some(TaskState::Completed)
            }
        })
        .await;

        assert_eq!(store.completed_attempts.load(Ordering::SeqCst), 3);
        let counts = store.queue_counts("crawler").await.unwrap();
        assert_eq!((counts.processing, counts.completed), (0, 1));

        pool.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_success_writes_completed_record() {
        let (pool, store, producer) = pool_with(ScriptedExtractor::new(0, Duration::ZERO), 5);
        let id = producer
            .enqueue("crawler", TaskDraft::new("https://a.example", 2), PriorityClass::High)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = pool.start(5, &shutdown).unwrap();

        wait_until(|| {
            let store = store.clone();
            let id = id.clone();
            async move {
                store.task_state("crawler", &id).await.unwrap() == Some(TaskState::Completed)
            }
        })
        .await;

        let record = store
            .terminal_record("crawler", TerminalKind::Completed, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["result"]["taskId"], id.as_str());

        pool.stop();
        handle.await.unwrap();
        assert!(!pool.execution_stats().running);
    }

    #[tokio::test]
    async fn test_four_failures_end_in_failed_record() {
        let extractor = ScriptedExtractor::new(usize::MAX, Duration::ZERO);
        let (pool, store, producer) = pool_with(extractor.clone(), 1);
        let id = producer
            .enqueue("crawler", TaskDraft::new("https://down.example", 2), PriorityClass::High)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = pool.start(1, &shutdown).unwrap();

        wait_until(|| {
            let store = store.clone();
            let id = id.clone();
            async move { store.task_state("crawler", &id).await.unwrap() == Some(TaskState::Failed) }
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 4);
        let record = store
            .terminal_record("crawler", TerminalKind::Failed, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["retryCount"], 3);
        assert!(record["error"].as_str().unwrap().contains("attempt 3 failed"));
        let counts = store.queue_counts("crawler").await.unwrap();
        assert_eq!((counts.pending, counts.processing), (0, 0));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (pool, store, producer) = pool_with(ScriptedExtractor::new(2, Duration::ZERO), 1);
        let id = producer
            .enqueue("crawler", TaskDraft::new("https://flaky.example", 2), PriorityClass::Medium)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = pool.start(1, &shutdown).unwrap();

        wait_until(|| {
            let store = store.clone();
            let id = id.clone();
            async move {
                store.task_state("crawler", &id).await.unwrap() == Some(TaskState::Completed)
            }
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap();

        let record = store
            .terminal_record("crawler", TerminalKind::Completed, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["retryCount"], 2);
        assert!(record["lastError"].as_str().unwrap().contains("attempt 1 failed"));
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let (pool, store, producer) =
            pool_with(ScriptedExtractor::new(0, Duration::from_millis(100)), 2);
        for n in 0..5 {
            producer
                .enqueue(
                    "crawler",
                    TaskDraft::new(format!("https://{n}.example"), 1),
                    PriorityClass::Normal,
                )
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = pool.start(2, &shutdown).unwrap();

        let mut max_processing = 0;
        for _ in 0..100 {
            let counts = store.queue_counts("crawler").await.unwrap();
            max_processing = max_processing.max(counts.processing);
            assert!(pool.in_flight() <= 2);
            if counts.completed == 5 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert!(max_processing <= 2, "saw {max_processing} tasks processing");
        assert_eq!(store.queue_counts("crawler").await.unwrap().completed, 5);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_work() {
        let (pool, store, producer) =
            pool_with(ScriptedExtractor::new(0, Duration::from_millis(200)), 1);
        let id = producer
            .enqueue("crawler", TaskDraft::new("https://slow.example", 1), PriorityClass::Normal)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = pool.start(1, &shutdown).unwrap();
        wait_until(|| {
            let pool = pool.clone();
            async move { pool.in_flight() == 1 }
        })
        .await;

        pool.stop();
        handle.await.unwrap();

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(
            store.task_state("crawler", &id).await.unwrap(),
            Some(TaskState::Completed)
        );
    }

    #[tokio::test]
    async fn test_second_start_only_updates_limit() {
        let (pool, _, _) = pool_with(ScriptedExtractor::new(0, Duration::ZERO), 1);
        let shutdown = CancellationToken::new();

        let handle = pool.start(1, &shutdown).unwrap();
        assert!(pool.start(4, &shutdown).is_none());
        assert_eq!(pool.execution_stats().max_concurrent, 4);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
