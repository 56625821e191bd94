//! Recurring crawl scheduler
//!
//! Owns the table of live trigger handles. Each handle is an independent
//! tokio task sleeping until its next cron tick; a firing enqueues a fresh
//! one-time task through the producer and stamps `lastRun` on the persisted
//! definition. Handles share only the store, the paused flag and the
//! scheduler's shutdown token.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::producer::TaskProducer;
use super::retention::RetentionSweeper;
use super::types::{
    CancelOutcome, FiringCounts, ScheduleRequest, SchedulerStatus, TriggerStatus,
};
use crate::errors::{AppError, AppResult};
use crate::models::{TaskDraft, TaskListing, Trigger};
use crate::store::QueueStore;
use crate::utils::cron_helper;

#[derive(Debug, Default)]
struct FiringStats {
    fired: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl FiringStats {
    fn snapshot(&self) -> FiringCounts {
        FiringCounts {
            fired: self.fired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.fired.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}

/// State shared by every trigger handle
#[derive(Clone)]
struct FiringContext {
    queue_name: String,
    store: Arc<dyn QueueStore>,
    producer: TaskProducer,
    paused: Arc<AtomicBool>,
    stats: Arc<FiringStats>,
}

impl FiringContext {
    /// Enqueue the task for one firing and record `lastRun`
    async fn fire(&self, trigger: &Trigger, fired_at: DateTime<Utc>) -> AppResult<String> {
        let task_id = self
            .producer
            .enqueue(&self.queue_name, trigger.firing_draft(fired_at), trigger.priority)
            .await?;

        let touched = Trigger {
            last_run: Some(fired_at),
            ..trigger.clone()
        };
        if !self.store.update_trigger(&touched).await? {
            warn!(
                "Trigger {} was deleted while firing; lastRun not recorded",
                trigger.task_id
            );
        }

        info!("Trigger {} fired task {}", trigger.task_id, task_id);
        Ok(task_id)
    }

    async fn run_trigger(
        self,
        trigger: Trigger,
        schedule: Schedule,
        cancellation_token: CancellationToken,
    ) {
        let mut cursor = Utc::now();

        loop {
            let Some(next) = cron_helper::next_after(&schedule, cursor) else {
                info!("Trigger {} has no future runs, handle exiting", trigger.task_id);
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancellation_token.cancelled() => {
                    debug!("Trigger {} handle cancelled", trigger.task_id);
                    break;
                }
            }
            // Missed ticks are skipped rather than replayed
            cursor = next.max(Utc::now());

            if self.paused.load(Ordering::SeqCst) {
                debug!("Scheduler paused, skipping firing of {}", trigger.task_id);
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match self.fire(&trigger, next).await {
                Ok(_) => {
                    self.stats.fired.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Trigger {} failed to fire: {}", trigger.task_id, e);
                }
            }
        }
    }
}

struct TriggerHandle {
    trigger: Trigger,
    schedule: Schedule,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TriggerHandle {
    fn next_run(&self) -> Option<DateTime<Utc>> {
        cron_helper::next_after(&self.schedule, Utc::now())
    }
}

/// Registers, runs and cancels recurring crawl triggers
pub struct CrawlScheduler {
    context: FiringContext,
    default_depth: u32,
    handles: TokioRwLock<HashMap<String, TriggerHandle>>,
    retention: Option<RetentionSweeper>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl CrawlScheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        producer: TaskProducer,
        queue_name: impl Into<String>,
        default_depth: u32,
    ) -> Self {
        Self {
            context: FiringContext {
                queue_name: queue_name.into(),
                store,
                producer,
                paused: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(FiringStats::default()),
            },
            default_depth,
            handles: TokioRwLock::new(HashMap::new()),
            retention: None,
            background: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run `sweeper` on its schedule once [`CrawlScheduler::init`] is called
    pub fn with_retention(mut self, sweeper: RetentionSweeper) -> Self {
        self.retention = Some(sweeper);
        self
    }

    /// Tie the scheduler's background work to an outer shutdown token
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.context.queue_name
    }

    /// Reload every persisted trigger and start the retention sweeper
    ///
    /// Must complete before requests are accepted. Returns the number of
    /// handles registered; definitions with an unparseable schedule are
    /// skipped and left in the store.
    pub async fn init(&self) -> AppResult<usize> {
        let triggers = self.context.store.load_triggers().await?;
        info!("Recovering {} persisted triggers", triggers.len());

        let mut registered = 0;
        for trigger in triggers {
            match cron_helper::parse_schedule(&trigger.schedule) {
                Ok(schedule) => {
                    self.register(trigger, schedule).await;
                    registered += 1;
                }
                Err(e) => warn!("Skipping trigger {}: {}", trigger.task_id, e),
            }
        }

        if let Some(sweeper) = self.retention.clone() {
            let token = self.shutdown.child_token();
            let handle = tokio::spawn(async move { sweeper.run(token).await });
            self.background.lock().await.push(handle);
        }

        info!("Scheduler initialized with {} live triggers", registered);
        Ok(registered)
    }

    /// Start (or replace) the live handle for `trigger`
    async fn register(&self, trigger: Trigger, schedule: Schedule) {
        let token = self.shutdown.child_token();
        let join = tokio::spawn(self.context.clone().run_trigger(
            trigger.clone(),
            schedule.clone(),
            token.clone(),
        ));

        let handle = TriggerHandle {
            trigger,
            schedule,
            token,
            join,
        };
        let trigger_id = handle.trigger.task_id.clone();
        debug!(
            "Registered trigger {} (next run: {:?})",
            trigger_id,
            handle.next_run()
        );

        if let Some(previous) = self.handles.write().await.insert(trigger_id.clone(), handle) {
            warn!("Replaced existing handle for trigger {}", trigger_id);
            previous.token.cancel();
        }
    }

    /// Crawl once now, or register a recurring trigger when a schedule is given
    pub async fn schedule_task(&self, request: ScheduleRequest) -> AppResult<String> {
        let url = request
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AppError::validation("URL is required"))?
            .to_string();
        let priority = request.priority.unwrap_or_default();
        let depth = request.depth.unwrap_or(self.default_depth);

        let Some(expression) = request.schedule_expression() else {
            let mut draft = TaskDraft::new(url, depth);
            draft.task_id = request.task_id.clone();
            return self
                .context
                .producer
                .enqueue(&self.context.queue_name, draft, priority)
                .await;
        };

        let schedule = cron_helper::parse_schedule(expression)?;
        let trigger = Trigger {
            task_id: request
                .task_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            url,
            depth,
            priority,
            schedule: expression.to_string(),
            last_run: None,
            created_at: Utc::now(),
        };

        self.context.store.save_trigger(&trigger).await?;
        let trigger_id = trigger.task_id.clone();
        info!(
            "Scheduled recurring crawl {} for {} ({})",
            trigger_id, trigger.url, trigger.schedule
        );
        self.register(trigger, schedule).await;
        Ok(trigger_id)
    }

    /// Stop a trigger or drop a pending task; succeeds when nothing matches
    pub async fn cancel_task(&self, task_id: &str) -> AppResult<CancelOutcome> {
        let handle = self.handles.write().await.remove(task_id);

        if let Some(handle) = handle {
            handle.token.cancel();
            self.context.store.delete_trigger(task_id).await?;
            info!("Cancelled trigger {}", task_id);
            return Ok(CancelOutcome::TriggerCancelled);
        }

        // A definition without a live handle (e.g. unparseable schedule) is still removed
        if self.context.store.delete_trigger(task_id).await? {
            info!("Deleted persisted trigger {} with no live handle", task_id);
            return Ok(CancelOutcome::TriggerCancelled);
        }

        if self
            .context
            .producer
            .remove(&self.context.queue_name, task_id)
            .await?
        {
            return Ok(CancelOutcome::QueuedRemoved);
        }

        debug!("Cancel of unknown task {} ignored", task_id);
        Ok(CancelOutcome::NotFound)
    }

    /// Persisted triggers followed by pending tasks
    pub async fn get_tasks(&self) -> AppResult<Vec<TaskListing>> {
        let triggers = self.context.store.load_triggers().await?;
        let queued = self
            .context
            .producer
            .list_queued(&self.context.queue_name)
            .await?;

        Ok(triggers
            .into_iter()
            .map(TaskListing::Scheduled)
            .chain(queued.into_iter().map(TaskListing::Queued))
            .collect())
    }

    pub async fn get_status(&self) -> AppResult<SchedulerStatus> {
        let queue_counts = self
            .context
            .store
            .queue_counts(&self.context.queue_name)
            .await?;
        let persisted = self.context.store.load_triggers().await?;
        let handles = self.handles.read().await;

        let triggers = persisted
            .into_iter()
            .map(|trigger| {
                let handle = handles.get(&trigger.task_id);
                TriggerStatus {
                    next_run: handle.and_then(TriggerHandle::next_run),
                    live: handle.is_some(),
                    task_id: trigger.task_id,
                    url: trigger.url,
                    schedule: trigger.schedule,
                    priority: trigger.priority,
                    depth: trigger.depth,
                    last_run: trigger.last_run,
                }
            })
            .collect();

        Ok(SchedulerStatus {
            queue: self.context.queue_name.clone(),
            paused: self.is_paused(),
            queue_counts,
            triggers,
            firings: self.context.stats.snapshot(),
        })
    }

    /// Skip trigger firings until resumed; definitions and handles are kept
    pub fn pause(&self) {
        if !self.context.paused.swap(true, Ordering::SeqCst) {
            info!("Scheduler paused");
        }
    }

    pub fn resume(&self) {
        if self.context.paused.swap(false, Ordering::SeqCst) {
            info!("Scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.context.paused.load(Ordering::SeqCst)
    }

    /// Drop all transient queue state and firing counters; returns entries removed
    pub async fn reset(&self) -> AppResult<usize> {
        let removed = self
            .context
            .store
            .clear_queue(&self.context.queue_name)
            .await?;
        self.context.stats.reset();
        info!(
            "Scheduler reset: cleared {} queue entries from '{}'",
            removed, self.context.queue_name
        );
        Ok(removed)
    }

    /// Fire a live trigger immediately, outside its schedule
    pub async fn fire_trigger(&self, trigger_id: &str) -> AppResult<String> {
        let trigger = self
            .handles
            .read()
            .await
            .get(trigger_id)
            .map(|handle| handle.trigger.clone())
            .ok_or_else(|| AppError::not_found("trigger", trigger_id))?;

        match self.context.fire(&trigger, Utc::now()).await {
            Ok(task_id) => {
                self.context.stats.fired.fetch_add(1, Ordering::Relaxed);
                Ok(task_id)
            }
            Err(e) => {
                self.context.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub async fn live_trigger_count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn live_trigger_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every live handle and background loop; persisted definitions stay
    ///
    /// Afterwards the scheduler holds the only store handles it ever shared,
    /// so dropping it releases its share of the store connection.
    pub async fn disconnect(&self) {
        self.shutdown.cancel();

        let handles: Vec<TriggerHandle> = self
            .handles
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let stopped = handles.len();
        for handle in handles {
            handle.token.cancel();
            if let Err(e) = handle.join.await {
                warn!("Trigger {} handle ended abnormally: {}", handle.trigger.task_id, e);
            }
        }

        for join in self.background.lock().await.drain(..) {
            if let Err(e) = join.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Scheduler disconnected ({} trigger handles stopped)", stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriorityClass, TaskState};
    use crate::store::InMemoryQueueStore;

    fn scheduler() -> (CrawlScheduler, Arc<InMemoryQueueStore>) {
        let store = Arc::new(InMemoryQueueStore::new());
        let producer = TaskProducer::new(store.clone());
        (CrawlScheduler::new(store.clone(), producer, "crawler", 2), store)
    }

    fn persisted(id: &str, last_run: Option<DateTime<Utc>>) -> Trigger {
        Trigger {
            task_id: id.to_string(),
            url: format!("https://{id}.example"),
            depth: 1,
            priority: PriorityClass::Normal,
            schedule: "0 * * * *".to_string(),
            last_run,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_one_time_crawl_is_enqueued_without_trigger() {
        let (scheduler, store) = scheduler();

        let id = scheduler
            .schedule_task(
                ScheduleRequest::once("https://a.example").with_priority(PriorityClass::High),
            )
            .await
            .unwrap();

        assert_eq!(
            store.task_state("crawler", &id).await.unwrap(),
            Some(TaskState::Pending)
        );
        let queued = store.list_queued("crawler").await.unwrap();
        assert_eq!(queued[0].depth, 2);
        assert!(store.load_triggers().await.unwrap().is_empty());
        assert_eq!(scheduler.live_trigger_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_url_is_rejected() {
        let (scheduler, store) = scheduler();

        let error = scheduler
            .schedule_task(ScheduleRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(error, AppError::Validation { .. }));
        assert_eq!(store.queue_counts("crawler").await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_has_no_side_effect() {
        let (scheduler, store) = scheduler();

        let error = scheduler
            .schedule_task(ScheduleRequest::recurring("https://a.example", "every hour"))
            .await
            .unwrap_err();

        assert!(matches!(error, AppError::Validation { .. }));
        assert!(store.load_triggers().await.unwrap().is_empty());
        assert_eq!(store.queue_counts("crawler").await.unwrap().pending, 0);
        assert_eq!(scheduler.live_trigger_count().await, 0);
    }

    #[tokio::test]
    async fn test_scheduled_crawl_only_creates_trigger() {
        let (scheduler, store) = scheduler();

        let id = scheduler
            .schedule_task(ScheduleRequest::recurring("https://a.example", "0 * * * *"))
            .await
            .unwrap();

        let triggers = store.load_triggers().await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].task_id, id);
        assert_eq!(store.queue_counts("crawler").await.unwrap().pending, 0);
        assert_eq!(scheduler.live_trigger_ids().await, vec![id]);
        scheduler.disconnect().await;
    }

    #[tokio::test]
    async fn test_firing_enqueues_linked_task_and_stamps_last_run() {
        let (scheduler, store) = scheduler();
        let trigger_id = scheduler
            .schedule_task(
                ScheduleRequest::recurring("https://a.example", "0 * * * *")
                    .with_priority(PriorityClass::Medium)
                    .with_depth(4),
            )
            .await
            .unwrap();

        let task_id = scheduler.fire_trigger(&trigger_id).await.unwrap();

        let queued = store.list_queued("crawler").await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].task_id, task_id);
        assert_eq!(queued[0].scheduled_task_id.as_deref(), Some(trigger_id.as_str()));
        assert_eq!(queued[0].priority, PriorityClass::Medium);
        assert_eq!(queued[0].depth, 4);
        assert!(task_id.starts_with(&format!("{trigger_id}-")));
        assert!(store.load_triggers().await.unwrap()[0].last_run.is_some());
        scheduler.disconnect().await;
    }

    #[tokio::test]
    async fn test_fire_unknown_trigger_is_not_found() {
        let (scheduler, _) = scheduler();
        let error = scheduler.fire_trigger("nope").await.unwrap_err();
        assert!(matches!(error, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (scheduler, store) = scheduler();
        let id = scheduler
            .schedule_task(ScheduleRequest::recurring("https://a.example", "0 * * * *"))
            .await
            .unwrap();

        assert_eq!(
            scheduler.cancel_task(&id).await.unwrap(),
            CancelOutcome::TriggerCancelled
        );
        assert_eq!(scheduler.cancel_task(&id).await.unwrap(), CancelOutcome::NotFound);
        assert_eq!(
            scheduler.cancel_task("never-existed").await.unwrap(),
            CancelOutcome::NotFound
        );
        assert_eq!(scheduler.live_trigger_count().await, 0);
        assert!(store.load_triggers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_task() {
        let (scheduler, store) = scheduler();
        let id = scheduler
            .schedule_task(ScheduleRequest::once("https://a.example"))
            .await
            .unwrap();

        assert_eq!(
            scheduler.cancel_task(&id).await.unwrap(),
            CancelOutcome::QueuedRemoved
        );
        assert_eq!(store.task_state("crawler", &id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_init_recovers_persisted_triggers() {
        let (scheduler, store) = scheduler();
        let last_run = Utc::now() - chrono::Duration::hours(3);
        for id in ["a", "b", "c"] {
            store.save_trigger(&persisted(id, Some(last_run))).await.unwrap();
        }
        assert_eq!(scheduler.live_trigger_count().await, 0);

        let registered = scheduler.init().await.unwrap();

        assert_eq!(registered, 3);
        assert_eq!(scheduler.live_trigger_ids().await, vec!["a", "b", "c"]);
        for trigger in store.load_triggers().await.unwrap() {
            assert_eq!(trigger.last_run, Some(last_run));
        }
        let status = scheduler.get_status().await.unwrap();
        assert!(status.triggers.iter().all(|t| t.live && t.next_run.is_some()));
        scheduler.disconnect().await;
        assert_eq!(scheduler.live_trigger_count().await, 0);
    }

    #[tokio::test]
    async fn test_init_skips_unparseable_definitions() {
        let (scheduler, store) = scheduler();
        store.save_trigger(&persisted("good", None)).await.unwrap();
        store
            .save_trigger(&Trigger {
                schedule: "garbage".to_string(),
                ..persisted("bad", None)
            })
            .await
            .unwrap();

        assert_eq!(scheduler.init().await.unwrap(), 1);
        // Still removable through cancel
        assert_eq!(
            scheduler.cancel_task("bad").await.unwrap(),
            CancelOutcome::TriggerCancelled
        );
        scheduler.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_leaves_no_store_handles_behind() {
        let (scheduler, store) = scheduler();
        scheduler
            .schedule_task(ScheduleRequest::recurring("https://a.example", "* * * * * *"))
            .await
            .unwrap();
        scheduler
            .schedule_task(ScheduleRequest::recurring("https://b.example", "0 * * * *"))
            .await
            .unwrap();

        scheduler.disconnect().await;
        drop(scheduler);

        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[tokio::test]
    async fn test_get_tasks_tags_entries() {
        let (scheduler, _) = scheduler();
        scheduler
            .schedule_task(ScheduleRequest::recurring("https://s.example", "0 * * * *"))
            .await
            .unwrap();
        scheduler
            .schedule_task(ScheduleRequest::once("https://q.example"))
            .await
            .unwrap();

        let listing = serde_json::to_value(scheduler.get_tasks().await.unwrap()).unwrap();

        assert_eq!(listing[0]["type"], "scheduled");
        assert_eq!(listing[0]["url"], "https://s.example");
        assert_eq!(listing[1]["type"], "queued");
        assert_eq!(listing[1]["url"], "https://q.example");
        scheduler.disconnect().await;
    }

    #[tokio::test]
    async fn test_pause_resume_and_reset() {
        let (scheduler, store) = scheduler();
        let trigger_id = scheduler
            .schedule_task(ScheduleRequest::recurring("https://s.example", "0 * * * *"))
            .await
            .unwrap();
        scheduler
            .schedule_task(ScheduleRequest::once("https://q.example"))
            .await
            .unwrap();
        scheduler.fire_trigger(&trigger_id).await.unwrap();

        scheduler.pause();
        assert!(scheduler.get_status().await.unwrap().paused);

        let removed = scheduler.reset().await.unwrap();
        // two tasks, each counted in priority and pending
        assert_eq!(removed, 4);
        let status = scheduler.get_status().await.unwrap();
        assert_eq!(status.queue_counts.pending, 0);
        assert_eq!(status.firings, FiringCounts::default());
        assert!(status.paused);
        assert_eq!(store.load_triggers().await.unwrap().len(), 1);
        assert_eq!(scheduler.live_trigger_count().await, 1);

        scheduler.resume();
        assert!(!scheduler.is_paused());
        scheduler.disconnect().await;
    }

    #[tokio::test]
    async fn test_every_second_trigger_fires_and_pause_skips() {
        let (scheduler, store) = scheduler();
        let trigger_id = scheduler
            .schedule_task(ScheduleRequest::recurring("https://tick.example", "* * * * * *"))
            .await
            .unwrap();

        for _ in 0..300 {
            if store.queue_counts("crawler").await.unwrap().pending > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let queued = store.list_queued("crawler").await.unwrap();
        assert!(!queued.is_empty());
        assert_eq!(queued[0].scheduled_task_id.as_deref(), Some(trigger_id.as_str()));

        scheduler.pause();
        // let a firing that passed the pause check before the flag flipped land first
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.reset().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.queue_counts("crawler").await.unwrap().pending, 0);
        assert!(scheduler.get_status().await.unwrap().firings.skipped >= 1);

        scheduler.disconnect().await;
    }
}
