//! In-process store backend
//!
//! Mirrors the Redis layout closely enough to exercise every component
//! without a server, and backs the `--store memory` development mode. Each
//! trait call takes the single lock once, which gives it the same atomicity
//! as the Redis scripts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{QueueCounts, QueueStore, TerminalEntry};
use crate::errors::StoreResult;
use crate::models::{CompletedTask, FailedTask, Task, TaskState, TerminalKind, Trigger};

#[derive(Debug, Clone)]
struct RankedTask {
    rank: u8,
    seq: u64,
    task: Task,
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct QueueState {
    priority: Vec<RankedTask>,
    pending: HashSet<String>,
    processing: HashSet<String>,
    completed: HashMap<String, Expiring<CompletedTask>>,
    failed: HashMap<String, Expiring<FailedTask>>,
}

impl QueueState {
    fn insert(&mut self, task: &Task, rank: u8, seq: u64) {
        // Sorted-set semantics: an identical member only has its score updated
        if let Some(existing) = self.priority.iter_mut().find(|entry| entry.task == *task) {
            existing.rank = rank;
        } else {
            self.priority.push(RankedTask {
                rank,
                seq,
                task: task.clone(),
            });
        }
        self.pending.insert(task.task_id.clone());
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        self.completed.retain(|_, entry| entry.live(now));
        self.failed.retain(|_, entry| entry.live(now));
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    triggers: HashMap<String, Trigger>,
    next_seq: u64,
}

impl Inner {
    fn queue(&mut self, queue: &str) -> &mut QueueState {
        self.queues.entry(queue.to_string()).or_default()
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// [`QueueStore`] held entirely in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let seq = inner.seq();
        inner.queue(queue).insert(task, rank, seq);
        Ok(())
    }

    async fn claim_highest(&self, queue: &str) -> StoreResult<Option<Task>> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);

        let best = state
            .priority
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.rank.cmp(&b.rank).then(b.seq.cmp(&a.seq)))
            .map(|(index, _)| index);

        let Some(index) = best else {
            return Ok(None);
        };

        let entry = state.priority.remove(index);
        state.pending.remove(&entry.task.task_id);
        state.processing.insert(entry.task.task_id.clone());
        Ok(Some(entry.task))
    }

    async fn remove_task(&self, queue: &str, task_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);

        let before = state.priority.len();
        state.priority.retain(|entry| entry.task.task_id != task_id);
        let removed = state.priority.len() != before;
        let unmarked = state.pending.remove(task_id);
        Ok(removed || unmarked)
    }

    async fn list_queued(&self, queue: &str) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let Some(state) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<&RankedTask> = state.priority.iter().collect();
        entries.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.seq.cmp(&b.seq)));
        Ok(entries.into_iter().map(|entry| entry.task.clone()).collect())
    }

    async fn requeue_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let seq = inner.seq();
        let state = inner.queue(queue);
        state.processing.remove(&task.task_id);
        state.insert(task, rank, seq);
        Ok(())
    }

    async fn record_completed(
        &self,
        queue: &str,
        record: &CompletedTask,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);
        state.processing.remove(&record.task.task_id);
        state.completed.insert(
            record.task.task_id.clone(),
            Expiring {
                value: record.clone(),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn record_failed(
        &self,
        queue: &str,
        record: &FailedTask,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);
        state.processing.remove(&record.task.task_id);
        state.failed.insert(
            record.task.task_id.clone(),
            Expiring {
                value: record.clone(),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn terminal_entries(
        &self,
        queue: &str,
        kind: TerminalKind,
    ) -> StoreResult<Vec<TerminalEntry>> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);
        state.evict_expired(Utc::now());

        let entries = match kind {
            TerminalKind::Completed => state
                .completed
                .values()
                .map(|entry| TerminalEntry::from(&entry.value))
                .collect(),
            TerminalKind::Failed => state
                .failed
                .values()
                .map(|entry| TerminalEntry::from(&entry.value))
                .collect(),
        };
        Ok(entries)
    }

    async fn terminal_record(
        &self,
        queue: &str,
        kind: TerminalKind,
        task_id: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);
        state.evict_expired(Utc::now());

        let record = match kind {
            TerminalKind::Completed => state
                .completed
                .get(task_id)
                .map(|entry| serde_json::to_value(&entry.value))
                .transpose()?,
            TerminalKind::Failed => state
                .failed
                .get(task_id)
                .map(|entry| serde_json::to_value(&entry.value))
                .transpose()?,
        };
        Ok(record)
    }

    async fn purge_terminal(
        &self,
        queue: &str,
        kind: TerminalKind,
        task_ids: &[String],
    ) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);

        let removed = task_ids
            .iter()
            .filter(|id| match kind {
                TerminalKind::Completed => state.completed.remove(id.as_str()).is_some(),
                TerminalKind::Failed => state.failed.remove(id.as_str()).is_some(),
            })
            .count();
        Ok(removed)
    }

    async fn task_state(&self, queue: &str, task_id: &str) -> StoreResult<Option<TaskState>> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);
        state.evict_expired(Utc::now());

        let found = if state.processing.contains(task_id) {
            Some(TaskState::Processing)
        } else if state.pending.contains(task_id) {
            Some(TaskState::Pending)
        } else if state.completed.contains_key(task_id) {
            Some(TaskState::Completed)
        } else if state.failed.contains_key(task_id) {
            Some(TaskState::Failed)
        } else {
            None
        };
        Ok(found)
    }

    async fn queue_counts(&self, queue: &str) -> StoreResult<QueueCounts> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);
        state.evict_expired(Utc::now());

        Ok(QueueCounts {
            priority: state.priority.len(),
            pending: state.pending.len(),
            processing: state.processing.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }

    async fn clear_queue(&self, queue: &str) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let state = inner.queue(queue);

        let removed = state.priority.len() + state.pending.len() + state.processing.len();
        state.priority.clear();
        state.pending.clear();
        state.processing.clear();
        Ok(removed)
    }

    async fn save_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .triggers
            .insert(trigger.task_id.clone(), trigger.clone());
        Ok(())
    }

    async fn update_trigger(&self, trigger: &Trigger) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.triggers.get_mut(&trigger.task_id) {
            Some(existing) => {
                *existing = trigger.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_triggers(&self) -> StoreResult<Vec<Trigger>> {
        let inner = self.inner.read().await;
        let mut triggers: Vec<Trigger> = inner.triggers.values().cloned().collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    async fn delete_trigger(&self, trigger_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.triggers.remove(trigger_id).is_some())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
