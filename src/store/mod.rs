//! Durable shared store abstraction
//!
//! Queue state and trigger definitions live in a Redis-like store. Every
//! state transition of a task is a single call on [`QueueStore`] so that
//! implementations can make it atomic (a pipeline or a server-side script).
//!
//! Key layout for a queue named `crawler`:
//!
//! | key                    | type       | contents                       |
//! |------------------------|------------|--------------------------------|
//! | `crawler:priority`     | sorted set | serialized task, score = rank  |
//! | `crawler:pending`      | set        | task ids waiting to be claimed |
//! | `crawler:processing`   | set        | task ids claimed by a slot     |
//! | `crawler:completed`    | hash       | task id -> completed record    |
//! | `crawler:failed`       | hash       | task id -> failed record       |
//!
//! Triggers are kept in a single hash (`scheduler:tasks` by default) with no
//! expiry.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::errors::StoreResult;
use crate::models::{CompletedTask, FailedTask, Task, TaskState, TerminalKind, Trigger};

pub use self::memory::InMemoryQueueStore;
pub use self::redis::RedisQueueStore;

/// Names of the store keys backing one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub priority: String,
    pub pending: String,
    pub processing: String,
    pub completed: String,
    pub failed: String,
}

impl QueueKeys {
    pub fn new(queue: &str) -> Self {
        Self {
            priority: format!("{queue}:priority"),
            pending: format!("{queue}:pending"),
            processing: format!("{queue}:processing"),
            completed: format!("{queue}:completed"),
            failed: format!("{queue}:failed"),
        }
    }

    pub fn terminal(&self, kind: TerminalKind) -> &str {
        match kind {
            TerminalKind::Completed => &self.completed,
            TerminalKind::Failed => &self.failed,
        }
    }
}

/// Size of each membership structure of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub priority: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Terminal record reduced to what the retention sweep needs
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalEntry {
    pub task_id: String,
    pub finished_at: DateTime<Utc>,
}

impl From<&CompletedTask> for TerminalEntry {
    fn from(record: &CompletedTask) -> Self {
        Self {
            task_id: record.task.task_id.clone(),
            finished_at: record.completed_at,
        }
    }
}

impl From<&FailedTask> for TerminalEntry {
    fn from(record: &FailedTask) -> Self {
        Self {
            task_id: record.task.task_id.clone(),
            finished_at: record.failed_at,
        }
    }
}

/// Operations the scheduler needs from the durable store
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Add a task to `<queue>:priority` with `rank` and its id to `<queue>:pending`
    async fn push_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()>;

    /// Atomically pop the highest-ranked task and move its id from pending to processing
    async fn claim_highest(&self, queue: &str) -> StoreResult<Option<Task>>;

    /// Delete a pending task by id; returns whether anything was removed
    async fn remove_task(&self, queue: &str, task_id: &str) -> StoreResult<bool>;

    /// Pending tasks, highest rank first
    async fn list_queued(&self, queue: &str) -> StoreResult<Vec<Task>>;

    /// Atomically leave processing and re-enter the priority/pending structures
    async fn requeue_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()>;

    /// Atomically leave processing and write a completed record expiring after `ttl`
    async fn record_completed(
        &self,
        queue: &str,
        record: &CompletedTask,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Atomically leave processing and write a failed record expiring after `ttl`
    async fn record_failed(&self, queue: &str, record: &FailedTask, ttl: Duration)
    -> StoreResult<()>;

    /// Id and completion time of every terminal record of `kind`
    async fn terminal_entries(
        &self,
        queue: &str,
        kind: TerminalKind,
    ) -> StoreResult<Vec<TerminalEntry>>;

    /// Raw terminal record for one task
    async fn terminal_record(
        &self,
        queue: &str,
        kind: TerminalKind,
        task_id: &str,
    ) -> StoreResult<Option<serde_json::Value>>;

    /// Delete terminal records by id; returns how many existed
    async fn purge_terminal(
        &self,
        queue: &str,
        kind: TerminalKind,
        task_ids: &[String],
    ) -> StoreResult<usize>;

    /// Which membership structure currently holds `task_id`
    async fn task_state(&self, queue: &str, task_id: &str) -> StoreResult<Option<TaskState>>;

    async fn queue_counts(&self, queue: &str) -> StoreResult<QueueCounts>;

    /// Drop priority, pending and processing contents; returns entries removed
    async fn clear_queue(&self, queue: &str) -> StoreResult<usize>;

    /// Insert or overwrite a trigger definition
    async fn save_trigger(&self, trigger: &Trigger) -> StoreResult<()>;

    /// Overwrite a trigger only if it is still persisted; returns whether it was
    async fn update_trigger(&self, trigger: &Trigger) -> StoreResult<bool>;

    async fn load_triggers(&self) -> StoreResult<Vec<Trigger>>;

    /// Returns whether a definition was deleted
    async fn delete_trigger(&self, trigger_id: &str) -> StoreResult<bool>;

    /// Round-trip check used by health reporting
    async fn ping(&self) -> StoreResult<()>;
}
