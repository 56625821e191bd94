//! Task producer: the only writer of new queue entries

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::RETRY_RANK;
use crate::errors::AppResult;
use crate::models::{PriorityClass, Task, TaskDraft};
use crate::store::QueueStore;

/// Appends tasks to a queue's priority and pending structures
///
/// Holds no state of its own; every call is one store operation and store
/// failures are returned to the caller unchanged.
#[derive(Clone)]
pub struct TaskProducer {
    store: Arc<dyn QueueStore>,
}

impl TaskProducer {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Enqueue a new task and return its id
    pub async fn enqueue(
        &self,
        queue: &str,
        draft: TaskDraft,
        priority: PriorityClass,
    ) -> AppResult<String> {
        let task_id = draft
            .task_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let task = Task {
            task_id: task_id.clone(),
            url: draft.url,
            depth: draft.depth,
            priority,
            retry_count: 0,
            last_error: None,
            last_retry_at: None,
            created_at: Utc::now(),
            scheduled_task_id: draft.scheduled_task_id,
        };

        self.store.push_task(queue, &task, priority.rank()).await?;
        info!(
            "Enqueued task {} for {} (priority: {}, rank: {})",
            task_id,
            task.url,
            priority,
            priority.rank()
        );
        Ok(task_id)
    }

    /// Put a failed task back in the queue at the retry rank
    pub async fn requeue(&self, queue: &str, task: &Task) -> AppResult<()> {
        self.store.requeue_task(queue, task, RETRY_RANK).await?;
        info!(
            "Requeued task {} for retry {} at rank {}",
            task.task_id, task.retry_count, RETRY_RANK
        );
        Ok(())
    }

    /// Remove a pending task; returns whether it was found
    pub async fn remove(&self, queue: &str, task_id: &str) -> AppResult<bool> {
        let removed = self.store.remove_task(queue, task_id).await?;
        if removed {
            info!("Removed task {} from queue {}", task_id, queue);
        } else {
            debug!("Task {} not pending in queue {}", task_id, queue);
        }
        Ok(removed)
    }

    pub async fn list_queued(&self, queue: &str) -> AppResult<Vec<Task>> {
        Ok(self.store.list_queued(queue).await?)
    }
}
