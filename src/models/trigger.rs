//! Recurring trigger definition persisted in the trigger hash

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{PriorityClass, Task, TaskDraft};

/// A cron-driven definition that produces a fresh [`Task`] on every firing
///
/// Triggers never enter the queue themselves. Tasks spawned from a trigger
/// reference it through `scheduledTaskId` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub task_id: String,
    pub url: String,
    pub depth: u32,
    #[serde(default)]
    pub priority: PriorityClass,
    pub schedule: String,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// Id of the task spawned by a firing at `fired_at`
    pub fn firing_task_id(&self, fired_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}",
            self.task_id,
            fired_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        )
    }

    /// Draft for the one-time task a firing at `fired_at` enqueues
    pub fn firing_draft(&self, fired_at: DateTime<Utc>) -> TaskDraft {
        TaskDraft::new(self.url.clone(), self.depth)
            .with_task_id(self.firing_task_id(fired_at))
            .with_scheduled_task_id(self.task_id.clone())
    }
}

/// Entry returned by the task listing
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskListing {
    Scheduled(Trigger),
    Queued(Task),
}
