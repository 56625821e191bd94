//! Crawl task model and its terminal records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Priority class requested for a crawl
///
/// Unknown or missing classes fall back to `Normal`, matching the behaviour
/// of the gateway which forwards whatever the client sent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PriorityClass {
    High,
    Medium,
    #[default]
    #[serde(other)]
    Normal,
}

impl PriorityClass {
    /// Rank used as the sorted-set score; higher ranks are claimed first
    pub fn rank(self) -> u8 {
        match self {
            PriorityClass::High => 3,
            PriorityClass::Medium => 2,
            PriorityClass::Normal => 1,
        }
    }
}

/// One unit of crawl work
///
/// The serialized form of this struct is the sorted-set member stored under
/// `<queue>:priority`, so field names follow the wire format shared with the
/// other platform services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub url: String,
    pub depth: u32,
    #[serde(default)]
    pub priority: PriorityClass,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Id of the trigger that produced this task. Lookup key only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_task_id: Option<String>,
}

impl Task {
    /// Copy of this task prepared for another attempt after `error`
    pub fn next_attempt(&self, error: &str, now: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(error.to_string()),
            last_retry_at: Some(now),
            ..self.clone()
        }
    }
}

/// Caller-supplied fields for a new task
///
/// The producer fills in `taskId` (when absent) and `createdAt`.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub task_id: Option<String>,
    pub url: String,
    pub depth: u32,
    pub scheduled_task_id: Option<String>,
}

impl TaskDraft {
    pub fn new(url: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            depth,
            ..Default::default()
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_scheduled_task_id(mut self, scheduled_task_id: impl Into<String>) -> Self {
        self.scheduled_task_id = Some(scheduled_task_id.into());
        self
    }
}

/// Record written to `<queue>:completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTask {
    #[serde(flatten)]
    pub task: Task,
    pub completed_at: DateTime<Utc>,
    /// Extraction worker response body, verbatim
    pub result: serde_json::Value,
}

/// Record written to `<queue>:failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    #[serde(flatten)]
    pub task: Task,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// Which terminal hash a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TerminalKind {
    Completed,
    Failed,
}

/// Membership set a task currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}
