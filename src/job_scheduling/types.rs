//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::PriorityClass;
use crate::store::QueueCounts;

/// Rank every retried task re-enters the queue with, whatever its original class
pub const RETRY_RANK: u8 = 1;

/// Request to crawl a url once, or on a schedule when `schedule` is set
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub priority: Option<PriorityClass>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub schedule: Option<String>,
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub task_id: Option<String>,
}

impl ScheduleRequest {
    pub fn once(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn recurring(url: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            schedule: Some(schedule.into()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Schedule with surrounding whitespace removed, `None` when blank
    pub fn schedule_expression(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|expression| !expression.is_empty())
    }
}

/// Operator actions accepted by the control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Reset,
}

/// What a cancel call ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CancelOutcome {
    /// A live trigger was stopped and its definition deleted
    TriggerCancelled,
    /// A pending task was removed from the queue
    QueuedRemoved,
    /// Nothing matched; the call is still successful
    NotFound,
}

/// Counters for trigger firings since startup or the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiringCounts {
    pub fired: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// A persisted trigger together with its live handle state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    pub task_id: String,
    pub url: String,
    pub schedule: String,
    pub priority: PriorityClass,
    pub depth: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// Whether a firing handle is registered in this process
    pub live: bool,
}

/// Snapshot returned by the scheduler status operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub queue: String,
    pub paused: bool,
    pub queue_counts: QueueCounts,
    pub triggers: Vec<TriggerStatus>,
    pub firings: FiringCounts,
}

/// Consumer pool execution statistics
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub running: bool,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_control_action_parsing() {
        assert_eq!(ControlAction::from_str("pause").unwrap(), ControlAction::Pause);
        assert_eq!(ControlAction::from_str("reset").unwrap(), ControlAction::Reset);
        assert!(ControlAction::from_str("explode").is_err());
    }

    #[test]
    fn test_blank_schedule_means_one_time() {
        let request = ScheduleRequest {
            schedule: Some("   ".to_string()),
            ..ScheduleRequest::once("https://a.example")
        };
        assert!(request.schedule_expression().is_none());

        let request = ScheduleRequest::recurring("https://a.example", " 0 * * * * ");
        assert_eq!(request.schedule_expression(), Some("0 * * * *"));
    }

    #[test]
    fn test_schedule_request_deserializes_camel_case() {
        let request: ScheduleRequest = serde_json::from_str(
            r#"{"url":"https://a.example","priority":"high","depth":4,"taskId":"mine"}"#,
        )
        .unwrap();
        assert_eq!(request.priority, Some(PriorityClass::High));
        assert_eq!(request.depth, Some(4));
        assert_eq!(request.task_id.as_deref(), Some("mine"));
    }
}
