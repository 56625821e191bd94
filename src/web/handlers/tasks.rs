//! Task listing, lookup and cancellation HTTP handlers

use axum::{
    extract::{Path, State},
    response::Response,
};
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::job_scheduling::CancelOutcome;
use crate::models::{TaskListing, TaskState, TerminalKind};
use crate::web::{AppState, responses::handle_result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListResponse {
    pub total: usize,
    pub tasks: Vec<TaskListing>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetailResponse {
    pub task_id: String,
    pub state: TaskState,
    /// Completed or failed record, when the task has finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub task_id: String,
    pub outcome: CancelOutcome,
}

/// `GET /tasks`: persisted triggers tagged `scheduled`, pending tasks tagged `queued`
pub async fn list_tasks(State(state): State<AppState>) -> Response {
    let result = state
        .scheduler
        .get_tasks()
        .await
        .map(|tasks| TaskListResponse {
            total: tasks.len(),
            tasks,
        });
    handle_result(result)
}

/// `GET /tasks/{id}`
pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    handle_result(lookup_task(&state, task_id).await)
}

async fn lookup_task(state: &AppState, task_id: String) -> AppResult<TaskDetailResponse> {
    let queue = state.scheduler.queue_name();
    let task_state = state
        .store
        .task_state(queue, &task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task", &task_id))?;

    let record = match task_state {
        TaskState::Completed => {
            state
                .store
                .terminal_record(queue, TerminalKind::Completed, &task_id)
                .await?
        }
        TaskState::Failed => {
            state
                .store
                .terminal_record(queue, TerminalKind::Failed, &task_id)
                .await?
        }
        TaskState::Pending | TaskState::Processing => None,
    };

    Ok(TaskDetailResponse {
        task_id,
        state: task_state,
        record,
    })
}

/// `DELETE /tasks/{id}`: idempotent, unknown ids succeed
pub async fn cancel_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let result = state
        .scheduler
        .cancel_task(&task_id)
        .await
        .map(|outcome| CancelResponse { task_id, outcome });
    handle_result(result)
}
