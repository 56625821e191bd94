//! Scheduler status HTTP handler

use axum::{extract::State, response::Response};
use serde::Serialize;

use crate::job_scheduling::{ExecutionStats, SchedulerStatus};
use crate::web::{AppState, responses::handle_result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
    pub consumer: ExecutionStats,
}

/// `GET /status`
pub async fn get_status(State(state): State<AppState>) -> Response {
    let result = state
        .scheduler
        .get_status()
        .await
        .map(|scheduler| StatusResponse {
            scheduler,
            consumer: state.consumer.execution_stats(),
        });
    handle_result(result)
}
