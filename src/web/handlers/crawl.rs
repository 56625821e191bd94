//! Crawl submission HTTP handler

use axum::{
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::job_scheduling::ScheduleRequest;
use crate::web::{
    AppState,
    responses::{bad_request, created, handle_error},
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResponse {
    pub task_id: String,
    pub scheduled: bool,
    pub message: String,
}

/// `POST /crawl`: crawl once, or register a recurring trigger when `schedule` is set
pub async fn submit_crawl(
    State(state): State<AppState>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(&format!("Invalid request body: {}", rejection.body_text())),
    };

    let scheduled = request.schedule_expression().is_some();
    match state.scheduler.schedule_task(request).await {
        Ok(task_id) => created(CrawlResponse {
            task_id,
            scheduled,
            message: if scheduled {
                "Crawl scheduled".to_string()
            } else {
                "Crawl job queued".to_string()
            },
        })
        .into_response(),
        Err(e) => handle_error(e),
    }
}
