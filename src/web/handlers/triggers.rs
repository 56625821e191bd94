//! Manual trigger firing HTTP handler

use axum::{
    extract::{Path, State},
    response::Response,
};
use serde::Serialize;

use crate::web::{AppState, responses::handle_result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FireResponse {
    pub scheduled_task_id: String,
    pub task_id: String,
}

/// `POST /triggers/{id}/fire`: run a live trigger now, outside its schedule
pub async fn fire_trigger(
    State(state): State<AppState>,
    Path(trigger_id): Path<String>,
) -> Response {
    let result = state
        .scheduler
        .fire_trigger(&trigger_id)
        .await
        .map(|task_id| FireResponse {
            scheduled_task_id: trigger_id,
            task_id,
        });
    handle_result(result)
}
