//! Scheduler control HTTP handler

use axum::{
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::job_scheduling::ControlAction;
use crate::web::{
    AppState,
    responses::{bad_request, handle_error, ok},
};

#[derive(Debug, Default, Deserialize)]
pub struct ControlRequest {
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub action: ControlAction,
    pub paused: bool,
    /// Queue entries dropped by a reset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    pub message: String,
}

/// `POST /control`: pause, resume or reset the scheduler
pub async fn control(
    State(state): State<AppState>,
    payload: Result<Json<ControlRequest>, JsonRejection>,
) -> Response {
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    let Some(raw_action) = request.action.filter(|action| !action.trim().is_empty()) else {
        return bad_request("Action is required");
    };
    let Ok(action) = ControlAction::from_str(raw_action.trim()) else {
        return bad_request(&format!(
            "Invalid action '{raw_action}'. Must be pause, resume, or reset"
        ));
    };

    let scheduler = &state.scheduler;
    let removed = match action {
        ControlAction::Pause => {
            scheduler.pause();
            None
        }
        ControlAction::Resume => {
            scheduler.resume();
            None
        }
        ControlAction::Reset => match scheduler.reset().await {
            Ok(removed) => Some(removed),
            Err(e) => return handle_error(e),
        },
    };

    ok(ControlResponse {
        action,
        paused: scheduler.is_paused(),
        removed,
        message: format!("Scheduler {action} completed"),
    })
    .into_response()
}
