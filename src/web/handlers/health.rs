//! Health check HTTP handler

use axum::{extract::State, response::IntoResponse};
use serde::Serialize;
use tracing::warn;

use crate::web::{AppState, responses::ok};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// `up` when the store answered a ping
    pub store: &'static str,
    pub live_triggers: usize,
}

/// Health check endpoint
///
/// Always answers 200 with `status: ok` while the process serves requests;
/// store reachability is reported separately.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.store.ping().await {
        Ok(()) => "up",
        Err(e) => {
            warn!("Store ping failed: {}", e);
            "down"
        }
    };

    ok(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        store,
        live_triggers: state.scheduler.live_trigger_count().await,
    })
}
