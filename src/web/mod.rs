//! Web layer module
//!
//! Thin axum handlers over the scheduling subsystem. Handlers validate the
//! request at the boundary, delegate to [`CrawlScheduler`] or the store and
//! map [`AppError`](crate::errors::AppError) to status codes through
//! [`responses::handle_error`].

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::job_scheduling::{ConsumerPool, CrawlScheduler};
use crate::store::QueueStore;

pub mod handlers;
pub mod responses;

pub use responses::{ApiResponse, handle_error, handle_result};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<CrawlScheduler>,
    pub consumer: Arc<ConsumerPool>,
    pub store: Arc<dyn QueueStore>,
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self {
            app: router(state),
            addr,
        })
    }

    /// Serve until `cancellation_token` fires, reporting bind success or failure first
    pub async fn serve_with_cancellation(
        self,
        ready_signal: tokio::sync::oneshot::Sender<Result<()>>,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        match tokio::net::TcpListener::bind(&self.addr).await {
            Ok(listener) => {
                let _ = ready_signal.send(Ok(()));
                info!("Web server listening on {}", self.addr);

                let shutdown_signal = async move {
                    cancellation_token.cancelled().await;
                    info!("Web server received cancellation signal, shutting down gracefully");
                };

                axum::serve(listener, self.app)
                    .with_graceful_shutdown(shutdown_signal)
                    .await?;
                Ok(())
            }
            Err(bind_error) => {
                let bind_err_msg = format!("Failed to bind to {}: {}", self.addr, bind_error);
                let _ = ready_signal.send(Err(anyhow::anyhow!("{}", bind_err_msg)));
                Err(anyhow::anyhow!("{}", bind_err_msg))
            }
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/crawl", post(handlers::crawl::submit_crawl))
        .route("/status", get(handlers::status::get_status))
        .route("/control", post(handlers::control::control))
        .route("/tasks", get(handlers::tasks::list_tasks))
        .route(
            "/tasks/{id}",
            get(handlers::tasks::get_task).delete(handlers::tasks::cancel_task),
        )
        .route("/triggers/{id}/fire", post(handlers::triggers::fire_trigger))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
