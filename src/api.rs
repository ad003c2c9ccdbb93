use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    clients::{health::HealthChecker, queue::QueueClient},
    models::{health::HealthStatus, message::QueueNames},
};

pub struct AppState {
    client: QueueClient,
    queues: QueueNames,
    health_checker: HealthChecker,
}

impl AppState {
    pub fn new(client: QueueClient, queues: QueueNames) -> Self {
        Self {
            health_checker: HealthChecker::new(client.clone(), queues.clone()),
            client,
            queues,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/queue/stats", get(queue_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the health and stats port up front so a busy port fails startup instead of
/// surfacing only at shutdown.
pub async fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health server on {}", addr))?;

    Ok(listener)
}

pub async fn run_api_server(
    state: AppState,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(Arc::new(state));

    info!(address = %listener.local_addr()?, "Health and stats server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.client.stats(&state.queues.all()).await)
}
