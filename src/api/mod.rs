//! HTTP submission and lookup API.
//!
//! Routes:
//!
//! - `POST /task`: validate a submission and enqueue it
//! - `GET /task/:id`: result record, pending marker, or 404
//! - `GET /results/:class`: newest committed records for a queue class
//! - `GET /health`: queue connectivity check
//! - `GET /metrics`: Prometheus text export
//!
//! Errors are returned as `{"error": "..."}` with a matching status code.

pub mod tasks;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::{metrics_handler, MetricsCollector};
use crate::scheduler::{QueueClass, QueuePair};
use crate::store::ResultStore;

pub use tasks::{SubmitRequest, SubmitResponse};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueuePair>,
    pub store: Arc<dyn ResultStore>,
    pub metrics: MetricsCollector,
}

impl AppState {
    pub fn new(queue: Arc<dyn QueuePair>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            queue,
            store,
            metrics: MetricsCollector::new(),
        }
    }
}

/// Error body returned by every failing route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors a handler can return.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Redis (queue or store) could not be reached.
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Builds the router with CORS and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/task", post(tasks::submit_task))
        .route("/task/:id", get(tasks::get_task))
        .route("/results/:class", get(tasks::recent_results))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Submission API listening");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    run_queue: usize,
    submit_queue: usize,
}

/// GET /health - Reports queue depths, or 503 when Redis is unreachable.
async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let depth = |class: QueueClass| {
        let queue = Arc::clone(&state.queue);
        async move {
            queue.len(class).await.map_err(|e| {
                tracing::warn!(queue = %class, error = %e, "Health check failed");
                ApiError::Unavailable("Queue unavailable".to_string())
            })
        }
    };

    Ok(Json(HealthResponse {
        status: "ok",
        run_queue: depth(QueueClass::Run).await?,
        submit_queue: depth(QueueClass::Submit).await?,
    }))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::scheduler::{MemoryQueuePair, Task};
    use crate::store::MemoryResultStore;

    #[tokio::test]
    async fn test_health_reports_queue_depths() {
        let queue = Arc::new(MemoryQueuePair::new());
        queue
            .enqueue(QueueClass::Submit, &Task::new("s1", "python", "x", QueueClass::Submit))
            .await
            .unwrap();
        let app = router(AppState::new(queue, Arc::new(MemoryResultStore::default())));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["runQueue"], 0);
        assert_eq!(json["submitQueue"], 1);
    }

    #[tokio::test]
    async fn test_metrics_route_serves_text() {
        let _ = crate::metrics::init_metrics();
        let app = router(AppState::new(
            Arc::new(MemoryQueuePair::new()),
            Arc::new(MemoryResultStore::default()),
        ));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!String::from_utf8_lossy(&body).starts_with("# Error"));
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
