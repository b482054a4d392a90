//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, consumer status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status with delivery counters
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (at least one consumer running)
//! - `GET /metrics` - Prometheus metrics in text format

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::QueueDepth;
use crate::application::services::PoolActivity;
use crate::infrastructure::metrics::{RecordingMetricsSink, get_metrics_handle, set_pool_state};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Consumer pool status.
    pub consumers: ConsumerStatus,
    /// Consumer queue depth.
    pub queue: QueueStatus,
    /// Delivery counters.
    pub deliveries: DeliveryStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Consumers running and keeping up.
    Healthy,
    /// Consumers running but the backlog exceeds their credit.
    Degraded,
    /// No consumer running.
    Unhealthy,
}

/// Consumer pool status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsumerStatus {
    /// Workers currently running.
    pub active: usize,
    /// Deliveries handled since start.
    pub deliveries_handled: u64,
}

/// Consumer queue depth.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    /// Messages waiting.
    pub backlog: usize,
    /// Messages delivered but not settled.
    pub unacked: usize,
}

/// Delivery counters.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatus {
    /// Deliveries processed.
    pub processed: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries nacked.
    pub nacked: u64,
    /// Deliveries dead-lettered.
    pub dead_lettered: u64,
    /// Processed count per outcome.
    pub outcomes: BTreeMap<&'static str, u64>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    metrics: Arc<RecordingMetricsSink>,
    queue: Arc<dyn QueueDepth>,
    activity: PoolActivity,
    backlog_threshold: usize,
}

impl HealthServerState {
    /// Create new health server state.
    ///
    /// `backlog_threshold` is the backlog above which the service reports
    /// itself degraded.
    #[must_use]
    pub fn new(
        version: String,
        metrics: Arc<RecordingMetricsSink>,
        queue: Arc<dyn QueueDepth>,
        activity: PoolActivity,
        backlog_threshold: usize,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            metrics,
            queue,
            activity,
            backlog_threshold,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.activity.active_workers() > 0 {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            set_pool_state(
                state.activity.active_workers(),
                state.queue.backlog(),
                state.queue.unacked(),
            );
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let consumers = ConsumerStatus {
        active: state.activity.active_workers(),
        deliveries_handled: state.activity.deliveries_handled(),
    };
    let queue = QueueStatus {
        backlog: state.queue.backlog(),
        unacked: state.queue.unacked(),
    };
    let totals = state.metrics.totals();

    HealthResponse {
        status: determine_health_status(consumers, queue, state.backlog_threshold),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        consumers,
        queue,
        deliveries: DeliveryStatus {
            processed: totals.processed,
            acked: totals.acked,
            nacked: totals.nacked,
            dead_lettered: totals.dead_lettered,
            outcomes: state.metrics.outcome_totals(),
        },
    }
}

fn determine_health_status(
    consumers: ConsumerStatus,
    queue: QueueStatus,
    backlog_threshold: usize,
) -> HealthStatus {
    if consumers.active == 0 {
        HealthStatus::Unhealthy
    } else if queue.backlog > backlog_threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::MetricsSink;
    use crate::domain::lifecycle::{DeliveryAction, Outcome};

    struct FixedDepth(usize);

    impl QueueDepth for FixedDepth {
        fn backlog(&self) -> usize {
            self.0
        }

        fn unacked(&self) -> usize {
            0
        }
    }

    fn state(backlog: usize) -> (Arc<RecordingMetricsSink>, Arc<HealthServerState>) {
        let metrics = Arc::new(RecordingMetricsSink::new());
        let state = HealthServerState::new(
            "0.1.0".to_string(),
            Arc::clone(&metrics),
            Arc::new(FixedDepth(backlog)),
            PoolActivity::default(),
            100,
        );
        (metrics, Arc::new(state))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn status_follows_workers_and_backlog() {
        let queue = |backlog| QueueStatus {
            backlog,
            unacked: 0,
        };
        let workers = |active| ConsumerStatus {
            active,
            deliveries_handled: 0,
        };

        assert_eq!(
            determine_health_status(workers(0), queue(0), 10),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            determine_health_status(workers(2), queue(11), 10),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(workers(2), queue(10), 10),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let (_, state) = state(0);
        let (status, body) = get(state, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn not_ready_without_consumers() {
        let (_, state) = state(0);
        let (status, _) = get(state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_outcome_counters() {
        let (metrics, state) = state(3);
        metrics.record_delivery("ticker", Outcome::Success, DeliveryAction::Ack);
        metrics.record_delivery("unknown", Outcome::MissingType, DeliveryAction::Ack);

        let (status, body) = get(state, "/health").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["queue"]["backlog"], 3);
        assert_eq!(json["deliveries"]["processed"], 2);
        assert_eq!(json["deliveries"]["outcomes"]["success"], 1);
        assert_eq!(json["deliveries"]["outcomes"]["missing_type"], 1);
        assert_eq!(json["deliveries"]["outcomes"]["duplicate"], 0);
    }
}
